//! Masking-View Orchestrator - The attach/detach entry points
//!
//! Composes the naming, hardware-ID and group resolvers into the attach state
//! machine:
//!
//! ```text
//! RESOLVE_DEFAULT_GROUP -> RESOLVE_DEVICE_GROUP -> RESOLVE_PORT_GROUP
//!   -> RESOLVE_INITIATOR_GROUP -> ADD_VOLUME_TO_DEVICE_GROUP
//!   -> RESOLVE_OR_CREATE_MASKING_VIEW -> DONE
//! ```
//!
//! An attach runs entirely under the named lock of its masking view. Any
//! failure after the first mutation hands the attempt's [`RollbackContext`] to
//! the rollback manager. Detach is delegated to the teardown pipeline.

use crate::config::OrchestratorConfig;
use crate::controlplane::client::ArrayClient;
use crate::controlplane::jobs::JobWaiter;
use crate::controlplane::locks::NamedLockRegistry;
use crate::controlplane::rollback::{ReplacedView, RollbackContext, RollbackManager, SetupStep};
use crate::controlplane::teardown::TeardownPipeline;
use crate::domain::ports::{
    ArrayOperation, ArrayTransportRef, ObjectKind, Protocol, ResourceHandle, TieringDescriptor,
};
use crate::domain::request::{HostConnector, MaskingViewOutcome, MaskingViewRequest, TeardownReport};
use crate::error::{Error, Result};
use crate::metrics::{
    MaskingMetrics, OUTCOME_FAILURE, OUTCOME_ROLLBACK_FAILED, OUTCOME_ROLLED_BACK, OUTCOME_SUCCESS,
};
use crate::resolvers::groups::GroupResolver;
use crate::resolvers::naming::NamingResolver;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Masking view bound to the request's device group
struct BoundView {
    view: ResourceHandle,
    initiator_group: ResourceHandle,
    port_group: ResourceHandle,
    reused: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Attach and detach volumes through masking views
#[derive(Debug)]
pub struct MaskingOrchestrator {
    config: OrchestratorConfig,
    naming: NamingResolver,
    client: ArrayClient,
    groups: GroupResolver,
    rollback: RollbackManager,
    teardown: TeardownPipeline,
    locks: Arc<NamedLockRegistry>,
    metrics: MaskingMetrics,
}

impl MaskingOrchestrator {
    /// Create an orchestrator with its own lock registry
    pub fn new(config: OrchestratorConfig, transport: ArrayTransportRef) -> Result<Self> {
        Self::with_locks(config, transport, Arc::new(NamedLockRegistry::new()))
    }

    /// Create an orchestrator sharing a lock registry with others in the process
    pub fn with_locks(
        config: OrchestratorConfig,
        transport: ArrayTransportRef,
        locks: Arc<NamedLockRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = MaskingMetrics::new()?;
        let waiter = JobWaiter::new(config.job_poll.clone(), metrics.clone());
        let client = ArrayClient::new(transport, waiter, config.verify_deletions);
        let groups = GroupResolver::new(client.clone());
        let rollback = RollbackManager::new(client.clone(), groups.clone());
        let teardown = TeardownPipeline::new(client.clone(), groups.clone(), locks.clone());

        info!(
            arrays = config.arrays.len(),
            poll_interval_ms = config.job_poll.interval_ms,
            max_polls = config.job_poll.max_attempts,
            "Masking orchestrator initialized"
        );

        Ok(Self {
            naming: NamingResolver::new(config.naming.clone()),
            config,
            client,
            groups,
            rollback,
            teardown,
            locks,
            metrics,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn naming(&self) -> &NamingResolver {
        &self.naming
    }

    pub fn locks(&self) -> &Arc<NamedLockRegistry> {
        &self.locks
    }

    pub fn metrics(&self) -> &MaskingMetrics {
        &self.metrics
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Build a request, deriving every object name from host, tiering and protocol
    pub fn build_request(
        &self,
        volume: ResourceHandle,
        volume_name: impl Into<String>,
        connector: HostConnector,
        protocol: Protocol,
        tiering: TieringDescriptor,
    ) -> Result<MaskingViewRequest> {
        if self.naming.short_host_name(&connector.host).trim().is_empty() {
            return Err(Error::InvalidRequest(format!(
                "connector host {:?} has no usable short name",
                connector.host
            )));
        }

        let array = self.config.array(&volume.system)?;
        let port_group = self
            .naming
            .select_port_group(&connector.host, &array.port_groups)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "array {} has no port groups configured",
                    array.system
                ))
            })?;
        let names = self
            .naming
            .resolve(&connector.host, &tiering, protocol, port_group);

        Ok(MaskingViewRequest {
            system: volume.system.clone(),
            volume,
            volume_name: volume_name.into(),
            connector,
            protocol,
            tiering,
            names,
            live_migration: false,
        })
    }

    fn validate_request(&self, request: &MaskingViewRequest) -> Result<()> {
        if request.volume.kind != ObjectKind::Volume {
            return Err(Error::InvalidRequest(format!(
                "{} is not a volume",
                request.volume
            )));
        }
        if request.volume.system != request.system {
            return Err(Error::InvalidRequest(format!(
                "volume {} does not live on {}",
                request.volume, request.system
            )));
        }
        request.connector.require_initiators(request.protocol)?;
        Ok(())
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Make the request's volume visible to its host.
    ///
    /// Either every object ends up consistent, or the error describes the
    /// failure together with the rollback that returned the volume to a
    /// known-good group.
    pub fn setup_masking_view(&self, request: &MaskingViewRequest) -> Result<MaskingViewOutcome> {
        let names = &request.names;
        info!(
            volume = %request.volume_name,
            host = %request.connector.host,
            protocol = %request.protocol,
            view = %names.masking_view,
            live_migration = request.live_migration,
            "Setting up masking view"
        );

        // Configuration errors surface as-is, before the array is touched
        if let Err(e) = self.validate_request(request) {
            self.metrics.record_setup(OUTCOME_FAILURE);
            return Err(e);
        }

        let _guard = self.locks.lock(&names.masking_view);

        let port_group = match self.groups.find_port_group(&request.system, &names.port_group) {
            Ok(port_group) => port_group,
            Err(e) => {
                self.metrics.record_setup(OUTCOME_FAILURE);
                return Err(e);
            }
        };

        let mut ctx = RollbackContext::new();
        let source = match self.run_setup(request, &port_group, &mut ctx) {
            Ok(outcome) => {
                ctx.enter(SetupStep::Done);
                self.metrics.record_setup(OUTCOME_SUCCESS);
                info!(
                    volume = %request.volume_name,
                    view = %names.masking_view,
                    reused = outcome.reused_view,
                    "Masking view ready"
                );
                return Ok(outcome);
            }
            Err(e) => e,
        };

        error!(
            volume = %request.volume_name,
            view = %names.masking_view,
            step = %ctx.step(),
            error = %source,
            "Masking view setup failed"
        );
        ctx.fail(source.to_string());
        self.metrics.record_setup(OUTCOME_FAILURE);

        match self.rollback.rollback(request, ctx) {
            Ok(summary) => {
                self.metrics.record_rollback(OUTCOME_ROLLED_BACK);
                info!(view = %names.masking_view, rollback = %summary, "Rollback complete");
                Err(Error::MaskingViewSetupFailed {
                    view: names.masking_view.clone(),
                    volume: request.volume_name.clone(),
                    rollback: summary,
                    source: Box::new(source),
                })
            }
            Err(reason) => {
                self.metrics.record_rollback(OUTCOME_ROLLBACK_FAILED);
                error!(
                    view = %names.masking_view,
                    volume = %request.volume_name,
                    reason = %reason,
                    "Rollback failed; operator intervention required"
                );
                Err(Error::RollbackFailed {
                    view: names.masking_view.clone(),
                    original: source.to_string(),
                    reason: reason.to_string(),
                })
            }
        }
    }

    fn run_setup(
        &self,
        request: &MaskingViewRequest,
        port_group: &ResourceHandle,
        ctx: &mut RollbackContext,
    ) -> Result<MaskingViewOutcome> {
        let system = &request.system;
        let names = &request.names;
        let volume = &request.volume;

        ctx.enter(SetupStep::ResolveDefaultGroup);
        if request.live_migration {
            debug!(volume = %request.volume_name, "Live migration keeps the volume in its current group");
        } else if let Some((group, _)) = self
            .client
            .device_groups_of(volume)?
            .into_iter()
            .find(|(_, name)| name == &names.default_group)
        {
            info!(volume = %request.volume_name, group = %names.default_group, "Removing volume from default group");
            self.client.remove_members(&group, vec![volume.clone()])?;
            ctx.removed_from_default(group);
        }

        ctx.enter(SetupStep::ResolveDeviceGroup);
        let device_group = self.groups.get_or_create_device_group(request)?;
        let mut initiator_group = None;
        if device_group.created {
            ctx.device_group_created(device_group.handle.clone());
            self.groups
                .associate_fast_policy(system, &device_group.handle, &request.tiering)?;

            ctx.enter(SetupStep::ResolvePortGroup);
            debug!(port_group = %names.port_group, "Port group resolved");

            ctx.enter(SetupStep::ResolveInitiatorGroup);
            initiator_group = Some(self.resolve_initiator_group(request, ctx)?);
        }
        let device_group = device_group.handle;

        ctx.enter(SetupStep::AddVolumeToDeviceGroup);
        if self.client.members(&device_group)?.contains(volume) {
            debug!(volume = %request.volume_name, group = %names.device_group, "Volume already in device group");
        } else {
            info!(volume = %request.volume_name, group = %names.device_group, "Adding volume to device group");
            self.client
                .add_members(&device_group, vec![volume.clone()])?;
            ctx.volume_added();
        }

        ctx.enter(SetupStep::ResolveOrCreateMaskingView);
        let bound = match self
            .client
            .find_by_name(system, ObjectKind::MaskingView, &names.masking_view)?
        {
            None => {
                let initiator_group = match initiator_group {
                    Some(ig) => ig,
                    None => self.resolve_initiator_group(request, ctx)?,
                };
                let view = self.create_view(request, &device_group, &initiator_group, port_group)?;
                ctx.view_created(view.clone());
                BoundView {
                    view,
                    initiator_group,
                    port_group: port_group.clone(),
                    reused: false,
                }
            }
            Some(view) => self.validate_existing_view(request, view, &device_group, ctx)?,
        };

        let target_ports = self.client.target_ports(&bound.port_group)?;

        Ok(MaskingViewOutcome {
            device_group,
            port_group: bound.port_group,
            initiator_group: bound.initiator_group,
            masking_view: bound.view,
            target_ports,
            reused_view: bound.reused,
        })
    }

    fn resolve_initiator_group(
        &self,
        request: &MaskingViewRequest,
        ctx: &mut RollbackContext,
    ) -> Result<ResourceHandle> {
        let resolved = self.groups.get_or_create_initiator_group(request)?;
        if resolved.created {
            ctx.initiator_group_created(resolved.handle.clone());
        }
        Ok(resolved.handle)
    }

    fn create_view(
        &self,
        request: &MaskingViewRequest,
        device_group: &ResourceHandle,
        initiator_group: &ResourceHandle,
        port_group: &ResourceHandle,
    ) -> Result<ResourceHandle> {
        info!(view = %request.names.masking_view, "Creating masking view");
        self.client.create(ArrayOperation::CreateMaskingView {
            system: request.system.clone(),
            name: request.names.masking_view.clone(),
            device_group: device_group.clone(),
            initiator_group: initiator_group.clone(),
            port_group: port_group.clone(),
        })
    }

    /// Reuse an existing view, updating its initiators when the host's changed.
    ///
    /// The view is never deleted before its replacement initiator group
    /// exists, and a deleted view is recorded so rollback can restore it.
    fn validate_existing_view(
        &self,
        request: &MaskingViewRequest,
        view: ResourceHandle,
        device_group: &ResourceHandle,
        ctx: &mut RollbackContext,
    ) -> Result<BoundView> {
        let names = &request.names;

        let bound_group = self.client.associator(&view, ObjectKind::DeviceGroup)?;
        if &bound_group != device_group {
            return Err(Error::ViewGroupMismatch {
                view: names.masking_view.clone(),
                expected: names.device_group.clone(),
                actual: self.client.name_of(&bound_group)?,
            });
        }

        let bound_initiators = self.client.associator(&view, ObjectKind::InitiatorGroup)?;
        let port_group = self.client.associator(&view, ObjectKind::PortGroup)?;

        if self.groups.initiator_group_matches(&bound_initiators, request)? {
            debug!(view = %names.masking_view, "Reusing existing masking view");
            return Ok(BoundView {
                view,
                initiator_group: bound_initiators,
                port_group,
                reused: true,
            });
        }

        // The canonical group belongs to this host and may back its other views
        if self.client.name_of(&bound_initiators)? == names.initiator_group {
            warn!(
                view = %names.masking_view,
                host = %request.connector.host,
                "Host initiators changed; updating initiator group in place"
            );
            let hardware_ids = self.groups.hardware_ids().resolve(
                &request.system,
                request.protocol,
                &request.connector,
            )?;
            self.groups
                .reconcile_initiator_group(&bound_initiators, &hardware_ids)?;
            return Ok(BoundView {
                view,
                initiator_group: bound_initiators,
                port_group,
                reused: false,
            });
        }

        let initiator_group = self.resolve_initiator_group(request, ctx)?;
        if initiator_group == bound_initiators {
            warn!(
                view = %names.masking_view,
                "Pre-existing initiator group holds extra initiators; reusing view"
            );
            return Ok(BoundView {
                view,
                initiator_group,
                port_group,
                reused: true,
            });
        }

        warn!(
            view = %names.masking_view,
            host = %request.connector.host,
            "Host initiators changed; recreating masking view"
        );
        self.client.delete_view(&view, &names.masking_view)?;
        ctx.view_replaced(ReplacedView {
            device_group: device_group.clone(),
            initiator_group: bound_initiators,
            port_group: port_group.clone(),
        });

        let view = self.create_view(request, device_group, &initiator_group, &port_group)?;
        ctx.view_created(view.clone());

        Ok(BoundView {
            view,
            initiator_group,
            port_group,
            reused: false,
        })
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Detach `volume`, cascading deletion when it is the last member of its
    /// device group, and return it to its default group when `reset` is set
    pub fn remove_and_reset_members(
        &self,
        volume: &ResourceHandle,
        request: &MaskingViewRequest,
        reset: bool,
    ) -> Result<TeardownReport> {
        info!(
            volume = %request.volume_name,
            host = %request.connector.host,
            reset,
            "Removing volume from masking"
        );

        let result = if volume.kind != ObjectKind::Volume || volume.system != request.system {
            Err(Error::InvalidRequest(format!(
                "{} is not a volume on {}",
                volume, request.system
            )))
        } else {
            self.teardown.remove_and_reset_members(volume, request, reset)
        };

        match result {
            Ok(report) => {
                self.metrics.record_teardown(OUTCOME_SUCCESS);
                info!(
                    volume = %request.volume_name,
                    views_deleted = report.views_deleted.len(),
                    groups_deleted = report.device_groups_deleted.len(),
                    "Teardown complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_teardown(OUTCOME_FAILURE);
                error!(volume = %request.volume_name, error = %e, "Teardown failed");
                Err(Error::TeardownFailed {
                    volume: request.volume_name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}
