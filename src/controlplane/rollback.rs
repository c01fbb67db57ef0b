//! Validation & Rollback
//!
//! A [`RollbackContext`] follows one attach attempt and records which objects
//! the attempt created and where the volume came from. When the attempt
//! fails, the [`RollbackManager`] consumes the context and puts the array
//! back into a known-good state:
//!
//! 1. a masking view created by the attempt is deleted, and a view the
//!    attempt deleted in order to rebuild it is recreated from its groups
//! 2. an orphaned canonical initiator group is deleted
//! 3. the volume is taken out of the request's device group and returned to
//!    the default group it came from when it is left without any group
//! 4. an empty device group created by the attempt is deleted
//!
//! Only the objects recorded in the context, or canonically named and
//! unreferenced, are ever removed.

use crate::controlplane::client::ArrayClient;
use crate::domain::ports::{ArrayOperation, ObjectKind, ResourceHandle};
use crate::domain::request::MaskingViewRequest;
use crate::error::Result;
use crate::resolvers::groups::GroupResolver;
use tracing::{debug, info, warn};

// =============================================================================
// Setup Steps
// =============================================================================

/// States of the attach state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    ResolveDefaultGroup,
    ResolveDeviceGroup,
    ResolvePortGroup,
    ResolveInitiatorGroup,
    AddVolumeToDeviceGroup,
    ResolveOrCreateMaskingView,
    Done,
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SetupStep::ResolveDefaultGroup => "RESOLVE_DEFAULT_GROUP",
            SetupStep::ResolveDeviceGroup => "RESOLVE_DEVICE_GROUP",
            SetupStep::ResolvePortGroup => "RESOLVE_PORT_GROUP",
            SetupStep::ResolveInitiatorGroup => "RESOLVE_INITIATOR_GROUP",
            SetupStep::AddVolumeToDeviceGroup => "ADD_VOLUME_TO_DEVICE_GROUP",
            SetupStep::ResolveOrCreateMaskingView => "RESOLVE_OR_CREATE_MASKING_VIEW",
            SetupStep::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Rollback Context
// =============================================================================

/// Groups of a masking view the attempt deleted so it could be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacedView {
    pub device_group: ResourceHandle,
    pub initiator_group: ResourceHandle,
    pub port_group: ResourceHandle,
}

/// What one attach attempt has done so far
#[derive(Debug, Clone)]
pub struct RollbackContext {
    step: SetupStep,
    default_group: Option<ResourceHandle>,
    created_device_group: Option<ResourceHandle>,
    created_initiator_group: Option<ResourceHandle>,
    created_view: Option<ResourceHandle>,
    replaced_view: Option<ReplacedView>,
    volume_added: bool,
    failure: Option<String>,
}

impl Default for RollbackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackContext {
    pub fn new() -> Self {
        Self {
            step: SetupStep::ResolveDefaultGroup,
            default_group: None,
            created_device_group: None,
            created_initiator_group: None,
            created_view: None,
            replaced_view: None,
            volume_added: false,
            failure: None,
        }
    }

    pub fn enter(&mut self, step: SetupStep) {
        debug!(from = %self.step, to = %step, "Setup step");
        self.step = step;
    }

    pub fn step(&self) -> SetupStep {
        self.step
    }

    pub fn removed_from_default(&mut self, group: ResourceHandle) {
        self.default_group = Some(group);
    }

    pub fn device_group_created(&mut self, group: ResourceHandle) {
        self.created_device_group = Some(group);
    }

    pub fn initiator_group_created(&mut self, group: ResourceHandle) {
        self.created_initiator_group = Some(group);
    }

    pub fn view_created(&mut self, view: ResourceHandle) {
        self.created_view = Some(view);
    }

    pub fn view_replaced(&mut self, original: ReplacedView) {
        self.replaced_view = Some(original);
    }

    pub fn volume_added(&mut self) {
        self.volume_added = true;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Default group the volume was removed from
    pub fn default_group(&self) -> Option<&ResourceHandle> {
        self.default_group.as_ref()
    }

    pub fn replaced_view(&self) -> Option<&ReplacedView> {
        self.replaced_view.as_ref()
    }
}

// =============================================================================
// Rollback Manager
// =============================================================================

/// Restores the array after a failed attach attempt
#[derive(Debug, Clone)]
pub struct RollbackManager {
    client: ArrayClient,
    groups: GroupResolver,
}

impl RollbackManager {
    pub fn new(client: ArrayClient, groups: GroupResolver) -> Self {
        Self { client, groups }
    }

    /// Undo a failed attempt, returning a summary of what was done
    pub fn rollback(&self, request: &MaskingViewRequest, ctx: RollbackContext) -> Result<String> {
        info!(
            view = %request.names.masking_view,
            volume = %request.volume_name,
            step = %ctx.step(),
            failure = ctx.failure().unwrap_or("unknown"),
            "Rolling back masking view setup"
        );
        let mut actions = Vec::new();

        if let Some(view) = &ctx.created_view {
            if self.client.transport().get_instance(view)?.is_some() {
                self.client.delete_view(view, &request.names.masking_view)?;
                actions.push(format!("deleted masking view {}", request.names.masking_view));
            }
        }
        if let Some(original) = &ctx.replaced_view {
            self.restore_replaced_view(request, original, &mut actions)?;
        }

        self.remove_orphan_initiator_group(request, &ctx, &mut actions)?;
        self.restore_volume_placement(request, &ctx, &mut actions)?;
        self.remove_empty_device_group(request, &ctx, &mut actions)?;

        if actions.is_empty() {
            return Ok("nothing to undo".to_string());
        }
        Ok(actions.join("; "))
    }

    fn restore_replaced_view(
        &self,
        request: &MaskingViewRequest,
        original: &ReplacedView,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let name = &request.names.masking_view;
        if self
            .client
            .find_by_name(&request.system, ObjectKind::MaskingView, name)?
            .is_some()
        {
            return Ok(());
        }

        warn!(view = %name, "Recreating masking view deleted by the failed attempt");
        self.client.create(ArrayOperation::CreateMaskingView {
            system: request.system.clone(),
            name: name.clone(),
            device_group: original.device_group.clone(),
            initiator_group: original.initiator_group.clone(),
            port_group: original.port_group.clone(),
        })?;
        actions.push(format!("recreated masking view {}", name));
        Ok(())
    }

    fn remove_orphan_initiator_group(
        &self,
        request: &MaskingViewRequest,
        ctx: &RollbackContext,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let system = &request.system;
        let canonical = &request.names.initiator_group;
        let hardware_ids =
            self.groups
                .hardware_ids()
                .lookup(system, request.protocol, &request.connector)?;

        let candidate = match self.groups.find_initiator_group(system, &hardware_ids)? {
            Some(group) => Some(group),
            None => self
                .client
                .find_by_name(system, ObjectKind::InitiatorGroup, canonical)?,
        };
        let Some(group) = candidate else {
            return Ok(());
        };

        let name = self.client.name_of(&group)?;
        if &name != canonical || !self.client.views_of(&group)?.is_empty() {
            debug!(group = %name, "Initiator group is not an orphan");
            return Ok(());
        }
        if ctx.created_initiator_group.as_ref() != Some(&group) {
            warn!(
                group = %name,
                "Deleting unreferenced initiator group matched by name only; it predates this attempt"
            );
        }

        if self.groups.delete_initiator_group_if_unused(&group, canonical)? {
            actions.push(format!("deleted initiator group {}", name));
        }
        Ok(())
    }

    fn restore_volume_placement(
        &self,
        request: &MaskingViewRequest,
        ctx: &RollbackContext,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let volume = &request.volume;
        let names = &request.names;

        for (group, name) in self.client.device_groups_of(volume)? {
            if name == names.device_group {
                if request.live_migration && !ctx.volume_added {
                    continue;
                }
                self.client.remove_members(&group, vec![volume.clone()])?;
                actions.push(format!("removed {} from {}", request.volume_name, name));
            } else if name != names.default_group {
                warn!(
                    volume = %request.volume_name,
                    group = %name,
                    "Volume belongs to another host-facing group; leaving it"
                );
            }
        }

        // The source host still owns the volume during a live migration
        if request.live_migration {
            return Ok(());
        }

        if self.client.device_groups_of(volume)?.is_empty() {
            let (target, recreated) = match ctx.default_group() {
                Some(group) if self.client.transport().get_instance(group)?.is_some() => {
                    (group.clone(), false)
                }
                _ => {
                    let default = self.groups.get_or_create_default_group(
                        &request.system,
                        &names.default_group,
                        &request.tiering,
                    )?;
                    (default.handle, default.created)
                }
            };
            self.client.add_members(&target, vec![volume.clone()])?;
            let suffix = if recreated { " (recreated)" } else { "" };
            actions.push(format!(
                "returned {} to {}{}",
                request.volume_name,
                self.client.name_of(&target)?,
                suffix
            ));
        }
        Ok(())
    }

    fn remove_empty_device_group(
        &self,
        request: &MaskingViewRequest,
        ctx: &RollbackContext,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let Some(group) = &ctx.created_device_group else {
            return Ok(());
        };
        if self.client.transport().get_instance(group)?.is_none() {
            return Ok(());
        }
        if !self.client.members(group)?.is_empty() || !self.client.views_of(group)?.is_empty() {
            debug!(group = %request.names.device_group, "Keeping device group in use");
            return Ok(());
        }
        self.client.delete_group(group, &request.names.device_group)?;
        actions.push(format!("deleted device group {}", request.names.device_group));
        Ok(())
    }
}
