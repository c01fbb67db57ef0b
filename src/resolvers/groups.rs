//! Group Resolvers
//!
//! Get-or-create logic for device groups (host-facing and default) and
//! initiator groups, plus lookup of operator-provisioned port groups.

use crate::controlplane::client::ArrayClient;
use crate::domain::ports::{ArrayOperation, ObjectKind, ResourceHandle, TieringDescriptor};
use crate::domain::request::MaskingViewRequest;
use crate::error::{Error, Result};
use crate::resolvers::hardware_id::{normalize, HardwareIdResolver};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// A group handle and whether this call created it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub handle: ResourceHandle,
    pub created: bool,
}

impl ResolvedGroup {
    fn existing(handle: ResourceHandle) -> Self {
        Self {
            handle,
            created: false,
        }
    }

    fn created(handle: ResourceHandle) -> Self {
        Self {
            handle,
            created: true,
        }
    }
}

/// Resolves the groups a masking view is built from
#[derive(Debug, Clone)]
pub struct GroupResolver {
    client: ArrayClient,
    hardware_ids: HardwareIdResolver,
}

impl GroupResolver {
    pub fn new(client: ArrayClient) -> Self {
        let hardware_ids = HardwareIdResolver::new(client.clone());
        Self {
            client,
            hardware_ids,
        }
    }

    pub fn hardware_ids(&self) -> &HardwareIdResolver {
        &self.hardware_ids
    }

    // =========================================================================
    // Device Groups
    // =========================================================================

    /// Host-facing device group for a request.
    ///
    /// A newly created legacy group still needs [`Self::associate_fast_policy`];
    /// the caller records the creation first so a failed association can be
    /// rolled back.
    pub fn get_or_create_device_group(&self, request: &MaskingViewRequest) -> Result<ResolvedGroup> {
        self.find_or_create_group(
            &request.system,
            &request.names.device_group,
            &request.tiering,
        )
    }

    /// Default group for a tiering identity, associated with its FAST policy
    pub fn get_or_create_default_group(
        &self,
        system: &str,
        name: &str,
        tiering: &TieringDescriptor,
    ) -> Result<ResolvedGroup> {
        let resolved = self.find_or_create_group(system, name, tiering)?;
        if resolved.created {
            self.associate_fast_policy(system, &resolved.handle, tiering)?;
        }
        Ok(resolved)
    }

    /// Associate a legacy device group with its FAST policy, if one applies
    pub fn associate_fast_policy(
        &self,
        system: &str,
        group: &ResourceHandle,
        tiering: &TieringDescriptor,
    ) -> Result<()> {
        let Some(policy) = tiering.fast_policy() else {
            return Ok(());
        };
        info!(group = %group, %policy, "Associating device group with FAST policy");
        self.client.invoke(ArrayOperation::AssociateFastPolicy {
            system: system.to_string(),
            policy: policy.to_string(),
            group: group.clone(),
        })?;
        Ok(())
    }

    fn find_or_create_group(
        &self,
        system: &str,
        name: &str,
        tiering: &TieringDescriptor,
    ) -> Result<ResolvedGroup> {
        if let Some(handle) = self.client.find_by_name(system, ObjectKind::DeviceGroup, name)? {
            debug!(group = %name, "Found existing device group");
            return Ok(ResolvedGroup::existing(handle));
        }

        info!(group = %name, "Creating device group");
        let created = self.client.create(ArrayOperation::CreateDeviceGroup {
            system: system.to_string(),
            name: name.to_string(),
            placement: tiering.placement(),
        });

        match created {
            Ok(handle) => Ok(ResolvedGroup::created(handle)),
            Err(e @ Error::OperationRejected { .. }) => {
                // Lost a create race for a shared name
                match self.client.find_by_name(system, ObjectKind::DeviceGroup, name)? {
                    Some(handle) => Ok(ResolvedGroup::existing(handle)),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Port Groups
    // =========================================================================

    /// Look up an operator-provisioned port group
    pub fn find_port_group(&self, system: &str, name: &str) -> Result<ResourceHandle> {
        self.client
            .find_by_name(system, ObjectKind::PortGroup, name)?
            .ok_or_else(|| Error::PortGroupNotFound {
                name: name.to_string(),
                system: system.to_string(),
            })
    }

    // =========================================================================
    // Initiator Groups
    // =========================================================================

    /// Initiator group holding the connector's initiators, created if absent
    pub fn get_or_create_initiator_group(
        &self,
        request: &MaskingViewRequest,
    ) -> Result<ResolvedGroup> {
        let system = &request.system;
        let canonical = &request.names.initiator_group;
        let hardware_ids =
            self.hardware_ids
                .resolve(system, request.protocol, &request.connector)?;

        if let Some(handle) = self.find_initiator_group(system, &hardware_ids)? {
            let name = self.client.name_of(&handle)?;
            if &name == canonical {
                debug!(group = %name, "Found existing initiator group");
            } else {
                warn!(
                    group = %name,
                    expected = %canonical,
                    host = %request.connector.host,
                    "Reusing pre-existing initiator group"
                );
            }
            return Ok(ResolvedGroup::existing(handle));
        }

        let Some((first, rest)) = hardware_ids.split_first() else {
            return Err(Error::NoInitiators {
                host: request.connector.host.clone(),
                protocol: request.protocol.to_string(),
            });
        };

        info!(group = %canonical, initiators = hardware_ids.len(), "Creating initiator group");
        let created = self.client.create(ArrayOperation::CreateInitiatorGroup {
            system: system.to_string(),
            name: canonical.clone(),
            initial_member: first.clone(),
        });
        let handle = match created {
            Ok(handle) => handle,
            Err(e @ Error::OperationRejected { .. }) => {
                return match self.find_initiator_group(system, &hardware_ids)? {
                    Some(handle) => Ok(ResolvedGroup::existing(handle)),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.client.add_members(&handle, rest.to_vec()) {
            warn!(group = %canonical, error = %e, "Failed to add initiators to new group");
            return Err(e);
        }

        Ok(ResolvedGroup::created(handle))
    }

    /// Initiator group on the array containing all of `hardware_ids`
    pub fn find_initiator_group(
        &self,
        system: &str,
        hardware_ids: &[ResourceHandle],
    ) -> Result<Option<ResourceHandle>> {
        if hardware_ids.is_empty() {
            return Ok(None);
        }
        let wanted: BTreeSet<&ResourceHandle> = hardware_ids.iter().collect();

        for group in self.client.transport().enumerate(system, ObjectKind::InitiatorGroup)? {
            let members = self.client.members(&group)?;
            let held: BTreeSet<&ResourceHandle> = members.iter().collect();
            if wanted.is_subset(&held) {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }

    /// Whether an initiator group holds exactly the connector's initiators
    pub fn initiator_group_matches(
        &self,
        group: &ResourceHandle,
        request: &MaskingViewRequest,
    ) -> Result<bool> {
        let members = self.client.members(group)?;
        let held: BTreeSet<String> = self
            .hardware_ids
            .storage_ids(&members)?
            .iter()
            .map(|id| normalize(id))
            .collect();
        let wanted: BTreeSet<String> = request
            .connector
            .initiators(request.protocol)
            .iter()
            .map(|id| normalize(id))
            .collect();
        Ok(held == wanted)
    }

    /// Bring an initiator group's membership in line with `hardware_ids`.
    ///
    /// Missing hardware IDs are added before stale ones are removed, so the
    /// group never empties while views keep referencing it.
    pub fn reconcile_initiator_group(
        &self,
        group: &ResourceHandle,
        hardware_ids: &[ResourceHandle],
    ) -> Result<()> {
        let members = self.client.members(group)?;
        let missing: Vec<_> = hardware_ids
            .iter()
            .filter(|id| !members.contains(id))
            .cloned()
            .collect();
        let stale: Vec<_> = members
            .iter()
            .filter(|id| !hardware_ids.contains(id))
            .cloned()
            .collect();

        info!(
            group = %self.client.name_of(group)?,
            added = missing.len(),
            removed = stale.len(),
            "Updating initiator group membership"
        );
        self.client.add_members(group, missing)?;
        self.client.remove_members(group, stale)?;
        Ok(())
    }

    /// Delete an initiator group and its hardware-ID memberships.
    ///
    /// Only groups carrying the canonical name that no masking view references
    /// are deleted. Returns whether the group was deleted.
    pub fn delete_initiator_group_if_unused(
        &self,
        group: &ResourceHandle,
        canonical: &str,
    ) -> Result<bool> {
        let name = self.client.name_of(group)?;
        if name != canonical {
            debug!(group = %name, "Keeping initiator group with non-canonical name");
            return Ok(false);
        }
        if !self.client.views_of(group)?.is_empty() {
            debug!(group = %name, "Keeping initiator group still referenced by a view");
            return Ok(false);
        }

        info!(group = %name, "Deleting initiator group");
        let members = self.client.members(group)?;
        self.client.remove_members(group, members)?;
        self.client.delete_group(group, &name)?;
        Ok(true)
    }
}
