//! Teardown Pipeline
//!
//! Detaches a volume from its host-facing device groups. A group the volume
//! shares with other volumes only loses this membership. When the volume is
//! the last member, the masking view, the canonical initiator group (if no
//! other view uses it) and the device group are deleted in that order, each
//! deletion verified against the array.
//!
//! The membership count is only read under the named lock of the group's
//! masking view, the same lock an attach of that view holds.

use crate::controlplane::client::ArrayClient;
use crate::controlplane::locks::NamedLockRegistry;
use crate::domain::ports::{ObjectKind, ResourceHandle};
use crate::domain::request::{MaskingViewRequest, TeardownReport};
use crate::error::Result;
use crate::resolvers::groups::GroupResolver;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Detach / delete path of the orchestrator
#[derive(Debug, Clone)]
pub struct TeardownPipeline {
    client: ArrayClient,
    groups: GroupResolver,
    locks: Arc<NamedLockRegistry>,
}

impl TeardownPipeline {
    pub fn new(client: ArrayClient, groups: GroupResolver, locks: Arc<NamedLockRegistry>) -> Self {
        Self {
            client,
            groups,
            locks,
        }
    }

    /// Remove `volume` from its host-facing groups, optionally re-homing it
    /// in its default group afterwards
    pub fn remove_and_reset_members(
        &self,
        volume: &ResourceHandle,
        request: &MaskingViewRequest,
        reset: bool,
    ) -> Result<TeardownReport> {
        let mut report = TeardownReport::default();
        let default_name = &request.names.default_group;

        let host_groups: Vec<_> = self
            .client
            .device_groups_of(volume)?
            .into_iter()
            .filter(|(_, name)| name != default_name)
            .collect();

        if host_groups.len() > 1 {
            warn!(
                volume = %request.volume_name,
                groups = host_groups.len(),
                "Volume is a member of more than one host-facing device group"
            );
        }

        for (group, name) in &host_groups {
            self.release_group(volume, group, name, request, &mut report)?;
        }

        if reset {
            self.return_to_default(volume, request, &mut report)?;
        }

        Ok(report)
    }

    /// Name serializing work on `group` with attaches of the same view
    fn lock_key(
        &self,
        group: &ResourceHandle,
        name: &str,
        request: &MaskingViewRequest,
    ) -> Result<String> {
        if name == request.names.device_group {
            return Ok(request.names.masking_view.clone());
        }
        match self.client.views_of(group)?.first() {
            Some(view) => self.client.name_of(view),
            None => Ok(name.to_string()),
        }
    }

    fn release_group(
        &self,
        volume: &ResourceHandle,
        group: &ResourceHandle,
        name: &str,
        request: &MaskingViewRequest,
        report: &mut TeardownReport,
    ) -> Result<()> {
        let key = self.lock_key(group, name, request)?;
        let _guard = self.locks.lock(&key);

        let members = self.client.members(group)?;
        if !members.contains(volume) {
            debug!(volume = %request.volume_name, group = %name, "Volume already left the group");
            return Ok(());
        }
        if members.len() > 1 {
            return self.remove_membership(volume, group, name, request, report);
        }

        let views = self.client.views_of(group)?;
        if views.is_empty() {
            info!(group = %name, "Deleting device group without masking view");
        } else {
            debug!(group = %name, lock = %key, "Last member; deleting masking views");
        }

        for view in views {
            let view_name = self.client.name_of(&view)?;
            let initiator_group = self
                .client
                .associators(&view, ObjectKind::InitiatorGroup)?
                .into_iter()
                .next();

            info!(view = %view_name, "Deleting masking view");
            self.client.delete_view(&view, &view_name)?;
            report.views_deleted.push(view_name);

            if let Some(ig) = initiator_group {
                let ig_name = self.client.name_of(&ig)?;
                if self
                    .groups
                    .delete_initiator_group_if_unused(&ig, &request.names.initiator_group)?
                {
                    report.initiator_groups_deleted.push(ig_name);
                }
            }
        }

        self.client.remove_members(group, vec![volume.clone()])?;
        info!(group = %name, "Deleting empty device group");
        self.client.delete_group(group, name)?;
        report.device_groups_deleted.push(name.to_string());
        Ok(())
    }

    fn remove_membership(
        &self,
        volume: &ResourceHandle,
        group: &ResourceHandle,
        name: &str,
        request: &MaskingViewRequest,
        report: &mut TeardownReport,
    ) -> Result<()> {
        info!(volume = %request.volume_name, group = %name, "Removing volume from device group");
        self.client.remove_members(group, vec![volume.clone()])?;
        report.memberships_removed.push(name.to_string());
        Ok(())
    }

    fn return_to_default(
        &self,
        volume: &ResourceHandle,
        request: &MaskingViewRequest,
        report: &mut TeardownReport,
    ) -> Result<()> {
        let default_name = &request.names.default_group;
        let current = self.client.device_groups_of(volume)?;
        if current.iter().any(|(_, name)| name == default_name) {
            debug!(volume = %request.volume_name, "Volume already in its default group");
            return Ok(());
        }

        let default = self.groups.get_or_create_default_group(
            &request.system,
            default_name,
            &request.tiering,
        )?;
        self.client
            .add_members(&default.handle, vec![volume.clone()])?;
        info!(volume = %request.volume_name, group = %default_name, "Returned volume to default group");
        report.returned_to_default = true;
        Ok(())
    }
}
