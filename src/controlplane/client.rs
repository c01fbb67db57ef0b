//! Array Client
//!
//! Thin layer over [`ArrayTransport`] that the resolvers, the orchestrator and
//! the teardown pipeline share. It adds job waiting to every mutation, name
//! lookups over enumerations, and a post-condition check on every deletion.
//!
//! Nothing is cached here. Each helper re-queries the array.

use crate::controlplane::jobs::JobWaiter;
use crate::domain::ports::{
    ArrayOperation, ArrayTransportRef, InstanceAttributes, ObjectKind, ResourceHandle,
};
use crate::error::{Error, Result};
use tracing::{debug, error};

/// Job-aware wrapper around the transport port
#[derive(Clone)]
pub struct ArrayClient {
    transport: ArrayTransportRef,
    waiter: JobWaiter,
    verify_deletions: bool,
}

impl std::fmt::Debug for ArrayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayClient")
            .field("waiter", &self.waiter)
            .field("verify_deletions", &self.verify_deletions)
            .finish()
    }
}

impl ArrayClient {
    pub fn new(transport: ArrayTransportRef, waiter: JobWaiter, verify_deletions: bool) -> Self {
        Self {
            transport,
            waiter,
            verify_deletions,
        }
    }

    pub fn transport(&self) -> &ArrayTransportRef {
        &self.transport
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Invoke an operation and wait for it to settle
    pub fn invoke(&self, operation: ArrayOperation) -> Result<Option<ResourceHandle>> {
        self.waiter.invoke_and_wait(self.transport.as_ref(), operation)
    }

    /// Invoke a create operation, requiring the array to return the new handle
    pub fn create(&self, operation: ArrayOperation) -> Result<ResourceHandle> {
        let kind = operation.kind();
        self.invoke(operation)?.ok_or_else(|| Error::MissingResult {
            operation: kind.to_string(),
        })
    }

    pub fn add_members(&self, group: &ResourceHandle, members: Vec<ResourceHandle>) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        debug!(group = %group, count = members.len(), "Adding members");
        self.invoke(ArrayOperation::AddMembers {
            group: group.clone(),
            members,
        })?;
        Ok(())
    }

    pub fn remove_members(
        &self,
        group: &ResourceHandle,
        members: Vec<ResourceHandle>,
    ) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        debug!(group = %group, count = members.len(), "Removing members");
        self.invoke(ArrayOperation::RemoveMembers {
            group: group.clone(),
            members,
        })?;
        Ok(())
    }

    /// Delete an empty, unreferenced group and prove it is gone
    pub fn delete_group(&self, group: &ResourceHandle, name: &str) -> Result<()> {
        self.invoke(ArrayOperation::DeleteGroup {
            group: group.clone(),
        })?;
        self.verify_deleted(group, name)
    }

    /// Delete a masking view and prove it is gone
    pub fn delete_view(&self, view: &ResourceHandle, name: &str) -> Result<()> {
        self.invoke(ArrayOperation::DeleteMaskingView { view: view.clone() })?;
        self.verify_deleted(view, name)
    }

    fn verify_deleted(&self, handle: &ResourceHandle, name: &str) -> Result<()> {
        if !self.verify_deletions {
            return Ok(());
        }
        if self.transport.get_instance(handle)?.is_some() {
            error!(object = %handle, %name, "Object survived a successful delete");
            return Err(Error::ResidualObject {
                kind: handle.kind.to_string(),
                name: name.to_string(),
            });
        }
        debug!(object = %handle, %name, "Deletion verified");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Attributes of an object that must exist
    pub fn instance(&self, handle: &ResourceHandle) -> Result<InstanceAttributes> {
        self.transport
            .get_instance(handle)?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: handle.kind.to_string(),
                name: handle.id.clone(),
            })
    }

    /// Element name of an object that must exist
    pub fn name_of(&self, handle: &ResourceHandle) -> Result<String> {
        Ok(self.instance(handle)?.name)
    }

    /// Find an object of `kind` by element name
    pub fn find_by_name(
        &self,
        system: &str,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Option<ResourceHandle>> {
        for handle in self.transport.enumerate(system, kind)? {
            if let Some(attrs) = self.transport.get_instance(&handle)? {
                if attrs.name == name {
                    return Ok(Some(handle));
                }
            }
        }
        Ok(None)
    }

    /// Attributes of every object of `kind` on `system`
    pub fn list(&self, system: &str, kind: ObjectKind) -> Result<Vec<InstanceAttributes>> {
        let mut found = Vec::new();
        for handle in self.transport.enumerate(system, kind)? {
            if let Some(attrs) = self.transport.get_instance(&handle)? {
                found.push(attrs);
            }
        }
        Ok(found)
    }

    pub fn associators(
        &self,
        handle: &ResourceHandle,
        kind: ObjectKind,
    ) -> Result<Vec<ResourceHandle>> {
        self.transport.associator_names(handle, kind)
    }

    /// Single associator of `kind`, failing if the array reports none
    pub fn associator(&self, handle: &ResourceHandle, kind: ObjectKind) -> Result<ResourceHandle> {
        self.associators(handle, kind)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: kind.to_string(),
                name: format!("associated with {}", handle),
            })
    }

    /// Members of a device, initiator or port group
    pub fn members(&self, group: &ResourceHandle) -> Result<Vec<ResourceHandle>> {
        let member_kind = match group.kind {
            ObjectKind::DeviceGroup => ObjectKind::Volume,
            ObjectKind::InitiatorGroup => ObjectKind::HardwareId,
            ObjectKind::PortGroup => ObjectKind::TargetPort,
            other => {
                return Err(Error::InvalidRequest(format!(
                    "{} objects have no members",
                    other
                )))
            }
        };
        self.associators(group, member_kind)
    }

    /// Device groups that contain a volume, with their names
    pub fn device_groups_of(&self, volume: &ResourceHandle) -> Result<Vec<(ResourceHandle, String)>> {
        let mut groups = Vec::new();
        for group in self.associators(volume, ObjectKind::DeviceGroup)? {
            let name = self.name_of(&group)?;
            groups.push((group, name));
        }
        Ok(groups)
    }

    /// Masking views referencing a group
    pub fn views_of(&self, group: &ResourceHandle) -> Result<Vec<ResourceHandle>> {
        self.associators(group, ObjectKind::MaskingView)
    }

    /// Identifiers of the target ports in a port group
    pub fn target_ports(&self, port_group: &ResourceHandle) -> Result<Vec<String>> {
        self.associators(port_group, ObjectKind::TargetPort)?
            .iter()
            .map(|port| self.name_of(port))
            .collect()
    }
}
