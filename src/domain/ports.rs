//! Domain Ports - The array management protocol boundary
//!
//! The orchestrator never talks to an array directly. Every create, associate,
//! delete and query goes through [`ArrayTransport`], whose primitives mirror
//! the array's management protocol: invoke an operation, fetch an instance,
//! walk associators, enumerate a kind, and poll a job.
//!
//! The port is synchronous. A pending array mutation blocks the calling thread
//! until its job is polled to completion; callers running inside an async
//! runtime dispatch through `spawn_blocking`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Return Codes
// =============================================================================

/// The operation completed synchronously
pub const RC_COMPLETED: u32 = 0;

/// The operation was accepted and a job was started
pub const RC_JOB_STARTED: u32 = 4096;

// =============================================================================
// Object Kinds and Handles
// =============================================================================

/// Kinds of remote objects the orchestrator deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Volume,
    DeviceGroup,
    InitiatorGroup,
    PortGroup,
    MaskingView,
    HardwareId,
    TargetPort,
    FastPolicy,
    Job,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Volume => write!(f, "Volume"),
            ObjectKind::DeviceGroup => write!(f, "DeviceGroup"),
            ObjectKind::InitiatorGroup => write!(f, "InitiatorGroup"),
            ObjectKind::PortGroup => write!(f, "PortGroup"),
            ObjectKind::MaskingView => write!(f, "MaskingView"),
            ObjectKind::HardwareId => write!(f, "HardwareId"),
            ObjectKind::TargetPort => write!(f, "TargetPort"),
            ObjectKind::FastPolicy => write!(f, "FastPolicy"),
            ObjectKind::Job => write!(f, "Job"),
        }
    }
}

/// Opaque reference to one object on an array.
///
/// Handles are keys, not cached state: anything known about the object is
/// fetched again through the transport each time it is needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Kind of the referenced object
    pub kind: ObjectKind,
    /// Storage system the object lives on
    pub system: String,
    /// Array-assigned identifier
    pub id: String,
}

impl ResourceHandle {
    pub fn new(kind: ObjectKind, system: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.system, self.kind, self.id)
    }
}

/// Attributes of one remote object as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAttributes {
    /// Handle of the object
    pub handle: ResourceHandle,
    /// Element name (the name the orchestrator generates and searches by)
    pub name: String,
    /// Remaining properties
    pub properties: BTreeMap<String, String>,
}

/// Property carrying the initiator identifier of a hardware ID
pub const PROP_STORAGE_ID: &str = "storage_id";

impl InstanceAttributes {
    /// Get a property by key
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

// =============================================================================
// Protocol and Tiering
// =============================================================================

/// Host connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Fc,
    Iscsi,
}

impl Protocol {
    /// One-letter token used in device group and masking view names
    pub fn short_token(&self) -> &'static str {
        match self {
            Protocol::Fc => "F",
            Protocol::Iscsi => "I",
        }
    }

    /// Token used in initiator group names
    pub fn long_token(&self) -> &'static str {
        match self {
            Protocol::Fc => "FC",
            Protocol::Iscsi => "iSCSI",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Fc => write!(f, "fc"),
            Protocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

/// Tiering identity attached to a volume at creation time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TieringDescriptor {
    /// Legacy array: a pool, optionally governed by a FAST policy
    LegacyFastPolicy {
        pool: String,
        #[serde(default)]
        policy: Option<String>,
    },
    /// Newer array: a storage resource pool with service level and workload
    ServiceLevelPool {
        pool: String,
        #[serde(default)]
        service_level: Option<String>,
        #[serde(default)]
        workload: Option<String>,
    },
}

impl TieringDescriptor {
    /// FAST policy the device groups must be associated with, if any
    pub fn fast_policy(&self) -> Option<&str> {
        match self {
            TieringDescriptor::LegacyFastPolicy { policy, .. } => policy.as_deref(),
            TieringDescriptor::ServiceLevelPool { .. } => None,
        }
    }

    /// Service-level placement for group creation on newer arrays
    pub fn placement(&self) -> Option<ServiceLevelPlacement> {
        match self {
            TieringDescriptor::LegacyFastPolicy { .. } => None,
            TieringDescriptor::ServiceLevelPool {
                pool,
                service_level,
                workload,
            } => Some(ServiceLevelPlacement {
                pool: pool.clone(),
                service_level: service_level.clone(),
                workload: workload.clone(),
            }),
        }
    }
}

/// Pool / service level / workload triple a device group is created against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceLevelPlacement {
    pub pool: String,
    pub service_level: Option<String>,
    pub workload: Option<String>,
}

// =============================================================================
// Operations
// =============================================================================

/// Mutating operations understood by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ArrayOperation {
    CreateDeviceGroup {
        system: String,
        name: String,
        placement: Option<ServiceLevelPlacement>,
    },
    AssociateFastPolicy {
        system: String,
        policy: String,
        group: ResourceHandle,
    },
    CreateInitiatorGroup {
        system: String,
        name: String,
        initial_member: ResourceHandle,
    },
    CreateHardwareId {
        system: String,
        storage_id: String,
        protocol: Protocol,
    },
    CreateMaskingView {
        system: String,
        name: String,
        device_group: ResourceHandle,
        initiator_group: ResourceHandle,
        port_group: ResourceHandle,
    },
    AddMembers {
        group: ResourceHandle,
        members: Vec<ResourceHandle>,
    },
    RemoveMembers {
        group: ResourceHandle,
        members: Vec<ResourceHandle>,
    },
    DeleteGroup {
        group: ResourceHandle,
    },
    DeleteMaskingView {
        view: ResourceHandle,
    },
}

impl ArrayOperation {
    /// Short operation name for logging and fault injection
    pub fn kind(&self) -> OperationKind {
        match self {
            ArrayOperation::CreateDeviceGroup { .. } => OperationKind::CreateDeviceGroup,
            ArrayOperation::AssociateFastPolicy { .. } => OperationKind::AssociateFastPolicy,
            ArrayOperation::CreateInitiatorGroup { .. } => OperationKind::CreateInitiatorGroup,
            ArrayOperation::CreateHardwareId { .. } => OperationKind::CreateHardwareId,
            ArrayOperation::CreateMaskingView { .. } => OperationKind::CreateMaskingView,
            ArrayOperation::AddMembers { .. } => OperationKind::AddMembers,
            ArrayOperation::RemoveMembers { .. } => OperationKind::RemoveMembers,
            ArrayOperation::DeleteGroup { .. } => OperationKind::DeleteGroup,
            ArrayOperation::DeleteMaskingView { .. } => OperationKind::DeleteMaskingView,
        }
    }
}

/// Discriminant of [`ArrayOperation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateDeviceGroup,
    AssociateFastPolicy,
    CreateInitiatorGroup,
    CreateHardwareId,
    CreateMaskingView,
    AddMembers,
    RemoveMembers,
    DeleteGroup,
    DeleteMaskingView,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::CreateDeviceGroup => "create_device_group",
            OperationKind::AssociateFastPolicy => "associate_fast_policy",
            OperationKind::CreateInitiatorGroup => "create_initiator_group",
            OperationKind::CreateHardwareId => "create_hardware_id",
            OperationKind::CreateMaskingView => "create_masking_view",
            OperationKind::AddMembers => "add_members",
            OperationKind::RemoveMembers => "remove_members",
            OperationKind::DeleteGroup => "delete_group",
            OperationKind::DeleteMaskingView => "delete_masking_view",
        };
        write!(f, "{}", name)
    }
}

/// What the array answered to an invoke
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOutcome {
    /// [`RC_COMPLETED`], [`RC_JOB_STARTED`], or an error code
    pub return_code: u32,
    /// Job to poll when `return_code` is [`RC_JOB_STARTED`]
    pub job: Option<ResourceHandle>,
    /// Handle of the created object, for create operations
    pub result: Option<ResourceHandle>,
    /// Error text for rejected operations
    pub message: Option<String>,
}

/// State of an array job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed { code: u32, message: String },
}

// =============================================================================
// Array Transport Port
// =============================================================================

/// Port for the array's management protocol
pub trait ArrayTransport: Send + Sync {
    /// Submit a mutating operation
    fn invoke(&self, operation: ArrayOperation) -> Result<InvokeOutcome>;

    /// Fetch the attributes of one object, `None` if the array no longer has it
    fn get_instance(&self, handle: &ResourceHandle) -> Result<Option<InstanceAttributes>>;

    /// Objects of `result_kind` associated with `handle`
    fn associator_names(
        &self,
        handle: &ResourceHandle,
        result_kind: ObjectKind,
    ) -> Result<Vec<ResourceHandle>>;

    /// All objects of `kind` on `system`
    fn enumerate(&self, system: &str, kind: ObjectKind) -> Result<Vec<ResourceHandle>>;

    /// Poll a job once
    fn job_status(&self, job: &ResourceHandle) -> Result<JobStatus>;
}

pub type ArrayTransportRef = Arc<dyn ArrayTransport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_tokens() {
        assert_eq!(Protocol::Fc.short_token(), "F");
        assert_eq!(Protocol::Iscsi.short_token(), "I");
        assert_eq!(Protocol::Fc.long_token(), "FC");
        assert_eq!(format!("{}", Protocol::Iscsi), "iscsi");
    }

    #[test]
    fn test_tiering_descriptor_from_yaml() {
        let legacy: TieringDescriptor =
            serde_yaml::from_str("type: legacy_fast_policy\npool: SATA_pool\npolicy: gold\n")
                .unwrap();
        assert_eq!(legacy.fast_policy(), Some("gold"));
        assert!(legacy.placement().is_none());

        let slo: TieringDescriptor =
            serde_yaml::from_str("type: service_level_pool\npool: SRP_1\nservice_level: Diamond\n")
                .unwrap();
        let placement = slo.placement().unwrap();
        assert_eq!(placement.pool, "SRP_1");
        assert_eq!(placement.workload, None);
    }

    #[test]
    fn test_handle_display() {
        let handle = ResourceHandle::new(ObjectKind::MaskingView, "SYM-1", "mv-3");
        assert_eq!(handle.to_string(), "SYM-1:MaskingView/mv-3");
    }
}
