//! Simulated Array Backend
//!
//! In-memory implementation of the array management protocol. Mutations are
//! applied when invoked and acknowledged through jobs that complete after a
//! configurable number of polls. Faults can be injected per operation kind to
//! exercise rollback and teardown error paths.

use crate::domain::ports::{
    ArrayOperation, ArrayTransport, InstanceAttributes, InvokeOutcome, JobStatus, ObjectKind,
    OperationKind, ResourceHandle, PROP_STORAGE_ID, RC_JOB_STARTED,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Return code for rejected operations
pub const RC_FAILED: u32 = 1;

/// Return code for a failing job
pub const RC_JOB_FAILED: u32 = 2;

// =============================================================================
// Fault Injection
// =============================================================================

/// What an injected fault does to the matching invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Accept the operation, then fail its job without applying it
    FailJob,
    /// Reject the operation outright
    Reject,
    /// Report a delete as successful but keep the object
    GhostDelete,
    /// Accept the operation but never complete its job
    StallJob,
}

#[derive(Debug, Clone)]
struct FaultRule {
    operation: OperationKind,
    /// Matching invocations to let through before firing
    skip: u32,
    action: FaultAction,
}

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone)]
struct ViewBinding {
    device_group: ResourceHandle,
    initiator_group: ResourceHandle,
    port_group: ResourceHandle,
}

#[derive(Debug, Clone)]
struct ObjectRecord {
    name: String,
    properties: BTreeMap<String, String>,
    members: BTreeSet<ResourceHandle>,
    view: Option<ViewBinding>,
    policy: Option<ResourceHandle>,
    created_at: DateTime<Utc>,
}

impl ObjectRecord {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
            members: BTreeSet::new(),
            view: None,
            policy: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    remaining_polls: u32,
    outcome: JobStatus,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ArrayState {
    next_id: u64,
    objects: BTreeMap<ResourceHandle, ObjectRecord>,
    jobs: BTreeMap<String, JobRecord>,
    invocations: BTreeMap<OperationKind, u32>,
}

impl ArrayState {
    fn allocate(&mut self, kind: ObjectKind, system: &str) -> ResourceHandle {
        self.next_id += 1;
        let prefix = match kind {
            ObjectKind::Volume => "vol",
            ObjectKind::DeviceGroup => "sg",
            ObjectKind::InitiatorGroup => "ig",
            ObjectKind::PortGroup => "pg",
            ObjectKind::MaskingView => "mv",
            ObjectKind::HardwareId => "hwid",
            ObjectKind::TargetPort => "port",
            ObjectKind::FastPolicy => "fp",
            ObjectKind::Job => "job",
        };
        ResourceHandle::new(kind, system, format!("{}-{:05}", prefix, self.next_id))
    }

    fn find_by_name(&self, system: &str, kind: ObjectKind, name: &str) -> Option<ResourceHandle> {
        self.objects
            .iter()
            .find(|(h, rec)| h.kind == kind && h.system == system && rec.name == name)
            .map(|(h, _)| h.clone())
    }

    fn record(&self, handle: &ResourceHandle, expected: ObjectKind) -> Result<&ObjectRecord> {
        if handle.kind != expected {
            return Err(reject(format!("{} is not a {}", handle, expected)));
        }
        self.objects
            .get(handle)
            .ok_or_else(|| reject(format!("{} does not exist", handle)))
    }

    fn record_mut(&mut self, handle: &ResourceHandle) -> Result<&mut ObjectRecord> {
        self.objects
            .get_mut(handle)
            .ok_or_else(|| reject(format!("{} does not exist", handle)))
    }

    fn views_referencing(&self, handle: &ResourceHandle) -> Vec<ResourceHandle> {
        self.objects
            .iter()
            .filter(|(_, rec)| {
                rec.view.as_ref().is_some_and(|v| {
                    &v.device_group == handle
                        || &v.initiator_group == handle
                        || &v.port_group == handle
                })
            })
            .map(|(h, _)| h.clone())
            .collect()
    }

    fn groups_containing(&self, member: &ResourceHandle, kind: ObjectKind) -> Vec<ResourceHandle> {
        self.objects
            .iter()
            .filter(|(h, rec)| h.kind == kind && rec.members.contains(member))
            .map(|(h, _)| h.clone())
            .collect()
    }

    fn ensure_unique(&self, system: &str, kind: ObjectKind, name: &str) -> Result<()> {
        if self.find_by_name(system, kind, name).is_some() {
            return Err(reject(format!("{} {} already exists", kind, name)));
        }
        Ok(())
    }

    fn insert(&mut self, kind: ObjectKind, system: &str, record: ObjectRecord) -> ResourceHandle {
        let handle = self.allocate(kind, system);
        self.objects.insert(handle.clone(), record);
        handle
    }

    /// Validate and apply one operation, returning the created handle if any
    fn apply(&mut self, operation: &ArrayOperation, ghost: bool) -> Result<Option<ResourceHandle>> {
        match operation {
            ArrayOperation::CreateDeviceGroup {
                system,
                name,
                placement,
            } => {
                self.ensure_unique(system, ObjectKind::DeviceGroup, name)?;
                let mut record = ObjectRecord::named(name);
                if let Some(placement) = placement {
                    record.properties.insert("pool".into(), placement.pool.clone());
                    if let Some(slo) = &placement.service_level {
                        record.properties.insert("service_level".into(), slo.clone());
                    }
                    if let Some(workload) = &placement.workload {
                        record.properties.insert("workload".into(), workload.clone());
                    }
                }
                Ok(Some(self.insert(ObjectKind::DeviceGroup, system, record)))
            }
            ArrayOperation::AssociateFastPolicy {
                system,
                policy,
                group,
            } => {
                let policy_handle = self
                    .find_by_name(system, ObjectKind::FastPolicy, policy)
                    .ok_or_else(|| reject(format!("FAST policy {} does not exist", policy)))?;
                self.record(group, ObjectKind::DeviceGroup)?;
                self.record_mut(group)?.policy = Some(policy_handle);
                Ok(None)
            }
            ArrayOperation::CreateInitiatorGroup {
                system,
                name,
                initial_member,
            } => {
                self.ensure_unique(system, ObjectKind::InitiatorGroup, name)?;
                self.record(initial_member, ObjectKind::HardwareId)?;
                self.ensure_hardware_id_free(initial_member)?;
                let mut record = ObjectRecord::named(name);
                record.members.insert(initial_member.clone());
                Ok(Some(self.insert(ObjectKind::InitiatorGroup, system, record)))
            }
            ArrayOperation::CreateHardwareId {
                system,
                storage_id,
                protocol,
            } => {
                let exists = self.objects.iter().any(|(h, rec)| {
                    h.kind == ObjectKind::HardwareId
                        && h.system == *system
                        && rec.properties.get(PROP_STORAGE_ID) == Some(storage_id)
                });
                if exists {
                    return Err(reject(format!("hardware ID {} already exists", storage_id)));
                }
                let mut record = ObjectRecord::named(storage_id);
                record
                    .properties
                    .insert(PROP_STORAGE_ID.into(), storage_id.clone());
                record
                    .properties
                    .insert("protocol".into(), protocol.to_string());
                Ok(Some(self.insert(ObjectKind::HardwareId, system, record)))
            }
            ArrayOperation::CreateMaskingView {
                system,
                name,
                device_group,
                initiator_group,
                port_group,
            } => {
                self.ensure_unique(system, ObjectKind::MaskingView, name)?;
                self.record(device_group, ObjectKind::DeviceGroup)?;
                self.record(initiator_group, ObjectKind::InitiatorGroup)?;
                self.record(port_group, ObjectKind::PortGroup)?;
                let mut record = ObjectRecord::named(name);
                record.view = Some(ViewBinding {
                    device_group: device_group.clone(),
                    initiator_group: initiator_group.clone(),
                    port_group: port_group.clone(),
                });
                Ok(Some(self.insert(ObjectKind::MaskingView, system, record)))
            }
            ArrayOperation::AddMembers { group, members } => {
                let record = self.objects.get(group).ok_or_else(|| {
                    reject(format!("{} does not exist", group))
                })?;
                for member in members {
                    if record.members.contains(member) {
                        return Err(reject(format!("{} is already a member of {}", member, group)));
                    }
                    if !self.objects.contains_key(member) {
                        return Err(reject(format!("{} does not exist", member)));
                    }
                    match (group.kind, member.kind) {
                        (ObjectKind::DeviceGroup, ObjectKind::Volume) => {}
                        (ObjectKind::InitiatorGroup, ObjectKind::HardwareId) => {
                            self.ensure_hardware_id_free(member)?;
                        }
                        _ => {
                            return Err(reject(format!("{} cannot hold {}", group, member)));
                        }
                    }
                }
                self.record_mut(group)?.members.extend(members.iter().cloned());
                Ok(None)
            }
            ArrayOperation::RemoveMembers { group, members } => {
                let record = self.record_mut(group)?;
                if let Some(missing) = members.iter().find(|m| !record.members.contains(*m)) {
                    return Err(reject(format!("{} is not a member of {}", missing, group)));
                }
                for member in members {
                    record.members.remove(member);
                }
                Ok(None)
            }
            ArrayOperation::DeleteGroup { group } => {
                let record = self
                    .objects
                    .get(group)
                    .ok_or_else(|| reject(format!("{} does not exist", group)))?;
                if !record.members.is_empty() {
                    return Err(reject(format!("{} still has members", group)));
                }
                if !self.views_referencing(group).is_empty() {
                    return Err(reject(format!("{} is referenced by a masking view", group)));
                }
                if !ghost {
                    self.objects.remove(group);
                }
                Ok(None)
            }
            ArrayOperation::DeleteMaskingView { view } => {
                self.record(view, ObjectKind::MaskingView)?;
                if !ghost {
                    self.objects.remove(view);
                }
                Ok(None)
            }
        }
    }

    fn ensure_hardware_id_free(&self, hardware_id: &ResourceHandle) -> Result<()> {
        if let Some(owner) = self
            .groups_containing(hardware_id, ObjectKind::InitiatorGroup)
            .first()
        {
            return Err(reject(format!(
                "{} already belongs to initiator group {}",
                hardware_id, owner
            )));
        }
        Ok(())
    }
}

fn reject(message: String) -> Error {
    Error::OperationRejected {
        operation: "simulated".into(),
        code: RC_FAILED,
        message,
    }
}

// =============================================================================
// Simulated Array
// =============================================================================

/// In-memory array implementing [`ArrayTransport`]
#[derive(Debug)]
pub struct SimulatedArray {
    system: String,
    state: RwLock<ArrayState>,
    faults: Mutex<Vec<FaultRule>>,
    job_latency_polls: u32,
}

impl SimulatedArray {
    /// Create an empty array whose jobs complete on the first poll
    pub fn new(system: impl Into<String>) -> Self {
        Self::with_job_latency(system, 0)
    }

    /// Create an empty array whose jobs report running for `polls` polls
    pub fn with_job_latency(system: impl Into<String>, polls: u32) -> Self {
        Self {
            system: system.into(),
            state: RwLock::new(ArrayState::default()),
            faults: Mutex::new(Vec::new()),
            job_latency_polls: polls,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Provision a volume
    pub fn add_volume(&self, name: &str) -> ResourceHandle {
        let mut state = self.state.write();
        state.insert(ObjectKind::Volume, &self.system, ObjectRecord::named(name))
    }

    /// Provision a port group with its target ports
    pub fn add_port_group(&self, name: &str, ports: &[&str]) -> ResourceHandle {
        let mut state = self.state.write();
        let mut record = ObjectRecord::named(name);
        for port in ports {
            let handle = state.insert(ObjectKind::TargetPort, &self.system, ObjectRecord::named(*port));
            record.members.insert(handle);
        }
        state.insert(ObjectKind::PortGroup, &self.system, record)
    }

    /// Define a FAST policy
    pub fn add_fast_policy(&self, name: &str) -> ResourceHandle {
        let mut state = self.state.write();
        state.insert(ObjectKind::FastPolicy, &self.system, ObjectRecord::named(name))
    }

    /// Create a device group outside the orchestrator (operator action)
    pub fn add_device_group(&self, name: &str, volumes: &[&ResourceHandle]) -> ResourceHandle {
        let mut state = self.state.write();
        let mut record = ObjectRecord::named(name);
        record.members.extend(volumes.iter().map(|v| (*v).clone()));
        state.insert(ObjectKind::DeviceGroup, &self.system, record)
    }

    /// Put an object into an existing group outside the orchestrator
    pub fn add_member(&self, group: &ResourceHandle, member: &ResourceHandle) {
        if let Some(record) = self.state.write().objects.get_mut(group) {
            record.members.insert(member.clone());
        }
    }

    /// Create an initiator group with fresh hardware IDs outside the orchestrator
    pub fn add_initiator_group(&self, name: &str, storage_ids: &[&str]) -> ResourceHandle {
        let mut state = self.state.write();
        let mut record = ObjectRecord::named(name);
        for storage_id in storage_ids {
            let mut hwid = ObjectRecord::named(*storage_id);
            hwid.properties
                .insert(PROP_STORAGE_ID.into(), storage_id.to_string());
            record
                .members
                .insert(state.insert(ObjectKind::HardwareId, &self.system, hwid));
        }
        state.insert(ObjectKind::InitiatorGroup, &self.system, record)
    }

    /// Create a masking view outside the orchestrator
    pub fn add_masking_view(
        &self,
        name: &str,
        device_group: &ResourceHandle,
        initiator_group: &ResourceHandle,
        port_group: &ResourceHandle,
    ) -> ResourceHandle {
        let mut state = self.state.write();
        let mut record = ObjectRecord::named(name);
        record.view = Some(ViewBinding {
            device_group: device_group.clone(),
            initiator_group: initiator_group.clone(),
            port_group: port_group.clone(),
        });
        state.insert(ObjectKind::MaskingView, &self.system, record)
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fire `action` on the `nth` (1-based) upcoming invocation of `operation`
    pub fn inject_fault(&self, operation: OperationKind, nth: u32, action: FaultAction) {
        self.faults.lock().push(FaultRule {
            operation,
            skip: nth.saturating_sub(1),
            action,
        });
    }

    /// Drop all pending faults
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn take_fault(&self, operation: OperationKind) -> Option<FaultAction> {
        let mut faults = self.faults.lock();
        let mut fired = None;
        faults.retain_mut(|rule| {
            if fired.is_some() || rule.operation != operation {
                return true;
            }
            if rule.skip == 0 {
                fired = Some(rule.action);
                false
            } else {
                rule.skip -= 1;
                true
            }
        });
        fired
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Handle of the object of `kind` called `name`
    pub fn find(&self, kind: ObjectKind, name: &str) -> Option<ResourceHandle> {
        self.state.read().find_by_name(&self.system, kind, name)
    }

    /// Whether an object of `kind` called `name` exists
    pub fn exists(&self, kind: ObjectKind, name: &str) -> bool {
        self.find(kind, name).is_some()
    }

    /// Names of the device groups containing a volume
    pub fn groups_of(&self, volume: &ResourceHandle) -> Vec<String> {
        let state = self.state.read();
        state
            .groups_containing(volume, ObjectKind::DeviceGroup)
            .iter()
            .filter_map(|h| state.objects.get(h).map(|r| r.name.clone()))
            .collect()
    }

    /// Names of the members of the group of `kind` called `name`
    pub fn member_names(&self, kind: ObjectKind, name: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .find_by_name(&self.system, kind, name)
            .and_then(|h| state.objects.get(&h))
            .map(|rec| {
                rec.members
                    .iter()
                    .filter_map(|m| state.objects.get(m).map(|r| r.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of objects of a kind
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.state
            .read()
            .objects
            .keys()
            .filter(|h| h.kind == kind)
            .count()
    }

    /// Name of the FAST policy a device group is associated with
    pub fn policy_of(&self, group_name: &str) -> Option<String> {
        let state = self.state.read();
        let group = state.find_by_name(&self.system, ObjectKind::DeviceGroup, group_name)?;
        let policy = state.objects.get(&group)?.policy.clone()?;
        state.objects.get(&policy).map(|r| r.name.clone())
    }

    /// How many times an operation kind was invoked
    pub fn invocations(&self, operation: OperationKind) -> u32 {
        self.state
            .read()
            .invocations
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Jobs submitted but not yet reported terminal
    pub fn pending_jobs(&self) -> usize {
        self.state.read().jobs.len()
    }

    fn check_system(&self, system: &str) -> Result<()> {
        if system != self.system {
            return Err(Error::Transport(format!(
                "unknown storage system {} (array is {})",
                system, self.system
            )));
        }
        Ok(())
    }
}

impl ArrayTransport for SimulatedArray {
    fn invoke(&self, operation: ArrayOperation) -> Result<InvokeOutcome> {
        let kind = operation.kind();
        let fault = self.take_fault(kind);
        let mut state = self.state.write();
        *state.invocations.entry(kind).or_insert(0) += 1;

        if fault == Some(FaultAction::Reject) {
            warn!(operation = %kind, "Injected rejection");
            return Ok(InvokeOutcome {
                return_code: RC_FAILED,
                job: None,
                result: None,
                message: Some(format!("injected rejection of {}", kind)),
            });
        }

        let (result, outcome) = if fault == Some(FaultAction::FailJob) {
            warn!(operation = %kind, "Injected job failure");
            (
                None,
                JobStatus::Failed {
                    code: RC_JOB_FAILED,
                    message: format!("injected failure of {}", kind),
                },
            )
        } else {
            let ghost = fault == Some(FaultAction::GhostDelete);
            match state.apply(&operation, ghost) {
                Ok(result) => (result, JobStatus::Completed),
                Err(Error::OperationRejected { message, .. }) => {
                    debug!(operation = %kind, %message, "Operation rejected");
                    return Ok(InvokeOutcome {
                        return_code: RC_FAILED,
                        job: None,
                        result: None,
                        message: Some(message),
                    });
                }
                Err(e) => return Err(e),
            }
        };

        let job = state.allocate(ObjectKind::Job, &self.system);
        let remaining_polls = if fault == Some(FaultAction::StallJob) {
            u32::MAX
        } else {
            self.job_latency_polls
        };
        state.jobs.insert(
            job.id.clone(),
            JobRecord {
                remaining_polls,
                outcome,
                submitted_at: Utc::now(),
            },
        );

        Ok(InvokeOutcome {
            return_code: RC_JOB_STARTED,
            job: Some(job),
            result,
            message: None,
        })
    }

    fn get_instance(&self, handle: &ResourceHandle) -> Result<Option<InstanceAttributes>> {
        self.check_system(&handle.system)?;
        let state = self.state.read();
        Ok(state.objects.get(handle).map(|rec| {
            let mut properties = rec.properties.clone();
            properties.insert("created_at".into(), rec.created_at.to_rfc3339());
            InstanceAttributes {
                handle: handle.clone(),
                name: rec.name.clone(),
                properties,
            }
        }))
    }

    fn associator_names(
        &self,
        handle: &ResourceHandle,
        result_kind: ObjectKind,
    ) -> Result<Vec<ResourceHandle>> {
        self.check_system(&handle.system)?;
        let state = self.state.read();
        let Some(record) = state.objects.get(handle) else {
            return Ok(Vec::new());
        };

        let associated = match (handle.kind, result_kind) {
            (ObjectKind::Volume, ObjectKind::DeviceGroup)
            | (ObjectKind::HardwareId, ObjectKind::InitiatorGroup) => {
                state.groups_containing(handle, result_kind)
            }
            (ObjectKind::DeviceGroup, ObjectKind::Volume)
            | (ObjectKind::InitiatorGroup, ObjectKind::HardwareId)
            | (ObjectKind::PortGroup, ObjectKind::TargetPort) => {
                record.members.iter().cloned().collect()
            }
            (
                ObjectKind::DeviceGroup | ObjectKind::InitiatorGroup | ObjectKind::PortGroup,
                ObjectKind::MaskingView,
            ) => state.views_referencing(handle),
            (ObjectKind::MaskingView, kind) => record
                .view
                .as_ref()
                .map(|v| match kind {
                    ObjectKind::DeviceGroup => vec![v.device_group.clone()],
                    ObjectKind::InitiatorGroup => vec![v.initiator_group.clone()],
                    ObjectKind::PortGroup => vec![v.port_group.clone()],
                    _ => Vec::new(),
                })
                .unwrap_or_default(),
            (ObjectKind::DeviceGroup, ObjectKind::FastPolicy) => {
                record.policy.iter().cloned().collect()
            }
            _ => Vec::new(),
        };

        Ok(associated)
    }

    fn enumerate(&self, system: &str, kind: ObjectKind) -> Result<Vec<ResourceHandle>> {
        self.check_system(system)?;
        Ok(self
            .state
            .read()
            .objects
            .keys()
            .filter(|h| h.kind == kind)
            .cloned()
            .collect())
    }

    fn job_status(&self, job: &ResourceHandle) -> Result<JobStatus> {
        let mut state = self.state.write();
        let record = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| Error::Transport(format!("unknown job {}", job)))?;

        if record.remaining_polls > 0 {
            record.remaining_polls = record.remaining_polls.saturating_sub(1);
            debug!(job = %job.id, since = %record.submitted_at, "Job still running");
            return Ok(JobStatus::Running);
        }
        let outcome = record.outcome.clone();
        state.jobs.remove(&job.id);
        Ok(outcome)
    }
}
