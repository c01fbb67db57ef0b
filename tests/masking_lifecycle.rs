//! Attach / rollback / teardown lifecycle against the simulated array

use assert_matches::assert_matches;
use masking_orchestrator::config::ArrayConfig;
use masking_orchestrator::controlplane::backends::{FaultAction, SimulatedArray};
use masking_orchestrator::metrics::{OUTCOME_ROLLBACK_FAILED, OUTCOME_ROLLED_BACK, OUTCOME_SUCCESS};
use masking_orchestrator::{
    ArrayOperation, ArrayTransport, ArrayTransportRef, Error, ErrorClass, HostConnector,
    InstanceAttributes, InvokeOutcome, JobStatus, MaskingOrchestrator, MaskingViewRequest,
    ObjectKind, OperationKind, OrchestratorConfig, Protocol, ResourceHandle, TieringDescriptor,
};
use std::sync::Arc;
use std::time::Duration;

const SYSTEM: &str = "SYMMETRIX+000195900551";
const WWPN_A: &str = "10000090FA534CD0";
const WWPN_B: &str = "10000090FA534CD1";

const GOLD_SG: &str = "OS-h1-gold-F-SG";
const GOLD_MV: &str = "OS-h1-gold-F-MV";
const H1_IG: &str = "OS-h1-FC-IG";
const GOLD_DEFAULT: &str = "OS_default_gold_SG";
const H1_IQN: &str = "iqn.1993-08.org.debian:01:h1";

/// Slows device-group member reads so concurrent callers overlap
struct SlowMemberReads {
    inner: Arc<SimulatedArray>,
    delay: Duration,
}

impl ArrayTransport for SlowMemberReads {
    fn invoke(&self, operation: ArrayOperation) -> masking_orchestrator::Result<InvokeOutcome> {
        self.inner.invoke(operation)
    }

    fn get_instance(
        &self,
        handle: &ResourceHandle,
    ) -> masking_orchestrator::Result<Option<InstanceAttributes>> {
        self.inner.get_instance(handle)
    }

    fn associator_names(
        &self,
        handle: &ResourceHandle,
        result_kind: ObjectKind,
    ) -> masking_orchestrator::Result<Vec<ResourceHandle>> {
        let members = self.inner.associator_names(handle, result_kind)?;
        if handle.kind == ObjectKind::DeviceGroup && result_kind == ObjectKind::Volume {
            std::thread::sleep(self.delay);
        }
        Ok(members)
    }

    fn enumerate(
        &self,
        system: &str,
        kind: ObjectKind,
    ) -> masking_orchestrator::Result<Vec<ResourceHandle>> {
        self.inner.enumerate(system, kind)
    }

    fn job_status(&self, job: &ResourceHandle) -> masking_orchestrator::Result<JobStatus> {
        self.inner.job_status(job)
    }
}

struct Harness {
    array: Arc<SimulatedArray>,
    orchestrator: MaskingOrchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_port_group("OS-fc-PG", 0)
    }

    fn with_port_group(configured: &str, job_latency_polls: u32) -> Self {
        Self::build(configured, job_latency_polls, |array| -> ArrayTransportRef { array })
    }

    fn build(
        configured: &str,
        job_latency_polls: u32,
        transport: impl FnOnce(Arc<SimulatedArray>) -> ArrayTransportRef,
    ) -> Self {
        let array = Arc::new(SimulatedArray::with_job_latency(SYSTEM, job_latency_polls));
        array.add_fast_policy("gold");
        array.add_fast_policy("silver");
        array.add_port_group("OS-fc-PG", &["FA-1D:4", "FA-2D:4"]);

        let mut config = OrchestratorConfig::default();
        config.job_poll.interval_ms = 0;
        config.job_poll.max_attempts = 10;
        config.arrays.push(ArrayConfig {
            system: SYSTEM.into(),
            port_groups: vec![configured.to_string()],
        });

        let orchestrator = MaskingOrchestrator::new(config, transport(array.clone())).unwrap();
        Self { array, orchestrator }
    }

    /// A new volume sitting in its default group
    fn provision(&self, name: &str, tiering: &TieringDescriptor) -> ResourceHandle {
        let volume = self.array.add_volume(name);
        let default_name = self.orchestrator.naming().default_group_name(tiering);
        match self.array.find(ObjectKind::DeviceGroup, &default_name) {
            Some(group) => self.array.add_member(&group, &volume),
            None => {
                self.array.add_device_group(&default_name, &[&volume]);
            }
        }
        volume
    }

    fn request(
        &self,
        volume: &ResourceHandle,
        host: &str,
        wwpns: &[&str],
        tiering: TieringDescriptor,
    ) -> MaskingViewRequest {
        let connector = HostConnector {
            host: host.into(),
            wwpns: wwpns.iter().map(|w| w.to_string()).collect(),
            iscsi_initiator: None,
        };
        self.orchestrator
            .build_request(volume.clone(), volume.id.clone(), connector, Protocol::Fc, tiering)
            .unwrap()
    }

    fn iscsi_request(&self, volume: &ResourceHandle, tiering: TieringDescriptor) -> MaskingViewRequest {
        let connector = HostConnector {
            host: "h1.example.com".into(),
            wwpns: Vec::new(),
            iscsi_initiator: Some(H1_IQN.into()),
        };
        self.orchestrator
            .build_request(volume.clone(), volume.id.clone(), connector, Protocol::Iscsi, tiering)
            .unwrap()
    }

    /// Initiator group bound to the masking view called `view`
    fn view_initiators(&self, view: &str) -> ResourceHandle {
        let view = self.array.find(ObjectKind::MaskingView, view).unwrap();
        self.array
            .associator_names(&view, ObjectKind::InitiatorGroup)
            .unwrap()
            .pop()
            .unwrap()
    }

    fn groups_of(&self, volume: &ResourceHandle) -> Vec<String> {
        let mut groups = self.array.groups_of(volume);
        groups.sort();
        groups
    }
}

fn legacy(policy: &str) -> TieringDescriptor {
    TieringDescriptor::LegacyFastPolicy {
        pool: "SATA_pool".into(),
        policy: Some(policy.into()),
    }
}

// =============================================================================
// Attach and detach
// =============================================================================

#[test]
fn test_attach_then_detach_last_volume() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1.example.com", &[WWPN_A], legacy("gold"));

    let outcome = h.orchestrator.setup_masking_view(&request).unwrap();

    assert!(!outcome.reused_view);
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG]);
    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
    assert!(h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert_eq!(h.array.policy_of(GOLD_SG).as_deref(), Some("gold"));
    let mut ports = outcome.target_ports.clone();
    ports.sort();
    assert_eq!(ports, vec!["FA-1D:4", "FA-2D:4"]);

    let report = h
        .orchestrator
        .remove_and_reset_members(&v1, &request, true)
        .unwrap();

    assert_eq!(report.views_deleted, vec![GOLD_MV]);
    assert_eq!(report.initiator_groups_deleted, vec![H1_IG]);
    assert_eq!(report.device_groups_deleted, vec![GOLD_SG]);
    assert!(report.returned_to_default);
    assert!(!h.array.exists(ObjectKind::MaskingView, GOLD_MV));
    assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG));
    assert!(!h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.setup_count(OUTCOME_SUCCESS), 1);
    assert_eq!(metrics.teardown_count(OUTCOME_SUCCESS), 1);
    assert!(metrics.job_polls() > 0);
}

#[test]
fn test_repeated_attach_reuses_view() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));

    let first = h.orchestrator.setup_masking_view(&request).unwrap();
    let second = h.orchestrator.setup_masking_view(&request).unwrap();

    assert!(second.reused_view);
    assert_eq!(first.masking_view, second.masking_view);
    assert_eq!(h.array.invocations(OperationKind::CreateMaskingView), 1);
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG]);
}

#[test]
fn test_service_level_names() {
    let h = Harness::new();
    let tiering = TieringDescriptor::ServiceLevelPool {
        pool: "SRP_1".into(),
        service_level: Some("Diamond".into()),
        workload: Some("OLTP".into()),
    };
    let v1 = h.provision("v1", &tiering);
    let request = h.request(&v1, "h1", &[WWPN_A], tiering);

    assert_eq!(request.names.default_group, "OS-SRP_1-Diamond-OLTP-SG");
    h.orchestrator.setup_masking_view(&request).unwrap();

    assert_eq!(h.groups_of(&v1), vec!["OS-h1-SRP_1-Diamond-OLTP-F-SG"]);
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h1-SRP_1-Diamond-OLTP-F-MV"));
    assert_eq!(h.array.invocations(OperationKind::AssociateFastPolicy), 0);
}

#[test]
fn test_detach_non_last_volume_only_removes_membership() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    let r1 = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let r2 = h.request(&v2, "h1", &[WWPN_A], legacy("gold"));

    h.orchestrator.setup_masking_view(&r1).unwrap();
    h.orchestrator.setup_masking_view(&r2).unwrap();

    let report = h.orchestrator.remove_and_reset_members(&v1, &r1, true).unwrap();
    assert_eq!(report.memberships_removed, vec![GOLD_SG]);
    assert!(report.views_deleted.is_empty());
    assert!(report.device_groups_deleted.is_empty());
    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
    assert_eq!(h.array.member_names(ObjectKind::DeviceGroup, GOLD_SG), vec!["v2"]);
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);

    let report = h.orchestrator.remove_and_reset_members(&v2, &r2, true).unwrap();
    assert_eq!(report.views_deleted, vec![GOLD_MV]);
    assert_eq!(h.array.count(ObjectKind::MaskingView), 0);
    assert_eq!(h.groups_of(&v2), vec![GOLD_DEFAULT]);
}

#[test]
fn test_detach_keeps_initiator_group_used_by_other_view() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("silver"));
    let gold = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let silver = h.request(&v2, "h1", &[WWPN_A], legacy("silver"));

    h.orchestrator.setup_masking_view(&gold).unwrap();
    h.orchestrator.setup_masking_view(&silver).unwrap();
    assert_eq!(h.array.count(ObjectKind::InitiatorGroup), 1);

    let report = h.orchestrator.remove_and_reset_members(&v1, &gold, true).unwrap();
    assert_eq!(report.views_deleted, vec![GOLD_MV]);
    assert!(report.initiator_groups_deleted.is_empty());
    assert!(h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h1-silver-F-MV"));
}

#[test]
fn test_detach_without_reset_leaves_volume_ungrouped() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    h.orchestrator.setup_masking_view(&request).unwrap();

    let report = h
        .orchestrator
        .remove_and_reset_members(&v1, &request, false)
        .unwrap();

    assert!(!report.returned_to_default);
    assert!(h.groups_of(&v1).is_empty());
}

#[test]
fn test_detach_orphaned_device_group_without_view() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    // Grouped by hand, never exported through a view
    h.array.add_device_group(GOLD_SG, &[&v1]);

    let report = h
        .orchestrator
        .remove_and_reset_members(&v1, &request, true)
        .unwrap();

    assert_eq!(report.device_groups_deleted, vec![GOLD_SG]);
    assert!(report.views_deleted.is_empty());
    assert!(!report.returned_to_default);
    assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG));
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
}

// =============================================================================
// Rollback
// =============================================================================

#[test]
fn test_rollback_restores_default_membership_at_every_step() {
    let faults = [
        OperationKind::RemoveMembers,
        OperationKind::CreateDeviceGroup,
        OperationKind::AssociateFastPolicy,
        OperationKind::CreateHardwareId,
        OperationKind::CreateInitiatorGroup,
        OperationKind::AddMembers,
        OperationKind::CreateMaskingView,
    ];

    for fault in faults {
        let h = Harness::new();
        let v1 = h.provision("v1", &legacy("gold"));
        let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
        h.array.inject_fault(fault, 1, FaultAction::FailJob);

        let err = h.orchestrator.setup_masking_view(&request).unwrap_err();

        assert_matches!(err, Error::MaskingViewSetupFailed { .. }, "fault {}", fault);
        assert!(err.is_retryable(), "fault {}", fault);
        assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT], "fault {}", fault);
        assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG), "fault {}", fault);
        assert!(!h.array.exists(ObjectKind::InitiatorGroup, H1_IG), "fault {}", fault);
        assert_eq!(h.array.count(ObjectKind::MaskingView), 0, "fault {}", fault);
        assert_eq!(
            h.orchestrator.metrics().rollback_count(OUTCOME_ROLLED_BACK),
            1,
            "fault {}",
            fault
        );
    }
}

#[test]
fn test_rollback_preserves_initiator_group_used_by_other_view() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("silver"));
    let silver = h.request(&v2, "h1", &[WWPN_A], legacy("silver"));
    h.orchestrator.setup_masking_view(&silver).unwrap();

    h.array
        .inject_fault(OperationKind::CreateMaskingView, 1, FaultAction::FailJob);
    let gold = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let err = h.orchestrator.setup_masking_view(&gold).unwrap_err();

    assert_matches!(err, Error::MaskingViewSetupFailed { .. });
    assert!(h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h1-silver-F-MV"));
    assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG));
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
    assert_eq!(h.groups_of(&v2), vec!["OS-h1-silver-F-SG"]);
}

#[test]
fn test_failed_rollback_is_fatal() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    h.array
        .inject_fault(OperationKind::CreateMaskingView, 1, FaultAction::FailJob);
    // Second AddMembers is the return to the default group
    h.array
        .inject_fault(OperationKind::AddMembers, 2, FaultAction::FailJob);

    let err = h.orchestrator.setup_masking_view(&request).unwrap_err();

    assert_matches!(err, Error::RollbackFailed { ref view, .. } if view == GOLD_MV);
    assert!(err.is_fatal());
    assert_eq!(
        h.orchestrator.metrics().rollback_count(OUTCOME_ROLLBACK_FAILED),
        1
    );
}

#[test]
fn test_existing_view_bound_to_other_group_is_rolled_back() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let other = h.array.add_device_group("ops-SG", &[]);
    let foreign_ig = h.array.add_initiator_group("ops-IG", &["5000000000000001"]);
    let pg = h.array.find(ObjectKind::PortGroup, "OS-fc-PG").unwrap();
    h.array.add_masking_view(GOLD_MV, &other, &foreign_ig, &pg);

    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let err = h.orchestrator.setup_masking_view(&request).unwrap_err();

    assert_matches!(
        err,
        Error::MaskingViewSetupFailed { ref source, .. }
            if matches!(**source, Error::ViewGroupMismatch { .. })
    );
    assert_eq!(err.class(), ErrorClass::Consistency);
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
    assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG));
    assert!(!h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
}

// =============================================================================
// Configuration errors
// =============================================================================

#[test]
fn test_missing_port_group_fails_before_any_change() {
    let h = Harness::with_port_group("OS-missing-PG", 0);
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));

    let err = h.orchestrator.setup_masking_view(&request).unwrap_err();

    assert_matches!(err, Error::PortGroupNotFound { ref name, .. } if name == "OS-missing-PG");
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert_eq!(h.array.invocations(OperationKind::RemoveMembers), 0);
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
}

#[test]
fn test_connector_without_initiators_fails_fast() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[], legacy("gold"));

    let err = h.orchestrator.setup_masking_view(&request).unwrap_err();

    assert_matches!(err, Error::NoInitiators { .. });
    assert!(!err.is_retryable());
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
}

// =============================================================================
// Initiator changes and live migration
// =============================================================================

#[test]
fn test_changed_initiators_update_initiator_group_in_place() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    h.orchestrator
        .setup_masking_view(&h.request(&v1, "h1", &[WWPN_A], legacy("gold")))
        .unwrap();

    let outcome = h
        .orchestrator
        .setup_masking_view(&h.request(&v2, "h1", &[WWPN_A, WWPN_B], legacy("gold")))
        .unwrap();

    assert!(!outcome.reused_view);
    assert_eq!(h.array.invocations(OperationKind::DeleteMaskingView), 0);
    assert_eq!(h.array.count(ObjectKind::MaskingView), 1);
    let mut initiators = h.array.member_names(ObjectKind::InitiatorGroup, H1_IG);
    initiators.sort();
    assert_eq!(initiators, vec![WWPN_A, WWPN_B]);
    let mut members = h.array.member_names(ObjectKind::DeviceGroup, GOLD_SG);
    members.sort();
    assert_eq!(members, vec!["v1", "v2"]);
}

#[test]
fn test_changed_initiators_keep_views_sharing_initiator_group() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    let v3 = h.provision("v3", &legacy("silver"));
    h.orchestrator
        .setup_masking_view(&h.request(&v1, "h1", &[WWPN_A], legacy("gold")))
        .unwrap();
    h.orchestrator
        .setup_masking_view(&h.request(&v3, "h1", &[WWPN_A], legacy("silver")))
        .unwrap();

    let outcome = h
        .orchestrator
        .setup_masking_view(&h.request(&v2, "h1", &[WWPN_A, WWPN_B], legacy("gold")))
        .unwrap();

    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h1-silver-F-MV"));
    assert_eq!(h.view_initiators(GOLD_MV), outcome.initiator_group);
    assert_eq!(h.view_initiators("OS-h1-silver-F-MV"), outcome.initiator_group);
    let mut initiators = h.array.member_names(ObjectKind::InitiatorGroup, H1_IG);
    initiators.sort();
    assert_eq!(initiators, vec![WWPN_A, WWPN_B]);
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG]);
    assert_eq!(h.groups_of(&v2), vec![GOLD_SG]);
    assert_eq!(h.groups_of(&v3), vec!["OS-h1-silver-F-SG"]);
}

#[test]
fn test_changed_initiators_replace_pre_existing_initiator_group() {
    let h = Harness::new();
    let foreign = h.array.add_initiator_group("ops-h1", &[WWPN_A]);
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    h.orchestrator
        .setup_masking_view(&h.request(&v1, "h1", &[WWPN_A], legacy("gold")))
        .unwrap();
    assert_eq!(h.view_initiators(GOLD_MV), foreign);

    let outcome = h
        .orchestrator
        .setup_masking_view(&h.request(&v2, "h1", &[WWPN_B], legacy("gold")))
        .unwrap();

    assert!(!outcome.reused_view);
    assert_eq!(h.array.invocations(OperationKind::DeleteMaskingView), 1);
    assert_eq!(h.view_initiators(GOLD_MV), outcome.initiator_group);
    assert_eq!(h.array.member_names(ObjectKind::InitiatorGroup, H1_IG), vec![WWPN_B]);
    assert!(h.array.exists(ObjectKind::InitiatorGroup, "ops-h1"));
}

#[test]
fn test_failed_view_rebuild_restores_original_view() {
    let h = Harness::new();
    let foreign = h.array.add_initiator_group("ops-h1", &[WWPN_A]);
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    h.orchestrator
        .setup_masking_view(&h.request(&v1, "h1", &[WWPN_A], legacy("gold")))
        .unwrap();

    h.array
        .inject_fault(OperationKind::CreateMaskingView, 1, FaultAction::FailJob);
    let err = h
        .orchestrator
        .setup_masking_view(&h.request(&v2, "h1", &[WWPN_B], legacy("gold")))
        .unwrap_err();

    assert_matches!(
        err,
        Error::MaskingViewSetupFailed { ref rollback, .. }
            if rollback.contains("recreated masking view")
    );
    assert_eq!(h.view_initiators(GOLD_MV), foreign);
    assert!(!h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG]);
    assert_eq!(h.groups_of(&v2), vec![GOLD_DEFAULT]);
    assert_eq!(h.orchestrator.metrics().rollback_count(OUTCOME_ROLLED_BACK), 1);
}

#[test]
fn test_live_migration_remap() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let source = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    h.orchestrator.setup_masking_view(&source).unwrap();

    h.orchestrator
        .remove_and_reset_members(&v1, &source, false)
        .unwrap();
    let mut target = h.request(&v1, "h2", &[WWPN_B], legacy("gold"));
    target.live_migration = true;
    h.orchestrator.setup_masking_view(&target).unwrap();

    assert_eq!(h.groups_of(&v1), vec!["OS-h2-gold-F-SG"]);
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h2-gold-F-MV"));
}

#[test]
fn test_failed_live_migration_keeps_source_membership() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    h.orchestrator
        .setup_masking_view(&h.request(&v1, "h1", &[WWPN_A], legacy("gold")))
        .unwrap();

    h.array
        .inject_fault(OperationKind::CreateMaskingView, 1, FaultAction::FailJob);
    let mut target = h.request(&v1, "h2", &[WWPN_B], legacy("gold"));
    target.live_migration = true;
    let err = h.orchestrator.setup_masking_view(&target).unwrap_err();

    assert_matches!(err, Error::MaskingViewSetupFailed { .. });
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG]);
    assert!(!h.array.exists(ObjectKind::DeviceGroup, "OS-h2-gold-F-SG"));
    assert!(!h.array.exists(ObjectKind::InitiatorGroup, "OS-h2-FC-IG"));
    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
}

#[test]
fn test_detach_after_live_migration_leaves_both_hosts() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let source = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    h.orchestrator.setup_masking_view(&source).unwrap();
    let mut target = h.request(&v1, "h2", &[WWPN_B], legacy("gold"));
    target.live_migration = true;
    h.orchestrator.setup_masking_view(&target).unwrap();
    assert_eq!(h.groups_of(&v1), vec![GOLD_SG, "OS-h2-gold-F-SG"]);

    let report = h
        .orchestrator
        .remove_and_reset_members(&v1, &source, true)
        .unwrap();

    let mut views = report.views_deleted.clone();
    views.sort();
    assert_eq!(views, vec![GOLD_MV, "OS-h2-gold-F-MV"]);
    assert_eq!(report.device_groups_deleted.len(), 2);
    assert_eq!(report.initiator_groups_deleted, vec![H1_IG]);
    // Only the requesting host's canonical initiator group is removed
    assert!(h.array.exists(ObjectKind::InitiatorGroup, "OS-h2-FC-IG"));
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
}

// =============================================================================
// iSCSI
// =============================================================================

#[test]
fn test_iscsi_attach_then_detach() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.iscsi_request(&v1, legacy("gold"));
    assert_eq!(request.names.initiator_group, "OS-h1-iSCSI-IG");

    let outcome = h.orchestrator.setup_masking_view(&request).unwrap();

    assert_eq!(h.groups_of(&v1), vec!["OS-h1-gold-I-SG"]);
    assert!(h.array.exists(ObjectKind::MaskingView, "OS-h1-gold-I-MV"));
    assert_eq!(h.array.member_names(ObjectKind::InitiatorGroup, "OS-h1-iSCSI-IG"), vec![H1_IQN]);
    assert_eq!(h.view_initiators("OS-h1-gold-I-MV"), outcome.initiator_group);

    let again = h.orchestrator.setup_masking_view(&request).unwrap();
    assert!(again.reused_view);

    let report = h
        .orchestrator
        .remove_and_reset_members(&v1, &request, true)
        .unwrap();
    assert_eq!(report.views_deleted, vec!["OS-h1-gold-I-MV"]);
    assert_eq!(report.initiator_groups_deleted, vec!["OS-h1-iSCSI-IG"]);
    assert_eq!(report.device_groups_deleted, vec!["OS-h1-gold-I-SG"]);
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
}

// =============================================================================
// Post-conditions and concurrency
// =============================================================================

#[test]
fn test_ghost_delete_during_teardown_is_fatal() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let request = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    h.orchestrator.setup_masking_view(&request).unwrap();

    h.array
        .inject_fault(OperationKind::DeleteMaskingView, 1, FaultAction::GhostDelete);
    let err = h
        .orchestrator
        .remove_and_reset_members(&v1, &request, true)
        .unwrap_err();

    assert_matches!(
        err,
        Error::TeardownFailed { ref source, .. }
            if matches!(**source, Error::ResidualObject { .. })
    );
    assert!(err.is_fatal());
    assert!(h.array.exists(ObjectKind::MaskingView, GOLD_MV));
}

#[test]
fn test_concurrent_attaches_share_one_view() {
    let h = Harness::with_port_group("OS-fc-PG", 2);
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    let r1 = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let r2 = h.request(&v2, "h1", &[WWPN_A], legacy("gold"));

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| h.orchestrator.setup_masking_view(&r1));
        let b = s.spawn(|| h.orchestrator.setup_masking_view(&r2));
        (a.join().unwrap(), b.join().unwrap())
    });

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.masking_view, b.masking_view);
    assert_eq!(a.device_group, b.device_group);
    assert_eq!(h.array.count(ObjectKind::MaskingView), 1);
    assert_eq!(h.array.invocations(OperationKind::CreateDeviceGroup), 1);
    let mut members = h.array.member_names(ObjectKind::DeviceGroup, GOLD_SG);
    members.sort();
    assert_eq!(members, vec!["v1", "v2"]);
}

#[test]
fn test_concurrent_detaches_of_last_two_volumes() {
    let h = Harness::build("OS-fc-PG", 0, |array| -> ArrayTransportRef {
        Arc::new(SlowMemberReads {
            inner: array,
            delay: Duration::from_millis(20),
        })
    });
    let v1 = h.provision("v1", &legacy("gold"));
    let v2 = h.provision("v2", &legacy("gold"));
    let r1 = h.request(&v1, "h1", &[WWPN_A], legacy("gold"));
    let r2 = h.request(&v2, "h1", &[WWPN_A], legacy("gold"));
    h.orchestrator.setup_masking_view(&r1).unwrap();
    h.orchestrator.setup_masking_view(&r2).unwrap();

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| h.orchestrator.remove_and_reset_members(&v1, &r1, true));
        let b = s.spawn(|| h.orchestrator.remove_and_reset_members(&v2, &r2, true));
        (a.join().unwrap(), b.join().unwrap())
    });

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.views_deleted.len() + b.views_deleted.len(), 1);
    assert_eq!(a.memberships_removed.len() + b.memberships_removed.len(), 1);
    assert!(!h.array.exists(ObjectKind::MaskingView, GOLD_MV));
    assert!(!h.array.exists(ObjectKind::DeviceGroup, GOLD_SG));
    assert!(!h.array.exists(ObjectKind::InitiatorGroup, H1_IG));
    assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
    assert_eq!(h.groups_of(&v2), vec![GOLD_DEFAULT]);
}

#[test]
fn test_volume_always_in_exactly_one_group() {
    let h = Harness::new();
    let v1 = h.provision("v1", &legacy("gold"));
    let hosts = [("h1", WWPN_A), ("h2", WWPN_B), ("h1", WWPN_A)];

    for (host, wwpn) in hosts {
        let request = h.request(&v1, host, &[wwpn], legacy("gold"));
        h.orchestrator.setup_masking_view(&request).unwrap();
        assert_eq!(h.groups_of(&v1).len(), 1);

        h.orchestrator
            .remove_and_reset_members(&v1, &request, true)
            .unwrap();
        assert_eq!(h.groups_of(&v1), vec![GOLD_DEFAULT]);
    }
}
