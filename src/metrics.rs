//! Orchestrator Metrics
//!
//! Prometheus counters for attach, rollback and teardown outcomes. Each
//! [`MaskingMetrics`] owns a private registry so several orchestrators (and
//! tests) never collide on metric names.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Outcome label values
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";
pub const OUTCOME_ROLLED_BACK: &str = "rolled_back";
pub const OUTCOME_ROLLBACK_FAILED: &str = "rollback_failed";

/// Counters exported by the orchestrator
#[derive(Clone)]
pub struct MaskingMetrics {
    registry: Registry,
    setup_total: IntCounterVec,
    rollback_total: IntCounterVec,
    teardown_total: IntCounterVec,
    job_polls_total: IntCounter,
}

impl std::fmt::Debug for MaskingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskingMetrics")
            .field("job_polls_total", &self.job_polls_total.get())
            .finish()
    }
}

impl MaskingMetrics {
    /// Create counters on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let setup_total = counter_vec(
            &registry,
            "masking_setup_total",
            "Masking view setup attempts by outcome",
        )?;
        let rollback_total = counter_vec(
            &registry,
            "masking_rollback_total",
            "Rollbacks after failed setup attempts by outcome",
        )?;
        let teardown_total = counter_vec(
            &registry,
            "masking_teardown_total",
            "Volume teardowns by outcome",
        )?;
        let job_polls_total = IntCounter::new("masking_job_polls_total", "Array job polls issued")?;
        registry.register(Box::new(job_polls_total.clone()))?;

        Ok(Self {
            registry,
            setup_total,
            rollback_total,
            teardown_total,
            job_polls_total,
        })
    }

    pub fn record_setup(&self, outcome: &str) {
        self.setup_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_rollback(&self, outcome: &str) {
        self.rollback_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_teardown(&self, outcome: &str) {
        self.teardown_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_job_poll(&self) {
        self.job_polls_total.inc();
    }

    /// Current value of a setup counter
    pub fn setup_count(&self, outcome: &str) -> u64 {
        self.setup_total.with_label_values(&[outcome]).get()
    }

    /// Current value of a rollback counter
    pub fn rollback_count(&self, outcome: &str) -> u64 {
        self.rollback_total.with_label_values(&[outcome]).get()
    }

    /// Current value of a teardown counter
    pub fn teardown_count(&self, outcome: &str) -> u64 {
        self.teardown_total.with_label_values(&[outcome]).get()
    }

    pub fn job_polls(&self) -> u64 {
        self.job_polls_total.get()
    }

    /// Render all counters in the text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["outcome"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
