//! Masking Orchestrator CLI
//!
//! Applies a YAML plan of attach and detach steps against a simulated array.
//! Steps in the same batch run concurrently on the blocking thread pool, so a
//! plan can exercise the named-lock serialization as well as the rollback and
//! teardown paths. With `--report-json` every finished step is written to
//! stdout as one JSON object per line.
//!
//! ```yaml
//! system: SYMMETRIX+000195900551
//! fast_policies: [gold]
//! port_groups:
//!   - name: OS-fc-PG
//!     ports: ["FA-1D:4", "FA-2D:4"]
//! volumes:
//!   - name: v1
//!     tiering: { type: legacy_fast_policy, pool: SATA_pool, policy: gold }
//! batches:
//!   - - action: attach
//!       volume: v1
//!       protocol: fc
//!       connector: { host: h1.example.com, wwpns: ["10000090FA534CD0"] }
//!   - - action: detach
//!       volume: v1
//!       protocol: fc
//!       connector: { host: h1.example.com, wwpns: ["10000090FA534CD0"] }
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use masking_orchestrator::{
    ArrayConfig, HostConnector, MaskingOrchestrator, MaskingViewOutcome, ObjectKind,
    OrchestratorConfig, Protocol, ResourceHandle, SimulatedArray, TeardownReport,
    TieringDescriptor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Masking Orchestrator - masking-view attach/detach against a simulated array
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Orchestrator configuration file (YAML)
    #[arg(long, env = "MASKING_CONFIG")]
    config: Option<PathBuf>,

    /// Plan of attach/detach steps (YAML)
    #[arg(long, env = "MASKING_PLAN")]
    plan: PathBuf,

    /// Polls each simulated job reports as running before completing
    #[arg(long, env = "JOB_LATENCY_POLLS", default_value = "0")]
    job_latency_polls: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print metrics in Prometheus text format when done
    #[arg(long)]
    print_metrics: bool,

    /// Write one JSON report line per finished step to stdout
    #[arg(long, env = "REPORT_JSON")]
    report_json: bool,
}

// =============================================================================
// Plan
// =============================================================================

#[derive(Debug, Deserialize)]
struct Plan {
    system: String,
    #[serde(default)]
    fast_policies: Vec<String>,
    #[serde(default)]
    port_groups: Vec<PortGroupSeed>,
    #[serde(default)]
    volumes: Vec<VolumeSeed>,
    #[serde(default)]
    batches: Vec<Vec<PlanStep>>,
}

#[derive(Debug, Deserialize)]
struct PortGroupSeed {
    name: String,
    ports: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VolumeSeed {
    name: String,
    tiering: TieringDescriptor,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PlanAction {
    Attach,
    Detach,
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    action: PlanAction,
    volume: String,
    protocol: Protocol,
    connector: HostConnector,
    #[serde(default)]
    live_migration: bool,
    #[serde(default = "default_reset")]
    reset: bool,
}

fn default_reset() -> bool {
    true
}

type VolumeTable = BTreeMap<String, (ResourceHandle, TieringDescriptor)>;

/// Result of one plan step as written by `--report-json`
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StepRecord {
    Attach {
        batch: usize,
        volume: String,
        view: String,
        outcome: MaskingViewOutcome,
    },
    Detach {
        batch: usize,
        volume: String,
        report: TeardownReport,
    },
    Failed {
        batch: usize,
        volume: String,
        class: String,
        retryable: bool,
        error: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting {} v{}", masking_orchestrator::NAME, masking_orchestrator::VERSION);

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    let plan_text = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("reading plan {}", args.plan.display()))?;
    let plan: Plan = serde_yaml::from_str(&plan_text)
        .with_context(|| format!("parsing plan {}", args.plan.display()))?;

    if config.array(&plan.system).is_err() {
        config.arrays.push(ArrayConfig {
            system: plan.system.clone(),
            port_groups: plan.port_groups.iter().map(|pg| pg.name.clone()).collect(),
        });
    }

    let array = Arc::new(SimulatedArray::with_job_latency(
        plan.system.as_str(),
        args.job_latency_polls,
    ));
    let orchestrator = Arc::new(
        MaskingOrchestrator::new(config, array.clone()).context("creating orchestrator")?,
    );
    let volumes = Arc::new(seed_array(&array, &orchestrator, &plan));

    let mut failures = 0usize;
    for (index, batch) in plan.batches.into_iter().enumerate() {
        info!(batch = index, steps = batch.len(), "Running batch");
        let mut tasks = JoinSet::new();

        for step in batch {
            let orchestrator = orchestrator.clone();
            let volumes = volumes.clone();
            let volume = step.volume.clone();
            tasks.spawn_blocking(move || (volume, run_step(&orchestrator, &volumes, index, step)));
        }

        while let Some(joined) = tasks.join_next().await {
            let (volume, result) = joined.context("plan step did not finish")?;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    failures += 1;
                    error!(
                        class = ?e.class(),
                        retryable = e.is_retryable(),
                        "Step failed: {:#}",
                        e
                    );
                    StepRecord::Failed {
                        batch: index,
                        volume,
                        class: format!("{:?}", e.class()),
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    }
                }
            };
            if args.report_json {
                println!(
                    "{}",
                    serde_json::to_string(&record).context("encoding step report")?
                );
            }
        }
    }

    for (name, (volume, _)) in volumes.iter() {
        info!(volume = %name, groups = ?array.groups_of(volume), "Final placement");
    }

    if args.print_metrics {
        print!("{}", orchestrator.metrics().render());
    }

    if failures > 0 {
        bail!("{} plan step(s) failed", failures);
    }
    info!("Plan applied");
    Ok(())
}

/// Provision plan objects; every volume starts in its default group
fn seed_array(array: &SimulatedArray, orchestrator: &MaskingOrchestrator, plan: &Plan) -> VolumeTable {
    for policy in &plan.fast_policies {
        array.add_fast_policy(policy);
    }
    for pg in &plan.port_groups {
        let ports: Vec<&str> = pg.ports.iter().map(String::as_str).collect();
        array.add_port_group(&pg.name, &ports);
    }

    let mut volumes = VolumeTable::new();
    for seed in &plan.volumes {
        let volume = array.add_volume(&seed.name);
        let default_name = orchestrator.naming().default_group_name(&seed.tiering);
        match array.find(ObjectKind::DeviceGroup, &default_name) {
            Some(group) => array.add_member(&group, &volume),
            None => {
                array.add_device_group(&default_name, &[&volume]);
            }
        }
        volumes.insert(seed.name.clone(), (volume, seed.tiering.clone()));
    }
    volumes
}

fn run_step(
    orchestrator: &MaskingOrchestrator,
    volumes: &VolumeTable,
    batch: usize,
    step: PlanStep,
) -> masking_orchestrator::Result<StepRecord> {
    let (volume, tiering) = volumes.get(&step.volume).cloned().ok_or_else(|| {
        masking_orchestrator::Error::InvalidRequest(format!("unknown volume {}", step.volume))
    })?;

    let mut request = orchestrator.build_request(
        volume.clone(),
        step.volume.as_str(),
        step.connector,
        step.protocol,
        tiering,
    )?;
    request.live_migration = step.live_migration;

    let record = match step.action {
        PlanAction::Attach => {
            let outcome = orchestrator.setup_masking_view(&request)?;
            info!(
                volume = %step.volume,
                view = %request.names.masking_view,
                reused = outcome.reused_view,
                ports = ?outcome.target_ports,
                "Attached"
            );
            StepRecord::Attach {
                batch,
                volume: step.volume,
                view: request.names.masking_view,
                outcome,
            }
        }
        PlanAction::Detach => {
            let report = orchestrator.remove_and_reset_members(&volume, &request, step.reset)?;
            info!(
                volume = %step.volume,
                views = ?report.views_deleted,
                device_groups = ?report.device_groups_deleted,
                returned_to_default = report.returned_to_default,
                "Detached"
            );
            StepRecord::Detach {
                batch,
                volume: step.volume,
                report,
            }
        }
    };
    Ok(record)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .context("initializing logging")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("initializing logging")?;
    }
    Ok(())
}
