//! Masking Orchestrator
//!
//! Provisions host access to block-storage volumes on an external array by
//! composing its access-control primitives (device group, initiator group,
//! port group and the masking view binding them) into an idempotent
//! attach/detach workflow with rollback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Masking-View Orchestrator                            │
//! │        setup_masking_view()              remove_and_reset_members()         │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Named Lock     │  │   Rollback      │  │      Teardown               │  │
//! │  │  Registry       │  │   Manager       │  │      Pipeline               │  │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! ├────────────────────────────────┼─────────────────────────┼──────────────────┤
//! │                            Resolvers                                        │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Naming      │  │  Hardware-ID    │  │  Device / Initiator /       │  │
//! │  │   (pure, SHA)   │  │                 │  │  Port Group                 │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                  Array Client + Job Waiter (bounded polling)                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                     ArrayTransport port (domain::ports)                     │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │    Simulated array          │  │   Management-protocol clients       │   │
//! │  │    (fault injection)        │  │   (provided by the embedder)        │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, rollback, teardown, locks and job polling
//! - [`resolvers`]: Naming, hardware-ID and group resolvers
//! - [`domain`]: Transport port and request types
//! - [`config`]: YAML configuration
//! - [`metrics`]: Prometheus counters
//! - [`error`]: Error types and classification

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod resolvers;

// Re-export commonly used types
pub use config::{ArrayConfig, JobPollConfig, NamingConfig, OrchestratorConfig};

pub use controlplane::{
    ArrayClient, FaultAction, JobWaiter, MaskingOrchestrator, NamedLockGuard, NamedLockRegistry,
    ReplacedView, RollbackContext, SetupStep, SimulatedArray,
};

pub use domain::ports::{
    ArrayOperation, ArrayTransport, ArrayTransportRef, InstanceAttributes, InvokeOutcome,
    JobStatus, ObjectKind, OperationKind, Protocol, ResourceHandle, TieringDescriptor,
};

pub use domain::request::{HostConnector, MaskingViewOutcome, MaskingViewRequest, TeardownReport};

pub use error::{Error, ErrorClass, Result};

pub use metrics::MaskingMetrics;

pub use resolvers::naming::{MaskingNames, NamingResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
