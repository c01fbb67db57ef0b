//! Masking Control Plane
//!
//! Drives the array's access-control objects: job polling, the named lock
//! registry, the attach orchestrator with its rollback manager, and the
//! teardown pipeline.

pub mod backends;
pub mod client;
pub mod jobs;
pub mod locks;
pub mod orchestrator;
pub mod rollback;
pub mod teardown;

pub use backends::*;
pub use client::*;
pub use jobs::*;
pub use locks::*;
pub use orchestrator::*;
pub use rollback::*;
pub use teardown::*;
