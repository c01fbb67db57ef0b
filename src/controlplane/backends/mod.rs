//! Array Backend Adapters
//!
//! Implementations of the [`ArrayTransport`](crate::domain::ports::ArrayTransport)
//! port:
//! - Simulated: in-memory array with fault injection, for tests and dry runs

pub mod simulated;

pub use simulated::*;
