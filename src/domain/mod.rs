//! Domain layer - Port definitions and request types
//!
//! This module defines the array transport port that adapters implement and
//! the values that flow through the masking pipeline.

pub mod ports;
pub mod request;

pub use ports::*;
pub use request::*;
