//! Error types for the masking orchestrator
//!
//! Every failure is classified as a configuration, transient or consistency
//! error. The class decides whether a caller may retry and whether operator
//! intervention is required.

use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Port group {name} not found on array {system}")]
    PortGroupNotFound { name: String, system: String },

    #[error("Connector for host {host} supplies no {protocol} initiators")]
    NoInitiators { host: String, protocol: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Transport / Protocol Errors
    // =========================================================================
    #[error("Array transport error: {0}")]
    Transport(String),

    #[error("Operation {operation} rejected by array (rc={code}): {message}")]
    OperationRejected {
        operation: String,
        code: u32,
        message: String,
    },

    #[error("Job {job} failed (rc={code}): {message}")]
    JobFailed {
        job: String,
        code: u32,
        message: String,
    },

    #[error("Job {job} did not complete after {attempts} polls")]
    JobTimeout { job: String, attempts: u32 },

    #[error("Array returned no handle for {operation}")]
    MissingResult { operation: String },

    // =========================================================================
    // Consistency Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("{kind} {name} still present on the array after a successful delete")]
    ResidualObject { kind: String, name: String },

    #[error("Masking view {view} binds device group {actual}, expected {expected}")]
    ViewGroupMismatch {
        view: String,
        expected: String,
        actual: String,
    },

    #[error("Rollback of masking view {view} failed: {reason} (original failure: {original})")]
    RollbackFailed {
        view: String,
        original: String,
        reason: String,
    },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("Failed to set up masking view {view} for volume {volume}: {source}; rollback: {rollback}")]
    MaskingViewSetupFailed {
        view: String,
        volume: String,
        rollback: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Teardown of volume {volume} failed: {source}")]
    TeardownFailed {
        volume: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failure taxonomy used to decide retry and escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad configuration or connector; never retried
    Configuration,
    /// A job failed or timed out; safe to retry after rollback
    Transient,
    /// Array state no longer matches what the orchestrator expects
    Consistency,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Configuration(_)
            | Error::PortGroupNotFound { .. }
            | Error::NoInitiators { .. }
            | Error::InvalidRequest(_)
            | Error::YamlParse(_) => ErrorClass::Configuration,

            Error::Transport(_)
            | Error::OperationRejected { .. }
            | Error::JobFailed { .. }
            | Error::JobTimeout { .. }
            | Error::MissingResult { .. }
            | Error::Io(_)
            | Error::Metrics(_) => ErrorClass::Transient,

            Error::ResourceNotFound { .. }
            | Error::ResidualObject { .. }
            | Error::ViewGroupMismatch { .. }
            | Error::RollbackFailed { .. } => ErrorClass::Consistency,

            // A clean rollback leaves the array as it was, so the cause decides
            Error::MaskingViewSetupFailed { source, .. } => source.class(),

            // Partial teardown is never retried blindly
            Error::TeardownFailed { source, .. } => match source.class() {
                ErrorClass::Configuration => ErrorClass::Configuration,
                _ => ErrorClass::Consistency,
            },
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error needs operator intervention
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
