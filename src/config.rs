//! Orchestrator configuration
//!
//! Loaded from YAML. Every field has a default so a partial file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Hex characters appended when a name segment is shortened
pub const HASH_SUFFIX_LEN: usize = 8;

// =============================================================================
// Job Polling
// =============================================================================

/// Bounds on the job polling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPollConfig {
    /// Delay between two polls of the same job, in milliseconds
    pub interval_ms: u64,
    /// Polls before a job is reported as timed out
    pub max_attempts: u32,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 300,
        }
    }
}

impl JobPollConfig {
    /// Poll interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Inputs to the naming resolver that are not per-request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prefix of every generated name
    pub prefix: String,
    /// Longest object name the array accepts
    pub max_name_length: usize,
    /// Longest short host name before it is shortened
    pub max_host_length: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "OS".to_string(),
            max_name_length: 64,
            max_host_length: 16,
        }
    }
}

impl NamingConfig {
    /// Shortest `max_name_length` that still fits a shortened host and token
    pub fn min_name_length(&self) -> usize {
        // P-host-t-iSCSI-IG with the tiering token cut to one char plus hash
        self.prefix.len() + 1 + self.max_host_length + 1 + (HASH_SUFFIX_LEN + 1) + 1 + 5 + 3
    }
}

// =============================================================================
// Arrays
// =============================================================================

/// Per-array settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Storage system identity
    pub system: String,
    /// Operator-provisioned port groups masking views may use
    #[serde(default)]
    pub port_groups: Vec<String>,
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Job polling bounds
    pub job_poll: JobPollConfig,
    /// Naming settings
    pub naming: NamingConfig,
    /// Known arrays
    pub arrays: Vec<ArrayConfig>,
    /// Re-fetch every deleted object to prove it is gone
    pub verify_deletions: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_poll: JobPollConfig::default(),
            naming: NamingConfig::default(),
            arrays: Vec::new(),
            verify_deletions: true,
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Reject settings the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.job_poll.max_attempts == 0 {
            return Err(Error::Configuration(
                "job_poll.max_attempts must be at least 1".into(),
            ));
        }
        if self.naming.prefix.is_empty() {
            return Err(Error::Configuration("naming.prefix must not be empty".into()));
        }
        if self.naming.max_host_length <= HASH_SUFFIX_LEN {
            return Err(Error::Configuration(format!(
                "naming.max_host_length must exceed {}",
                HASH_SUFFIX_LEN
            )));
        }
        if self.naming.max_name_length < self.naming.min_name_length() {
            return Err(Error::Configuration(format!(
                "naming.max_name_length {} is below the minimum of {}",
                self.naming.max_name_length,
                self.naming.min_name_length()
            )));
        }
        for array in &self.arrays {
            if array.system.is_empty() {
                return Err(Error::Configuration("array system must not be empty".into()));
            }
            if array.port_groups.iter().any(|pg| pg.trim().is_empty()) {
                return Err(Error::Configuration(format!(
                    "array {} lists an empty port group name",
                    array.system
                )));
            }
        }
        Ok(())
    }

    /// Settings for one array
    pub fn array(&self, system: &str) -> Result<&ArrayConfig> {
        self.arrays
            .iter()
            .find(|a| a.system == system)
            .ok_or_else(|| Error::Configuration(format!("array {} is not configured", system)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.job_poll.max_attempts, 300);
        assert_eq!(config.naming.max_name_length, 64);
        assert!(config.verify_deletions);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml() {
        let config = OrchestratorConfig::from_yaml_str(
            r#"
job_poll:
  interval_ms: 10
arrays:
  - system: SYMMETRIX+000195900551
    port_groups: [OS-fc-PG]
"#,
        )
        .unwrap();

        assert_eq!(config.job_poll.interval(), Duration::from_millis(10));
        assert_eq!(config.job_poll.max_attempts, 300);
        let array = config.array("SYMMETRIX+000195900551").unwrap();
        assert_eq!(array.port_groups, vec!["OS-fc-PG".to_string()]);
        assert!(config.array("missing").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.job_poll.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.naming.max_name_length = 20;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.arrays.push(ArrayConfig {
            system: "SYM-1".into(),
            port_groups: vec![" ".into()],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "verify_deletions: false").unwrap();
        writeln!(file, "naming:\n  prefix: CI").unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert!(!config.verify_deletions);
        assert_eq!(config.naming.prefix, "CI");
    }
}
