//! Naming Resolver
//!
//! Device group, initiator group and masking view names are pure functions of
//! (host, tiering identity, protocol). Two orchestrator calls for the same
//! triple, from any process, therefore converge on the same array objects.
//!
//! Names that would exceed the array's length limit are shortened by keeping a
//! head slice of the offending segment and appending a SHA-256 derived suffix
//! of the full segment, so the result stays deterministic and collision-safe.

use crate::config::{NamingConfig, HASH_SUFFIX_LEN};
use crate::domain::ports::{Protocol, TieringDescriptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placeholder for an explicit "no service level" tiering
pub const NO_SERVICE_LEVEL: &str = "No_SLO";

/// Rendered when a service level is given without a workload
pub const NO_WORKLOAD: &str = "NONE";

// =============================================================================
// Masking Names
// =============================================================================

/// Canonical names of the access-control objects for one request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskingNames {
    /// Host-facing device (storage) group
    pub device_group: String,
    /// Host initiator group
    pub initiator_group: String,
    /// Operator-provisioned port group (looked up, never created)
    pub port_group: String,
    /// Masking view binding the three groups
    pub masking_view: String,
    /// Group holding the volume while it is not masked to any host
    pub default_group: String,
}

// =============================================================================
// Naming Resolver
// =============================================================================

/// Generates canonical object names
#[derive(Debug, Clone, Default)]
pub struct NamingResolver {
    config: NamingConfig,
}

impl NamingResolver {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Resolve all names for a request
    pub fn resolve(
        &self,
        host: &str,
        tiering: &TieringDescriptor,
        protocol: Protocol,
        port_group: &str,
    ) -> MaskingNames {
        let short_host = self.short_host_name(host);
        let token = tiering_token(tiering);
        let before = format!("{}-{}-", self.config.prefix, short_host);
        let after = format!("-{}-SG", protocol.short_token());
        let token = self.fit_token(&before, &token, &after);
        let stem = format!("{}{}-{}", before, token, protocol.short_token());

        MaskingNames {
            device_group: format!("{}-SG", stem),
            masking_view: format!("{}-MV", stem),
            initiator_group: self.initiator_group_name(host, protocol),
            port_group: port_group.to_string(),
            default_group: self.default_group_name(tiering),
        }
    }

    /// Initiator group name for a host and protocol
    pub fn initiator_group_name(&self, host: &str, protocol: Protocol) -> String {
        format!(
            "{}-{}-{}-IG",
            self.config.prefix,
            self.short_host_name(host),
            protocol.long_token()
        )
    }

    /// Default group name for a tiering identity
    pub fn default_group_name(&self, tiering: &TieringDescriptor) -> String {
        let prefix = &self.config.prefix;
        match tiering {
            TieringDescriptor::LegacyFastPolicy { pool, policy } => {
                let before = format!("{}_default_", prefix);
                let token = self.fit_token(&before, policy.as_deref().unwrap_or(pool), "_SG");
                format!("{}{}_SG", before, token)
            }
            TieringDescriptor::ServiceLevelPool { .. } => {
                let before = format!("{}-", prefix);
                let token = self.fit_token(&before, &tiering_token(tiering), "-SG");
                format!("{}{}-SG", before, token)
            }
        }
    }

    /// Host name up to the first dot, shortened when too long
    pub fn short_host_name(&self, host: &str) -> String {
        let short = host.split('.').next().unwrap_or(host);
        shorten(short, self.config.max_host_length)
    }

    /// Pick one of the configured port groups for a host.
    ///
    /// The choice depends only on the short host name, so every request for
    /// the same host lands on the same port group.
    pub fn select_port_group<'a>(&self, host: &str, port_groups: &'a [String]) -> Option<&'a str> {
        if port_groups.is_empty() {
            return None;
        }
        let digest = Sha256::digest(self.short_host_name(host).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(bytes) % port_groups.len() as u64) as usize;
        port_groups.get(index).map(String::as_str)
    }

    /// Shorten `token` so that `before + token + after` fits the name limit
    fn fit_token(&self, before: &str, token: &str, after: &str) -> String {
        let fixed = before.chars().count() + after.chars().count();
        let budget = self
            .config
            .max_name_length
            .saturating_sub(fixed)
            .max(HASH_SUFFIX_LEN + 1);
        shorten(token, budget)
    }
}

/// Tiering segment of device group and view names
pub fn tiering_token(tiering: &TieringDescriptor) -> String {
    match tiering {
        TieringDescriptor::LegacyFastPolicy { pool, policy } => {
            policy.clone().unwrap_or_else(|| pool.clone())
        }
        TieringDescriptor::ServiceLevelPool {
            pool,
            service_level,
            workload,
        } => match service_level.as_deref() {
            None => pool.clone(),
            Some(slo) if slo.eq_ignore_ascii_case("none") => {
                format!("{}-{}", pool, NO_SERVICE_LEVEL)
            }
            Some(slo) => format!(
                "{}-{}-{}",
                pool,
                slo,
                workload.as_deref().unwrap_or(NO_WORKLOAD)
            ),
        },
    }
}

/// Keep `value` within `max` characters, replacing the tail with a hash suffix
pub fn shorten(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let keep = max.saturating_sub(HASH_SUFFIX_LEN);
    let head: String = value.chars().take(keep).collect();
    let digest = Sha256::digest(value.as_bytes());
    let suffix: String = digest
        .iter()
        .take(HASH_SUFFIX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}{}", head, suffix)
}
