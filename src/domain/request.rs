//! Request and result types passed through the masking pipeline

use crate::domain::ports::{Protocol, ResourceHandle, TieringDescriptor};
use crate::error::{Error, Result};
use crate::resolvers::naming::MaskingNames;
use serde::{Deserialize, Serialize};

// =============================================================================
// Host Connector
// =============================================================================

/// Host-side description supplied by the attach/detach caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConnector {
    /// Host name (fully qualified or short)
    pub host: String,
    /// Fibre Channel world-wide port names
    #[serde(default)]
    pub wwpns: Vec<String>,
    /// iSCSI qualified name of the host
    #[serde(default)]
    pub iscsi_initiator: Option<String>,
}

impl HostConnector {
    /// Initiator identifiers relevant to a protocol
    pub fn initiators(&self, protocol: Protocol) -> Vec<String> {
        match protocol {
            Protocol::Fc => self
                .wwpns
                .iter()
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect(),
            Protocol::Iscsi => self
                .iscsi_initiator
                .iter()
                .map(|iqn| iqn.trim().to_string())
                .filter(|iqn| !iqn.is_empty())
                .collect(),
        }
    }

    /// Initiators for a protocol, failing fast when there are none
    pub fn require_initiators(&self, protocol: Protocol) -> Result<Vec<String>> {
        let initiators = self.initiators(protocol);
        if initiators.is_empty() {
            return Err(Error::NoInitiators {
                host: self.host.clone(),
                protocol: protocol.to_string(),
            });
        }
        Ok(initiators)
    }
}

// =============================================================================
// Masking View Request
// =============================================================================

/// Unit of work for one attach or detach call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingViewRequest {
    /// Target volume
    pub volume: ResourceHandle,
    /// Display name of the volume
    pub volume_name: String,
    /// Host connector
    pub connector: HostConnector,
    /// Storage system identity
    pub system: String,
    /// Connection protocol
    pub protocol: Protocol,
    /// Tiering identity of the volume
    pub tiering: TieringDescriptor,
    /// Canonical names derived from host, tiering and protocol
    pub names: MaskingNames,
    /// Re-map during live migration: the volume stays in its prior group
    pub live_migration: bool,
}

// =============================================================================
// Outcomes
// =============================================================================

/// Resolved objects returned by a successful attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingViewOutcome {
    pub device_group: ResourceHandle,
    pub port_group: ResourceHandle,
    pub initiator_group: ResourceHandle,
    pub masking_view: ResourceHandle,
    /// Target port identifiers of the port group
    pub target_ports: Vec<String>,
    /// The masking view existed before this call and was kept as-is
    pub reused_view: bool,
}

/// What a teardown did to the array
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Groups the volume was only removed from
    pub memberships_removed: Vec<String>,
    /// Masking views deleted
    pub views_deleted: Vec<String>,
    /// Initiator groups deleted
    pub initiator_groups_deleted: Vec<String>,
    /// Device groups deleted
    pub device_groups_deleted: Vec<String>,
    /// The volume was added back to its default group
    pub returned_to_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_connector_initiators_per_protocol() {
        let connector = HostConnector {
            host: "h1".into(),
            wwpns: vec!["10000090FA534CD0".into(), " ".into()],
            iscsi_initiator: Some("iqn.1993-08.org.debian:01:222".into()),
        };

        assert_eq!(connector.initiators(Protocol::Fc), vec!["10000090FA534CD0"]);
        assert_eq!(
            connector.initiators(Protocol::Iscsi),
            vec!["iqn.1993-08.org.debian:01:222"]
        );
    }

    #[test]
    fn test_connector_without_initiators_fails_fast() {
        let connector = HostConnector {
            host: "h1".into(),
            ..Default::default()
        };

        let err = connector.require_initiators(Protocol::Fc).unwrap_err();
        assert_matches!(err, Error::NoInitiators { ref host, .. } if host == "h1");
        assert!(!err.is_retryable());
    }
}
