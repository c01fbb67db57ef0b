//! Hardware-ID Resolver
//!
//! Maps the initiator identifiers a host connector supplies (FC WWPNs or an
//! iSCSI IQN) onto the hardware-ID objects registered on the array,
//! registering any identifier the array has never seen.

use crate::controlplane::client::ArrayClient;
use crate::domain::ports::{ArrayOperation, ObjectKind, Protocol, ResourceHandle, PROP_STORAGE_ID};
use crate::domain::request::HostConnector;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Resolves initiator identifiers to hardware-ID handles
#[derive(Debug, Clone)]
pub struct HardwareIdResolver {
    client: ArrayClient,
}

impl HardwareIdResolver {
    pub fn new(client: ArrayClient) -> Self {
        Self { client }
    }

    /// One hardware-ID handle per connector initiator, creating missing ones
    pub fn resolve(
        &self,
        system: &str,
        protocol: Protocol,
        connector: &HostConnector,
    ) -> Result<Vec<ResourceHandle>> {
        let initiators = connector.require_initiators(protocol)?;
        let mut registered = self.registered(system)?;
        let mut handles = Vec::with_capacity(initiators.len());

        for initiator in initiators {
            let key = normalize(&initiator);
            if let Some(handle) = registered.get(&key) {
                handles.push(handle.clone());
                continue;
            }

            info!(%initiator, %protocol, "Registering hardware ID");
            let created = self.client.create(ArrayOperation::CreateHardwareId {
                system: system.to_string(),
                storage_id: initiator.clone(),
                protocol,
            });
            let handle = match created {
                Ok(handle) => handle,
                // Another caller registered it first
                Err(Error::OperationRejected { .. }) => self
                    .registered(system)?
                    .remove(&key)
                    .ok_or_else(|| Error::ResourceNotFound {
                        kind: ObjectKind::HardwareId.to_string(),
                        name: initiator.clone(),
                    })?,
                Err(e) => return Err(e),
            };
            registered.insert(key, handle.clone());
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Hardware-ID handles that already exist for the connector, never creating
    pub fn lookup(
        &self,
        system: &str,
        protocol: Protocol,
        connector: &HostConnector,
    ) -> Result<Vec<ResourceHandle>> {
        let registered = self.registered(system)?;
        let found: Vec<_> = connector
            .initiators(protocol)
            .iter()
            .filter_map(|initiator| registered.get(&normalize(initiator)).cloned())
            .collect();
        debug!(host = %connector.host, found = found.len(), "Looked up hardware IDs");
        Ok(found)
    }

    /// Initiator identifiers carried by hardware-ID handles
    pub fn storage_ids(&self, hardware_ids: &[ResourceHandle]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(hardware_ids.len());
        for handle in hardware_ids {
            let attrs = self.client.instance(handle)?;
            ids.push(
                attrs
                    .property(PROP_STORAGE_ID)
                    .map(str::to_string)
                    .unwrap_or(attrs.name),
            );
        }
        Ok(ids)
    }

    /// Registered hardware IDs keyed by normalized storage ID
    fn registered(&self, system: &str) -> Result<BTreeMap<String, ResourceHandle>> {
        Ok(self
            .client
            .list(system, ObjectKind::HardwareId)?
            .into_iter()
            .map(|attrs| {
                let id = attrs
                    .property(PROP_STORAGE_ID)
                    .map(str::to_string)
                    .unwrap_or_else(|| attrs.name.clone());
                (normalize(&id), attrs.handle)
            })
            .collect())
    }
}

/// Initiator identifiers compare case-insensitively
pub fn normalize(initiator: &str) -> String {
    initiator.trim().to_ascii_lowercase()
}
