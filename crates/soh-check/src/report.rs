use crate::{HostState, PacketCapture, STATUS_KEY, SohError, StatusBlob, StatusStore};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stored health check status, keyed by hostname, as read back by consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub hosts: BTreeMap<String, HostState>,
    pub packet_capture: Option<PacketCapture>,
}

impl StatusReport {
    /// Index a blob by hostname and derive each host's `errors` flag.
    #[must_use]
    pub fn from_blob(blob: StatusBlob) -> Self {
        let hosts = blob
            .hosts
            .into_iter()
            .map(|mut host| {
                host.errors = host.has_errors();
                (host.hostname.clone(), host)
            })
            .collect();

        Self {
            hosts,
            packet_capture: blob.packet_capture,
        }
    }

    /// # Errors
    /// Returns `SohError::InvalidStatus` if the value is not a status blob.
    pub fn from_value(value: Value) -> Result<Self, SohError> {
        let blob: StatusBlob =
            serde_json::from_value(value).map_err(|e| SohError::InvalidStatus(e.to_string()))?;
        Ok(Self::from_blob(blob))
    }

    /// Read the status last persisted for an experiment, if any.
    ///
    /// # Errors
    /// Returns `SohError` if the store fails or holds a malformed status.
    pub fn load(store: &dyn StatusStore, experiment: &str) -> Result<Option<Self>, SohError> {
        store
            .read(experiment, STATUS_KEY)?
            .map(Self::from_value)
            .transpose()
    }

    /// Hosts with at least one failed check, in name order.
    pub fn failing_hosts(&self) -> impl Iterator<Item = &HostState> {
        self.hosts.values().filter(|host| host.errors)
    }
}
