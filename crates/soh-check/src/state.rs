use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use soh_c2::C2Error;
use soh_probes::ProbeMeta;
use std::time::SystemTime;

/// One recorded probe result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub success: String,
    #[serde(default)]
    pub error: String,
}

impl State {
    #[must_use]
    pub fn from_outcome(meta: &ProbeMeta, outcome: &Result<String, C2Error>) -> Self {
        let mut state = Self {
            metadata: meta.to_metadata(),
            timestamp: now_rfc3339(),
            ..Self::default()
        };

        match outcome {
            Ok(msg) => state.success.clone_from(msg),
            Err(err) => state.error = err.to_string(),
        }

        state
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[must_use]
pub fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// Everything known about one host after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    pub hostname: String,
    #[serde(default)]
    pub cpu_load: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networking: Vec<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reachability: Vec<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_tests: Vec<State>,
    /// Derived when reading a status back.
    #[serde(default, skip_serializing)]
    pub errors: bool,
}

impl HostState {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    pub fn all_states(&self) -> impl Iterator<Item = &State> {
        self.networking
            .iter()
            .chain(&self.reachability)
            .chain(&self.processes)
            .chain(&self.listeners)
            .chain(&self.custom_tests)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.all_states().any(State::is_error)
    }
}

/// Byte counts between every pair of observed addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCapture {
    pub hosts: Vec<String>,
    pub flows: Vec<Vec<u64>>,
}

/// The value written under the `soh` status key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBlob {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_capture: Option<PacketCapture>,
}
