use crate::Protocol;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a single probe was about, attached to its recorded result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeMeta {
    Network {
        host: String,
    },
    Reachability {
        host: String,
        target: String,
    },
    Connection {
        host: String,
        target: String,
        port: u16,
        proto: Protocol,
    },
    Process {
        host: String,
        process: String,
    },
    Listener {
        host: String,
        port: String,
    },
    Custom {
        host: String,
        test: String,
    },
    Load {
        host: String,
    },
}

impl ProbeMeta {
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            ProbeMeta::Network { host }
            | ProbeMeta::Reachability { host, .. }
            | ProbeMeta::Connection { host, .. }
            | ProbeMeta::Process { host, .. }
            | ProbeMeta::Listener { host, .. }
            | ProbeMeta::Custom { host, .. }
            | ProbeMeta::Load { host } => host,
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            ProbeMeta::Reachability { target, .. } | ProbeMeta::Connection { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Flatten into the `host`/`target`/`port`/`proto`/`proc`/`test` keys
    /// that status consumers correlate errors by.
    #[must_use]
    pub fn to_metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("host".into(), Value::String(self.host().to_string()));

        match self {
            ProbeMeta::Network { .. } | ProbeMeta::Load { .. } => {}
            ProbeMeta::Reachability { target, .. } => {
                map.insert("target".into(), Value::String(target.clone()));
            }
            ProbeMeta::Connection {
                target,
                port,
                proto,
                ..
            } => {
                map.insert("target".into(), Value::String(target.clone()));
                map.insert("port".into(), Value::from(*port));
                map.insert("proto".into(), Value::String(proto.to_string()));
            }
            ProbeMeta::Process { process, .. } => {
                map.insert("proc".into(), Value::String(process.clone()));
            }
            ProbeMeta::Listener { port, .. } => {
                map.insert("port".into(), Value::String(port.clone()));
            }
            ProbeMeta::Custom { test, .. } => {
                map.insert("test".into(), Value::String(test.clone()));
            }
        }

        map
    }
}
