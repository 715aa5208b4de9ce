use crate::C2Error;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Identifier the substrate assigns to an issued command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandId(pub String);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the substrate knows about one VM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmRecord {
    pub name: String,
    pub uuid: String,
    /// Assigned addresses in interface order; an empty entry means unassigned.
    pub addresses: Vec<String>,
}

/// How a VM is looked up in the live client registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKey {
    Uuid(String),
    Hostname(String),
}

/// Something to run on the guest through the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum C2Action {
    Exec(String),
    TestConn(String),
    Send(String),
}

impl C2Action {
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            C2Action::Exec(cmd) => format!("cc exec {cmd}"),
            C2Action::TestConn(spec) => format!("cc test-conn {spec}"),
            C2Action::Send(file) => format!("cc send {file}"),
        }
    }
}

impl fmt::Display for C2Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// The cluster's command execution substrate.
///
/// Addressing is stateful: `set_filter` selects the VM that the next `issue`
/// goes to, so callers must hold a lock across the pair.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn vm_info(&self, namespace: &str, vm: &str) -> Result<Option<VmRecord>, C2Error>;

    async fn client_connected(&self, namespace: &str, key: &ClientKey) -> Result<bool, C2Error>;

    async fn set_filter(&self, namespace: &str, vm: &str) -> Result<(), C2Error>;

    async fn issue(
        &self,
        namespace: &str,
        action: &C2Action,
        timeout: Duration,
    ) -> Result<CommandId, C2Error>;

    async fn responses_ready(&self, namespace: &str, id: &CommandId) -> Result<bool, C2Error>;

    /// Combined output of every client that ran the command.
    async fn raw_response(&self, namespace: &str, id: &CommandId) -> Result<String, C2Error>;

    /// Output with `<id>/<uuid>/<stdout|stderr>:` headers per block.
    async fn tagged_response(&self, namespace: &str, id: &CommandId) -> Result<String, C2Error>;

    async fn clear_responses(&self, namespace: &str) -> Result<(), C2Error>;
}
