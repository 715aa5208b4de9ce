use crate::{
    C2Action, C2Error, ClientKey, CommandId, Substrate, SubstrateSocket, SubstrateStream, VmRecord,
    connect_substrate_socket,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound for requests that do not carry their own timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Request<'a> {
    command: &'a str,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ResponseBatch {
    resp: Vec<HostResponse>,
    more: bool,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "PascalCase", default)]
struct HostResponse {
    host: String,
    response: String,
    header: Option<Vec<String>>,
    tabular: Option<Vec<Vec<String>>>,
    error: String,
    data: Value,
}

/// One minimega command line with its tabular modifiers.
#[derive(Debug, Clone, Default)]
struct MmCommand {
    namespace: Option<String>,
    columns: Vec<&'static str>,
    filters: Vec<String>,
    command: String,
}

impl MmCommand {
    fn namespaced(namespace: &str, command: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            command: command.into(),
            ..Self::default()
        }
    }

    fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    fn render(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ns) = &self.namespace {
            parts.push(format!("namespace {ns}"));
        }
        for filter in &self.filters {
            parts.push(format!(".filter {filter}"));
        }
        if !self.columns.is_empty() {
            parts.push(format!(".columns {}", self.columns.join(",")));
        }
        parts.push(self.command.clone());

        parts.join(" ")
    }
}

/// Client for the minimega control socket.
///
/// A single connection is shared; a request that times out or fails at the
/// transport level drops it so the next request redials.
pub struct MinimegaSubstrate {
    socket: SubstrateSocket,
    conn: Mutex<Option<BufReader<SubstrateStream>>>,
}

impl MinimegaSubstrate {
    #[must_use]
    pub fn new(socket: SubstrateSocket) -> Self {
        Self {
            socket,
            conn: Mutex::new(None),
        }
    }

    async fn run(&self, cmd: &MmCommand, limit: Duration) -> Result<Vec<HostResponse>, C2Error> {
        let line = cmd.render();
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            let stream = connect_substrate_socket(&self.socket).await?;
            *guard = Some(BufReader::new(stream));
        }

        let Some(conn) = guard.as_mut() else {
            return Err(C2Error::Substrate("not connected".into()));
        };

        debug!(command = %line, "minimega request");

        match timeout(limit, exchange(conn, &line)).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(C2Error::Timeout(format!("running '{}'", cmd.command)))
            }
        }
    }

    /// Run a command and fail on the first per-host error.
    async fn run_checked(
        &self,
        cmd: &MmCommand,
        limit: Duration,
    ) -> Result<Vec<HostResponse>, C2Error> {
        let responses = self.run(cmd, limit).await?;

        if let Some(failed) = responses.iter().find(|r| !r.error.is_empty()) {
            debug!(host = %failed.host, error = %failed.error, "minimega error response");
            return Err(C2Error::Substrate(failed.error.clone()));
        }

        Ok(responses)
    }

    /// First non-error response text; errors only surface when nothing succeeded.
    async fn single_response(&self, cmd: &MmCommand) -> Result<String, C2Error> {
        let responses = self.run(cmd, DEFAULT_REQUEST_TIMEOUT).await?;
        single(responses, |r| r.response.clone())
    }

    async fn tabular(&self, cmd: &MmCommand) -> Result<Vec<HashMap<String, String>>, C2Error> {
        let responses = self.run_checked(cmd, DEFAULT_REQUEST_TIMEOUT).await?;
        Ok(rows(&responses))
    }
}

async fn exchange(
    conn: &mut BufReader<SubstrateStream>,
    line: &str,
) -> Result<Vec<HostResponse>, C2Error> {
    let request = serde_json::to_string(&Request { command: line })?;

    conn.get_mut()
        .write_all(format!("{request}\n").as_bytes())
        .await?;
    conn.get_mut().flush().await?;

    let mut collected = Vec::new();

    loop {
        let mut buf = String::new();
        let bytes = conn.read_line(&mut buf).await?;

        if bytes == 0 {
            return Err(C2Error::Substrate("unexpected EOF from minimega".into()));
        }

        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        let batch: ResponseBatch = serde_json::from_str(trimmed)?;
        collected.extend(batch.resp);

        if !batch.more {
            return Ok(collected);
        }
    }
}

fn single<T>(
    responses: Vec<HostResponse>,
    pick: impl Fn(&HostResponse) -> T,
) -> Result<T, C2Error> {
    let mut last_error = None;

    for response in &responses {
        if response.error.is_empty() {
            return Ok(pick(response));
        }
        last_error = Some(response.error.clone());
    }

    Err(C2Error::Substrate(
        last_error.unwrap_or_else(|| "no response from minimega".into()),
    ))
}

fn rows(responses: &[HostResponse]) -> Vec<HashMap<String, String>> {
    let mut out = Vec::new();

    for response in responses {
        let (Some(header), Some(tabular)) = (&response.header, &response.tabular) else {
            continue;
        };

        for row in tabular {
            out.push(
                header
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<HashMap<_, _>>(),
            );
        }
    }

    out
}

/// Parse the `vm info` ip column, e.g. `[10.0.0.1, ]`.
fn parse_addresses(raw: &str) -> Vec<String> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');

    if inner.is_empty() {
        return Vec::new();
    }

    inner.split(", ").map(|s| s.trim().to_string()).collect()
}

fn command_id(data: &Value, response: &str) -> Option<String> {
    match data {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ if !response.trim().is_empty() => Some(response.trim().to_string()),
        _ => None,
    }
}

#[async_trait]
impl Substrate for MinimegaSubstrate {
    async fn vm_info(&self, namespace: &str, vm: &str) -> Result<Option<VmRecord>, C2Error> {
        let cmd = MmCommand::namespaced(namespace, "vm info")
            .columns(&["name", "uuid", "ip"])
            .filter(format!("name={vm}"));

        let rows = self.tabular(&cmd).await?;

        Ok(rows.into_iter().next().map(|row| VmRecord {
            name: row.get("name").cloned().unwrap_or_default(),
            uuid: row.get("uuid").cloned().unwrap_or_default(),
            addresses: row.get("ip").map(String::as_str).map(parse_addresses).unwrap_or_default(),
        }))
    }

    async fn client_connected(&self, namespace: &str, key: &ClientKey) -> Result<bool, C2Error> {
        let cmd = match key {
            ClientKey::Uuid(uuid) => MmCommand::namespaced(namespace, "cc client")
                .columns(&["uuid"])
                .filter(format!("uuid={uuid}")),
            ClientKey::Hostname(hostname) => MmCommand::namespaced(namespace, "cc client")
                .columns(&["hostname"])
                .filter(format!("hostname={hostname}")),
        };

        Ok(!self.tabular(&cmd).await?.is_empty())
    }

    async fn set_filter(&self, namespace: &str, vm: &str) -> Result<(), C2Error> {
        let cmd = MmCommand::namespaced(namespace, format!("cc filter name={vm}"));
        self.run_checked(&cmd, DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|e| e.context(format!("setting host filter to {vm}")))
    }

    async fn issue(
        &self,
        namespace: &str,
        action: &C2Action,
        limit: Duration,
    ) -> Result<CommandId, C2Error> {
        let cmd = MmCommand::namespaced(namespace, action.render());
        let responses = self.run(&cmd, limit).await?;

        let id = single(responses, |r| command_id(&r.data, &r.response))?;

        id.map(CommandId).ok_or_else(|| {
            C2Error::DispatchFailed(format!("no command ID returned for '{action}'"))
        })
    }

    async fn responses_ready(&self, namespace: &str, id: &CommandId) -> Result<bool, C2Error> {
        let cmd = MmCommand::namespaced(namespace, "cc commands")
            .columns(&["id", "responses"])
            .filter(format!("id={id}"));

        // One row per cluster host; only the host running the VM responds.
        let rows = self.tabular(&cmd).await?;

        let Some(first) = rows.first() else {
            return Err(C2Error::Substrate(format!("no commands returned for ID {id}")));
        };

        if first.get("id").map(String::as_str) != Some(id.0.as_str()) {
            return Err(C2Error::Substrate(format!(
                "wrong command returned: {}",
                first.get("id").cloned().unwrap_or_default()
            )));
        }

        Ok(rows
            .iter()
            .any(|row| row.get("responses").is_some_and(|r| r != "0")))
    }

    async fn raw_response(&self, namespace: &str, id: &CommandId) -> Result<String, C2Error> {
        let cmd = MmCommand::namespaced(namespace, format!("cc response {id} raw"));
        self.single_response(&cmd)
            .await
            .map_err(|e| e.context(format!("getting response for command {id}")))
    }

    async fn tagged_response(&self, namespace: &str, id: &CommandId) -> Result<String, C2Error> {
        let cmd = MmCommand::namespaced(namespace, format!("cc response {id}"));
        self.single_response(&cmd)
            .await
            .map_err(|e| e.context(format!("getting response for command {id}")))
    }

    async fn clear_responses(&self, namespace: &str) -> Result<(), C2Error> {
        let cmd = MmCommand::namespaced(namespace, "clear cc responses");
        self.run_checked(&cmd, DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|e| e.context(format!("clearing C2 responses for namespace {namespace}")))
    }
}
