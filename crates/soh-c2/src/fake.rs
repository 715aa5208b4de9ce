use crate::{C2Action, C2Error, ClientKey, CommandId, Substrate, VmRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A scripted reply to one issued action.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    /// Never reports ready.
    pub pending: bool,
    /// Fail the issue itself with this message.
    pub reject: Option<String>,
}

impl Reply {
    #[must_use]
    pub fn output(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn streams(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn pending() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reject(msg: impl Into<String>) -> Self {
        Self {
            reject: Some(msg.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    vms: HashMap<String, VmRecord>,
    active_names: HashSet<String>,
    active_uuids: HashSet<String>,
    scripts: HashMap<(String, String), VecDeque<Reply>>,
    filter: Option<String>,
    next_id: u64,
    responses: HashMap<String, (String, Reply)>,
    issued: Vec<(String, String)>,
    cleared: Vec<String>,
}

/// In-memory substrate with scripted replies per (VM, action).
///
/// The last scripted reply for a key repeats; unscripted actions answer with
/// empty output.
#[derive(Default)]
pub struct FakeSubstrate {
    state: Mutex<FakeState>,
    yield_in_filter: bool,
}

impl FakeSubstrate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield between setting the filter and returning, to surface interleavings.
    #[must_use]
    pub fn with_yield_in_filter(mut self) -> Self {
        self.yield_in_filter = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vm(&self, name: &str, uuid: &str, addresses: &[&str]) {
        self.state().vms.insert(
            name.to_string(),
            VmRecord {
                name: name.to_string(),
                uuid: uuid.to_string(),
                addresses: addresses.iter().map(|s| (*s).to_string()).collect(),
            },
        );
    }

    pub fn add_active_vm(&self, name: &str, uuid: &str, addresses: &[&str]) {
        self.add_vm(name, uuid, addresses);
        self.activate(name);
    }

    pub fn activate(&self, name: &str) {
        self.state().active_names.insert(name.to_string());
    }

    pub fn activate_uuid(&self, uuid: &str) {
        self.state().active_uuids.insert(uuid.to_string());
    }

    pub fn deactivate(&self, name: &str) {
        self.state().active_names.remove(name);
    }

    pub fn set_addresses(&self, name: &str, addresses: &[&str]) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.addresses = addresses.iter().map(|s| (*s).to_string()).collect();
        }
    }

    /// Script replies for an action rendered as it is issued, e.g. `cc exec ip addr`.
    pub fn script(&self, vm: &str, action: &str, replies: Vec<Reply>) {
        self.state()
            .scripts
            .insert((vm.to_string(), action.to_string()), replies.into());
    }

    /// Every issued action as (filtered VM, rendered action).
    #[must_use]
    pub fn issued(&self) -> Vec<(String, String)> {
        self.state().issued.clone()
    }

    #[must_use]
    pub fn issue_count(&self, vm: &str) -> usize {
        self.state().issued.iter().filter(|(v, _)| v == vm).count()
    }

    #[must_use]
    pub fn cleared(&self) -> Vec<String> {
        self.state().cleared.clone()
    }

    fn next_reply(state: &mut FakeState, vm: &str, action: &str) -> Reply {
        let key = (vm.to_string(), action.to_string());
        match state.scripts.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Reply::default(),
        }
    }

    fn response(&self, id: &CommandId) -> Result<(String, Reply), C2Error> {
        self.state()
            .responses
            .get(&id.0)
            .cloned()
            .ok_or_else(|| C2Error::Substrate(format!("no commands returned for ID {id}")))
    }
}

#[async_trait]
impl Substrate for FakeSubstrate {
    async fn vm_info(&self, _namespace: &str, vm: &str) -> Result<Option<VmRecord>, C2Error> {
        Ok(self.state().vms.get(vm).cloned())
    }

    async fn client_connected(&self, _namespace: &str, key: &ClientKey) -> Result<bool, C2Error> {
        let state = self.state();
        Ok(match key {
            ClientKey::Uuid(uuid) => state.active_uuids.contains(uuid),
            ClientKey::Hostname(name) => state.active_names.contains(name),
        })
    }

    async fn set_filter(&self, _namespace: &str, vm: &str) -> Result<(), C2Error> {
        self.state().filter = Some(vm.to_string());
        if self.yield_in_filter {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn issue(
        &self,
        _namespace: &str,
        action: &C2Action,
        _timeout: Duration,
    ) -> Result<CommandId, C2Error> {
        let mut state = self.state();
        let vm = state.filter.clone().unwrap_or_default();
        let rendered = action.render();

        state.issued.push((vm.clone(), rendered.clone()));
        let reply = Self::next_reply(&mut state, &vm, &rendered);

        if let Some(msg) = reply.reject {
            return Err(C2Error::Substrate(msg));
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        state.responses.insert(id.clone(), (vm, reply));

        Ok(CommandId(id))
    }

    async fn responses_ready(&self, _namespace: &str, id: &CommandId) -> Result<bool, C2Error> {
        Ok(!self.response(id)?.1.pending)
    }

    async fn raw_response(&self, _namespace: &str, id: &CommandId) -> Result<String, C2Error> {
        let (_, reply) = self.response(id)?;
        Ok(match (reply.stdout.is_empty(), reply.stderr.is_empty()) {
            (_, true) => reply.stdout,
            (true, false) => reply.stderr,
            (false, false) => format!("{}\n{}", reply.stdout, reply.stderr),
        })
    }

    async fn tagged_response(&self, _namespace: &str, id: &CommandId) -> Result<String, C2Error> {
        let (vm, reply) = self.response(id)?;
        let uuid = self
            .state()
            .vms
            .get(&vm)
            .map(|record| record.uuid.clone())
            .unwrap_or_default();

        Ok(format!(
            "{id}/{uuid}/stdout:\n{}\n{id}/{uuid}/stderr:\n{}\n",
            reply.stdout, reply.stderr
        ))
    }

    async fn clear_responses(&self, namespace: &str) -> Result<(), C2Error> {
        let mut state = self.state();
        state.responses.clear();
        state.cleared.push(namespace.to_string());
        Ok(())
    }
}
