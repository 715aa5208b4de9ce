use crate::{
    C2Action, C2Command, C2Error, ClientKey, CommandId, OutputChannel, StreamKind, Substrate,
    Target, extract_tagged,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Submits commands to guests and reads their output back.
pub struct Dispatcher {
    substrate: Arc<dyn Substrate>,
    // Held across filter + issue so concurrent dispatches never address the wrong VM.
    dispatch_lock: Mutex<()>,
    liveness_interval: Duration,
    poll_interval: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            dispatch_lock: Mutex::new(()),
            liveness_interval: LIVENESS_INTERVAL,
            poll_interval: RESPONSE_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_intervals(mut self, liveness: Duration, poll: Duration) -> Self {
        self.liveness_interval = liveness;
        self.poll_interval = poll;
        self
    }

    #[must_use]
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Wait until the target's control-channel client shows up.
    ///
    /// # Errors
    /// Returns `C2Error::VmNotFound` for unknown VMs, `C2Error::ClientNotActive`
    /// once `timeout` elapses, or `C2Error::Cancelled`.
    pub async fn is_active(
        &self,
        target: &Target,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), C2Error> {
        let Some(record) = self.substrate.vm_info(&target.namespace, &target.vm).await? else {
            return Err(C2Error::VmNotFound(target.vm.clone()));
        };

        // Registry hostnames are whatever the guest reports, so the topology
        // name only matches once the guest has applied it.
        let key = if target.id_by_uuid {
            ClientKey::Uuid(record.uuid)
        } else {
            ClientKey::Hostname(record.name)
        };

        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(C2Error::Cancelled);
            }

            match self.substrate.client_connected(&target.namespace, &key).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!(vm = %target.vm, error = %e, "client registry query failed"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(C2Error::ClientNotActive);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(C2Error::Cancelled),
                () = tokio::time::sleep(self.liveness_interval.min(remaining)) => {}
            }
        }
    }

    /// Run a command on its target and return the substrate's command ID.
    ///
    /// When the command carries a file, the file is sent first and its
    /// delivery awaited before the action is issued.
    ///
    /// # Errors
    /// Returns `C2Error` if the liveness gate fails, the substrate rejects the
    /// command, or a requested wait times out.
    pub async fn dispatch(
        &self,
        cmd: &C2Command,
        cancel: &CancellationToken,
    ) -> Result<CommandId, C2Error> {
        let target = &cmd.target;

        if !cmd.skip_active_check {
            self.is_active(target, cmd.timeout, cancel)
                .await
                .map_err(|e| e.context("cannot execute command"))?;
        }

        if let Some(file) = &cmd.send_file {
            let send = C2Action::Send(file.clone());
            let id = self
                .issue(target, &send, cmd.timeout)
                .await
                .map_err(|e| e.context(format!("sending file '{file}' to vm {}", target.vm)))?;

            self.wait_for_response(target, &id, cmd.timeout, cancel)
                .await
                .map_err(|e| e.context("waiting for response"))?;
        }

        let id = self
            .issue(target, &cmd.action, cmd.timeout)
            .await
            .map_err(|e| e.context(format!("calling '{}' for vm {}", cmd.action, target.vm)))?;

        debug!(vm = %target.vm, id = %id, action = %cmd.action, "command dispatched");

        if cmd.wait {
            self.wait_for_response(target, &id, cmd.timeout, cancel)
                .await
                .map_err(|e| e.context("waiting for response"))?;
        }

        Ok(id)
    }

    async fn issue(
        &self,
        target: &Target,
        action: &C2Action,
        timeout: Duration,
    ) -> Result<CommandId, C2Error> {
        let _guard = self.dispatch_lock.lock().await;

        self.substrate
            .set_filter(&target.namespace, &target.vm)
            .await?;

        match self.substrate.issue(&target.namespace, action, timeout).await {
            Ok(id) => Ok(id),
            Err(C2Error::Timeout(_)) => Err(C2Error::DispatchFailed(format!(
                "timeout running '{action}' in vm {}",
                target.vm
            ))),
            Err(e @ C2Error::DispatchFailed(_)) => Err(e),
            Err(e) => Err(C2Error::DispatchFailed(format!(
                "running '{action}' in vm {}: {e}",
                target.vm
            ))),
        }
    }

    /// Read the output of a dispatched command, with ANSI escapes removed.
    ///
    /// # Errors
    /// Returns `C2Error` if the substrate query fails or, for a tagged channel,
    /// the VM is unknown.
    pub async fn poll(
        &self,
        target: &Target,
        id: &CommandId,
        channel: OutputChannel,
    ) -> Result<String, C2Error> {
        let kind = match channel {
            OutputChannel::Both => {
                let raw = self.substrate.raw_response(&target.namespace, id).await?;
                return Ok(strip_ansi_escapes::strip_str(raw));
            }
            OutputChannel::Stdout => StreamKind::Stdout,
            OutputChannel::Stderr => StreamKind::Stderr,
        };

        let tagged = self
            .substrate
            .tagged_response(&target.namespace, id)
            .await?;

        let Some(record) = self.substrate.vm_info(&target.namespace, &target.vm).await? else {
            return Err(C2Error::VmNotFound(target.vm.clone()));
        };

        Ok(strip_ansi_escapes::strip_str(extract_tagged(
            &tagged,
            &record.uuid,
            kind,
        )))
    }

    /// Block until the substrate reports a response for `id`.
    ///
    /// # Errors
    /// Returns `C2Error::Timeout` after `timeout`, `C2Error::Cancelled`, or a
    /// substrate error.
    pub async fn wait_for_response(
        &self,
        target: &Target,
        id: &CommandId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), C2Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(C2Error::Cancelled);
            }

            if self.substrate.responses_ready(&target.namespace, id).await? {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(C2Error::Timeout(format!(
                    "waiting for response for command {id}"
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(C2Error::Cancelled),
                () = tokio::time::sleep(self.poll_interval.min(remaining)) => {}
            }
        }
    }

    /// Wait for a response and return it in full.
    ///
    /// # Errors
    /// Returns `C2Error` if the wait or the read fails.
    pub async fn await_and_fetch(
        &self,
        target: &Target,
        id: &CommandId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, C2Error> {
        self.wait_for_response(target, id, timeout, cancel).await?;
        self.poll(target, id, OutputChannel::Both).await
    }

    /// Drop every stored response in a namespace.
    ///
    /// # Errors
    /// Returns `C2Error` if the substrate rejects the request.
    pub async fn clear_responses(&self, namespace: &str) -> Result<(), C2Error> {
        self.substrate.clear_responses(namespace).await
    }
}
