use crate::{
    HostState, Indices, PacketCapture, STATUS_KEY, SohError, State, StatusBlob, StatusStore,
};
use soh_c2::{Coordinator, Dispatcher, GroupRecord, ResultGroup};
use soh_core::{Experiment, SohProfile};
use soh_probes::ProbeMeta;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Directory served to guests by `cc send`.
pub const DEFAULT_FILES_DIR: &str = "/phenix/images";

/// Delays and budgets used by the health-check phases.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Delay between re-dispatches of a probe that has not settled.
    pub retry_delay: Duration,
    /// Absolute per-interface deadline for network validation.
    pub network_deadline: Duration,
    pub notify_every: Duration,
    /// Re-dispatches allowed for process and listener probes.
    pub probe_retries: u32,
    pub dhcp_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            network_deadline: Duration::from_secs(5 * 60),
            notify_every: Duration::from_secs(5),
            probe_retries: 5,
            dhcp_poll: Duration::from_secs(5),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub error_count: usize,
}

impl RunReport {
    /// # Errors
    /// Returns `SohError::ChecksFailed` if any phase recorded an error.
    pub fn ensure_healthy(&self) -> Result<(), SohError> {
        if self.error_count > 0 {
            return Err(SohError::ChecksFailed(self.error_count));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Section {
    Networking,
    Reachability,
    Processes,
    Listeners,
    CustomTests,
}

impl Section {
    fn entries(self, host: &mut HostState) -> &mut Vec<State> {
        match self {
            Section::Networking => &mut host.networking,
            Section::Reachability => &mut host.reachability,
            Section::Processes => &mut host.processes,
            Section::Listeners => &mut host.listeners,
            Section::CustomTests => &mut host.custom_tests,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Section::Networking => "networking",
            Section::Reachability => "reachability",
            Section::Processes => "process",
            Section::Listeners => "listener",
            Section::CustomTests => "custom test",
        }
    }
}

/// A decoded app profile for a host whose control channel is still up.
pub(crate) struct HostProfile {
    pub host: String,
    pub profile: SohProfile,
    pub timeout: Duration,
}

/// Runs the state-of-health phases for one experiment.
pub struct HealthCheck {
    pub(crate) experiment: Experiment,
    pub(crate) coordinator: Coordinator,
    store: Arc<dyn StatusStore>,
    pub(crate) files_dir: PathBuf,
    pub(crate) timings: Timings,
    pub(crate) index: Indices,
    pub(crate) status: BTreeMap<String, HostState>,
    pub(crate) packet_capture: Option<PacketCapture>,
    pub(crate) error_count: usize,
}

impl HealthCheck {
    #[must_use]
    pub fn new(
        mut experiment: Experiment,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn StatusStore>,
        cancel: CancellationToken,
    ) -> Self {
        experiment.soh.normalize();

        Self {
            experiment,
            coordinator: Coordinator::new(dispatcher, cancel),
            store,
            files_dir: PathBuf::from(DEFAULT_FILES_DIR),
            timings: Timings::default(),
            index: Indices::default(),
            status: BTreeMap::new(),
            packet_capture: None,
            error_count: 0,
        }
    }

    #[must_use]
    pub fn with_files_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.files_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    #[must_use]
    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    #[must_use]
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    #[must_use]
    pub fn index(&self) -> &Indices {
        &self.index
    }

    #[must_use]
    pub fn status(&self) -> &BTreeMap<String, HostState> {
        &self.status
    }

    /// Run every phase in order, persisting the status after each one.
    ///
    /// Traffic flows are only collected when `initial` is false.
    ///
    /// # Errors
    /// Returns `SohError::Cancelled` if the run is cancelled, or a store error if
    /// the status cannot be persisted. Failed checks are not errors here; see
    /// [`RunReport::ensure_healthy`].
    pub async fn run_checks(&mut self, initial: bool) -> Result<RunReport, SohError> {
        info!("Starting SoH checks for experiment: {}", self.experiment.name);

        self.index = Indices::build(&self.experiment);
        self.status.clear();
        self.packet_capture = None;
        self.error_count = 0;

        self.check_networking().await?;
        self.persist()?;

        self.check_reachability().await?;
        self.persist()?;

        self.check_processes().await?;
        self.persist()?;

        self.check_listeners().await?;
        self.persist()?;

        self.check_custom_tests().await?;
        self.persist()?;

        self.check_cpu_load().await?;
        self.persist()?;

        if !initial {
            self.collect_flows().await?;
            self.persist()?;
        }

        info!(
            "SoH checks for experiment {} finished with {} errors",
            self.experiment.name, self.error_count
        );

        Ok(RunReport {
            error_count: self.error_count,
        })
    }

    /// Delete every C2 response stored for the experiment.
    ///
    /// # Errors
    /// Returns `SohError::C2` if the substrate rejects the request.
    pub async fn cleanup(&self) -> Result<(), SohError> {
        self.coordinator
            .dispatcher()
            .clear_responses(&self.experiment.namespace)
            .await?;
        Ok(())
    }

    pub(crate) fn persist(&self) -> Result<(), SohError> {
        let blob = StatusBlob {
            hosts: self.status.values().cloned().collect(),
            packet_capture: self.packet_capture.clone(),
        };

        self.store.write(
            &self.experiment.name,
            STATUS_KEY,
            &serde_json::to_value(&blob)?,
        )
    }

    pub(crate) fn ensure_running(&self) -> Result<(), SohError> {
        if self.coordinator.cancel_token().is_cancelled() {
            return Err(SohError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn host_state(&mut self, host: &str) -> &mut HostState {
        self.status
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(host))
    }

    /// Wait for a phase to finish, logging progress while it runs.
    pub(crate) async fn join_phase<M>(
        &mut self,
        group: &ResultGroup<M>,
        waiting_for: &str,
    ) -> Result<Vec<GroupRecord<M>>, SohError> {
        let notifier = self.coordinator.cancel_token().child_token();
        tokio::spawn(notify_periodically(
            notifier.clone(),
            format!("waiting for {waiting_for}..."),
            self.timings.notify_every,
        ));

        group.join().await;
        notifier.cancel();

        self.ensure_running()?;
        self.error_count += group.error_count();

        Ok(group.take_records())
    }

    /// Turn a joined phase's records into host state entries.
    pub(crate) fn fold_records(&mut self, section: Section, records: Vec<GroupRecord<ProbeMeta>>) {
        for record in records {
            let host = record.meta.host().to_string();
            let mut state = State::from_outcome(&record.meta, &record.outcome);

            if let Err(err) = &record.outcome {
                if err.is_client_not_active() {
                    self.index.mark_inactive(&host);
                }

                match record.meta.target() {
                    Some(target) => warn!(
                        "[✗] {} check from {} to {} failed: {}",
                        section.label(),
                        host,
                        target,
                        err
                    ),
                    None => warn!("[✗] {} check on {} failed: {}", section.label(), host, err),
                }
            }

            if section == Section::Reachability
                && let Some(target) = record.meta.target()
            {
                state.metadata.insert(
                    "hostname".into(),
                    serde_json::Value::String(self.index.hostname_for(target)),
                );
            }

            section.entries(self.host_state(&host)).push(state);
        }
    }

    /// App profiles for hosts that are still reachable over C2.
    pub(crate) fn active_profiles(&self) -> Vec<HostProfile> {
        let key = &self.experiment.soh.app_profile_key;
        let mut profiles = Vec::new();

        for app in &self.experiment.apps {
            for app_host in &app.hosts {
                let Some(raw) = app_host.metadata.get(key) else {
                    continue;
                };

                let host = &app_host.hostname;

                if !self.index.is_active(host) {
                    info!("Skipping host {} per config", host);
                    continue;
                }

                let profile = match SohProfile::from_metadata(raw) {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!(
                            "incorrect SoH profile for host {} in app {}: {}",
                            host, app.name, e
                        );
                        continue;
                    }
                };

                let timeout = profile.timeout().unwrap_or_else(|e| {
                    warn!("invalid c2Timeout in SoH profile for host {}: {}", host, e);
                    self.experiment.soh.c2_timeout
                });

                profiles.push(HostProfile {
                    host: host.clone(),
                    profile,
                    timeout,
                });
            }
        }

        profiles
    }
}

async fn notify_periodically(token: CancellationToken, msg: String, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => info!("{}", msg),
        }
    }
}
