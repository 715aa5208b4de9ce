use crate::orchestrator::Section;
use crate::{HealthCheck, SohError};
use soh_c2::{C2Command, C2Error, Expectation, ResultGroup, Verdict};
use soh_probes::{ProbeMeta, ProbeStrategy};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceKind {
    Process,
    Listener,
}

impl HealthCheck {
    pub(crate) async fn check_processes(&mut self) -> Result<(), SohError> {
        self.check_services(ServiceKind::Process).await
    }

    pub(crate) async fn check_listeners(&mut self) -> Result<(), SohError> {
        self.check_services(ServiceKind::Listener).await
    }

    /// (host, item, C2 timeout) triples from static config and app profiles.
    fn service_work(&self, kind: ServiceKind) -> Vec<(String, String, Duration)> {
        let soh = &self.experiment.soh;
        let configured: &BTreeMap<String, Vec<String>> = match kind {
            ServiceKind::Process => &soh.host_processes,
            ServiceKind::Listener => &soh.host_listeners,
        };

        let mut work = Vec::new();

        for (host, items) in configured {
            if !self.index.is_active(host) {
                info!("Skipping host {} per config", host);
                continue;
            }

            for item in items {
                work.push((host.clone(), item.clone(), soh.c2_timeout));
            }
        }

        for profile in self.active_profiles() {
            let items = match kind {
                ServiceKind::Process => &profile.profile.processes,
                ServiceKind::Listener => &profile.profile.listeners,
            };

            for item in items {
                work.push((profile.host.clone(), item.clone(), profile.timeout));
            }
        }

        work
    }

    async fn check_services(&mut self, kind: ServiceKind) -> Result<(), SohError> {
        let group = ResultGroup::new();

        for (host, item, timeout) in self.service_work(kind) {
            let (meta, noun) = match kind {
                ServiceKind::Process => (
                    ProbeMeta::Process {
                        host: host.clone(),
                        process: item.clone(),
                    },
                    "process",
                ),
                ServiceKind::Listener => (
                    ProbeMeta::Listener {
                        host: host.clone(),
                        port: item.clone(),
                    },
                    "listener",
                ),
            };

            let probe = match self.index.probe(&self.experiment, &host) {
                Ok(probe) => probe,
                Err(e) => {
                    group.add_error(e, meta);
                    continue;
                }
            };

            info!("Checking for {} {} on host {}", noun, item, host);

            let command = match kind {
                ServiceKind::Process => probe.strategy.process_command(&item),
                ServiceKind::Listener => probe.strategy.listener_command(&item),
            };

            let cmd = C2Command::exec(probe.target, command, timeout);
            let expectation = service_expectation(
                kind,
                probe.strategy,
                self.timings.probe_retries,
                self.timings.retry_delay,
            );

            self.coordinator
                .schedule(&group, cmd, vec![expectation], meta);
        }

        let (waiting_for, section) = match kind {
            ServiceKind::Process => ("process tests to complete", Section::Processes),
            ServiceKind::Listener => ("listener tests to complete", Section::Listeners),
        };

        let records = self.join_phase(&group, waiting_for).await?;
        self.fold_records(section, records);

        Ok(())
    }

    pub(crate) async fn check_cpu_load(&mut self) -> Result<(), SohError> {
        info!("Querying nodes for CPU load");

        let group = ResultGroup::new();
        let timeout = self.experiment.soh.c2_timeout;

        for host in &self.index.c2_hosts {
            let meta = ProbeMeta::Load { host: host.clone() };

            let probe = match self.index.probe(&self.experiment, host) {
                Ok(probe) => probe,
                Err(e) => {
                    group.add_error(e, meta);
                    continue;
                }
            };

            let strategy = probe.strategy;
            let cmd = C2Command::exec(probe.target, strategy.load_command(), timeout);

            let expectation = Expectation::both(move |resp| match strategy.parse_load(resp) {
                Ok(load) => Verdict::Done(load),
                Err(e) => Verdict::Fatal(C2Error::ValidationFailed(e.to_string())),
            });

            self.coordinator
                .schedule(&group, cmd, vec![expectation], meta);
        }

        let records = self.join_phase(&group, "CPU load details").await?;

        for record in records {
            let host = record.meta.host().to_string();

            let load = match record.outcome {
                Ok(load) => load,
                Err(e) => {
                    if e.is_client_not_active() {
                        self.index.mark_inactive(&host);
                    }
                    warn!("[✗] failed to get CPU load from {}: {}", host, e);
                    e.to_string()
                }
            };

            self.host_state(&host).cpu_load = load;
        }

        Ok(())
    }
}

/// Settles once the service shows up, giving up after `retries` re-dispatches.
fn service_expectation(
    kind: ServiceKind,
    strategy: &'static dyn ProbeStrategy,
    retries: u32,
    delay: Duration,
) -> Expectation {
    let mut remaining = retries;

    Expectation::both(move |resp| {
        let (up, success, failure) = match kind {
            ServiceKind::Process => (
                strategy.process_running(resp),
                "process running",
                "process not running",
            ),
            ServiceKind::Listener => (
                strategy.listening(resp),
                "listening on port",
                "not listening on port",
            ),
        };

        if up {
            return Verdict::Done(success.into());
        }

        if remaining > 0 {
            remaining -= 1;
            return Verdict::Retry(delay);
        }

        Verdict::Fatal(C2Error::ValidationFailed(failure.into()))
    })
}

#[cfg(test)]
mod tests {
    use crate::Indices;
    use crate::orchestrator::tests::harness;
    use soh_c2::Reply;

    const SERVICES: &str = r#"
experiment "svc" {
  node "h1" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
  }
  node "w1" {
    os_type = "windows"
  }
  app "web" {
    host "h1" {
      sohProfile = {
        processes = ["nginx"]
        listeners = [80]
      }
    }
    host "w1" {
      sohProfile = {
        processes = "not-a-list"
      }
    }
    host "gone" {
      sohProfile = {
        processes = ["x"]
      }
    }
  }
  soh {
    host_processes = { h1 = ["sshd"], w1 = ["svchost"] }
    host_listeners = { h1 = [22] }
  }
}
"#;

    const SS_HEADER: &str = "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port";

    #[tokio::test]
    async fn test_process_probe_retries_then_fails() {
        let mut h = harness(SERVICES);
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("w1", "u-w", &[]);
        h.fake.script("h1", "cc exec pgrep -f sshd", vec![Reply::output("812\n")]);
        h.fake.script(
            "w1",
            r#"cc exec powershell -command "Get-Process svchost -ErrorAction SilentlyContinue""#,
            vec![Reply::output("Handles  NPM(K)\n  512  svchost")],
        );

        h.check.index = Indices::build(&h.check.experiment);
        h.check.check_processes().await.unwrap();

        let procs = &h.check.status()["h1"].processes;
        let sshd = procs.iter().find(|s| s.metadata["proc"] == "sshd").unwrap();
        assert_eq!(sshd.success, "process running");

        // Initial dispatch plus two retries with the test budget.
        let nginx = procs.iter().find(|s| s.metadata["proc"] == "nginx").unwrap();
        assert_eq!(nginx.error, "process not running");
        let nginx_issues = h
            .fake
            .issued()
            .iter()
            .filter(|(_, a)| a == "cc exec pgrep -f nginx")
            .count();
        assert_eq!(nginx_issues, 3);

        assert_eq!(h.check.status()["w1"].processes[0].success, "process running");
        // The malformed profile and the unknown host are skipped, not probed.
        assert_eq!(h.check.status().len(), 2);
        assert_eq!(h.check.error_count, 1);
    }

    #[tokio::test]
    async fn test_listener_needs_more_than_header() {
        let mut h = harness(SERVICES);
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.script(
            "h1",
            "cc exec ss -lntu state all 'sport = 22'",
            vec![Reply::output(format!(
                "{SS_HEADER}\ntcp LISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n"
            ))],
        );
        h.fake.script(
            "h1",
            "cc exec ss -lntu state all 'sport = 80'",
            vec![Reply::output(SS_HEADER)],
        );

        h.check.index = Indices::build(&h.check.experiment);
        h.check.index.mark_inactive("w1");
        h.check.check_listeners().await.unwrap();

        let listeners = &h.check.status()["h1"].listeners;
        let ssh = listeners.iter().find(|s| s.metadata["port"] == "22").unwrap();
        assert_eq!(ssh.success, "listening on port");
        let web = listeners.iter().find(|s| s.metadata["port"] == "80").unwrap();
        assert_eq!(web.error, "not listening on port");
    }

    #[tokio::test]
    async fn test_cpu_load_windows_and_linux() {
        let mut h = harness(SERVICES);
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("w1", "u-w", &[]);
        h.fake.script(
            "h1",
            "cc exec cat /proc/loadavg",
            vec![Reply::output("0.10 0.20 0.30 1/100 999\n")],
        );
        h.fake.script(
            "w1",
            r#"cc exec powershell -command "Get-WmiObject Win32_Processor | Measure-Object -Property LoadPercentage -Average | Select -ExpandProperty Average""#,
            vec![Reply::output("17\r\n")],
        );

        h.check.index = Indices::build(&h.check.experiment);
        h.check.check_cpu_load().await.unwrap();

        assert_eq!(h.check.status()["h1"].cpu_load, "0.10");
        assert_eq!(h.check.status()["w1"].cpu_load, "17");
        assert_eq!(h.check.error_count, 0);
    }

    #[tokio::test]
    async fn test_cpu_load_inactive_client() {
        let mut h = harness(SERVICES);
        h.fake.add_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("w1", "u-w", &[]);
        h.fake.script(
            "w1",
            r#"cc exec powershell -command "Get-WmiObject Win32_Processor | Measure-Object -Property LoadPercentage -Average | Select -ExpandProperty Average""#,
            vec![Reply::output("3")],
        );

        h.check.index = Indices::build(&h.check.experiment);
        h.check.check_cpu_load().await.unwrap();

        assert!(h.check.status()["h1"].cpu_load.contains("C2 client not active"));
        assert!(!h.check.index().is_active("h1"));
        assert_eq!(h.check.error_count, 1);
    }
}
