use crate::orchestrator::Section;
use crate::{HealthCheck, HostProbe, SohError};
use rand::Rng;
use rand::seq::IndexedRandom;
use soh_c2::{C2Action, C2Command, C2Error, Expectation, ResultGroup, Verdict};
use soh_core::{CustomReachability, ReachabilityMode};
use soh_probes::{ConnTestSpec, ProbeMeta, Protocol};
use tracing::{info, warn};

/// One reachability check decided before anything is dispatched.
enum PlannedCheck {
    /// Recorded as an error without dispatching.
    Skip { meta: ProbeMeta, reason: String },
    Ping { probe: HostProbe, address: String },
    Connect {
        probe: HostProbe,
        spec: ConnTestSpec,
        meta: ProbeMeta,
    },
}

impl HealthCheck {
    pub(crate) async fn check_reachability(&mut self) -> Result<(), SohError> {
        let soh = &self.experiment.soh;

        if soh.skip_network_config {
            return Ok(());
        }

        let icmp_disabled = soh.reachability == ReachabilityMode::Off;
        if icmp_disabled {
            info!("ICMP reachability test is disabled");
        }

        let custom_disabled = soh.custom_reachability.is_empty();
        if custom_disabled {
            info!("No custom reachability tests configured");
        }

        if icmp_disabled && custom_disabled {
            return Ok(());
        }

        info!("Reachability test set to {} mode", soh.reachability.label());

        let plan = {
            let mut rng = rand::rng();
            let mut plan = self.plan_icmp(&mut rng);
            plan.extend(self.plan_custom());
            plan
        };

        let group = ResultGroup::new();
        let timeout = self.experiment.soh.c2_timeout;

        for check in plan {
            match check {
                PlannedCheck::Skip { meta, reason } => {
                    group.add_error(C2Error::ValidationFailed(reason), meta);
                }
                PlannedCheck::Ping { probe, address } => {
                    info!(
                        "Pinging {} ({}) from host {}",
                        self.index.hostname_for(&address),
                        address,
                        probe.host
                    );

                    let meta = ProbeMeta::Reachability {
                        host: probe.host.clone(),
                        target: address.clone(),
                    };
                    let cmd = C2Command::exec(
                        probe.target.clone(),
                        probe.strategy.ping_command(&address),
                        timeout,
                    );
                    let strategy = probe.strategy;

                    let expectation = Expectation::both(move |resp| {
                        if strategy.ping_failed(resp) {
                            return Verdict::Fatal(C2Error::ValidationFailed(
                                "no successful pings".into(),
                            ));
                        }
                        Verdict::Done(format!("pinging {address} succeeded"))
                    });

                    self.coordinator
                        .schedule(&group, cmd, vec![expectation], meta);
                }
                PlannedCheck::Connect { probe, spec, meta } => {
                    let url = format!("{}://{}:{}", spec.proto, spec.dst, spec.port);
                    info!("Connecting to {} from host {}", url, probe.host);

                    let cmd = C2Command::new(
                        probe.target.clone(),
                        C2Action::TestConn(spec.render()),
                        timeout,
                    );

                    let expectation = Expectation::both(move |resp| {
                        if resp.contains("fail") {
                            return Verdict::Fatal(C2Error::ValidationFailed(format!(
                                "failed to connect to {url}"
                            )));
                        }
                        Verdict::Done(format!("connection to {url} succeeded"))
                    });

                    self.coordinator
                        .schedule(&group, cmd, vec![expectation], meta);
                }
            }
        }

        let records = self
            .join_phase(&group, "reachability tests to complete")
            .await?;
        self.fold_records(Section::Reachability, records);

        Ok(())
    }

    /// Why `host` cannot be the source of a probe, if anything.
    fn source_problem(&self, host: &str) -> Option<&'static str> {
        if self.index.network_failed(host) {
            return Some("networking not configured on host");
        }
        if !self.index.is_active(host) {
            return Some("C2 not active on host");
        }
        None
    }

    fn plan_icmp<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<PlannedCheck> {
        let mode = self.experiment.soh.reachability;
        let mut plan = Vec::new();

        if mode == ReachabilityMode::Off {
            return plan;
        }

        for host in &self.index.reachability_hosts {
            let mut problem = self.source_problem(host).map(str::to_string);
            let probe = match self.index.probe(&self.experiment, host) {
                Ok(probe) => Some(probe),
                Err(e) => {
                    problem.get_or_insert_with(|| e.to_string());
                    None
                }
            };

            let own = self.index.addresses_of(host);
            let Some(host_vlans) = self.index.host_vlans.get(host) else {
                continue;
            };

            for vlan in host_vlans {
                let Some(addresses) = self.index.vlans.get(vlan) else {
                    continue;
                };

                let targets: Vec<&String> = addresses
                    .iter()
                    .filter(|a| !own.contains(a.as_str()))
                    .collect();

                if targets.is_empty() {
                    continue;
                }

                let check = |address: &str| match (&problem, &probe) {
                    (None, Some(probe)) => PlannedCheck::Ping {
                        probe: probe.clone(),
                        address: address.to_string(),
                    },
                    (reason, _) => PlannedCheck::Skip {
                        meta: reachability_meta(host, address),
                        reason: reason.clone().unwrap_or_default(),
                    },
                };

                match mode {
                    ReachabilityMode::Sample => {
                        let healthy: Vec<&String> = targets
                            .iter()
                            .copied()
                            .filter(|a| !self.target_failed(a))
                            .collect();

                        if let Some(address) = healthy.choose(rng) {
                            plan.push(check(address.as_str()));
                        } else if let Some(address) = targets.choose(rng) {
                            plan.push(PlannedCheck::Skip {
                                meta: reachability_meta(host, address),
                                reason: "networking not configured on target".into(),
                            });
                        }
                    }
                    ReachabilityMode::Full => {
                        for address in targets {
                            if self.target_failed(address) {
                                plan.push(PlannedCheck::Skip {
                                    meta: reachability_meta(host, address),
                                    reason: "networking not configured on target".into(),
                                });
                            } else {
                                plan.push(check(address.as_str()));
                            }
                        }
                    }
                    ReachabilityMode::Off => {}
                }
            }
        }

        plan
    }

    fn target_failed(&self, address: &str) -> bool {
        self.index
            .addr_hosts
            .get(address)
            .is_some_and(|host| self.index.network_failed(host))
    }

    fn plan_custom(&self) -> Vec<PlannedCheck> {
        self.experiment
            .soh
            .custom_reachability
            .iter()
            .map(|reach| self.plan_connection(reach))
            .collect()
    }

    fn plan_connection(&self, reach: &CustomReachability) -> PlannedCheck {
        let host = reach.src.as_str();
        let skip = |reason: String| PlannedCheck::Skip {
            meta: reachability_meta(host, &reach.dst),
            reason,
        };

        if !self.index.is_active(host) {
            return skip("C2 not active on host".into());
        }
        if self.index.network_failed(host) {
            return skip("networking not configured on host".into());
        }

        let probe = match self.index.probe(&self.experiment, host) {
            Ok(probe) => probe,
            Err(e) => return skip(e.to_string()),
        };

        let Some(dst) = self.index.resolve_destination(&reach.dst) else {
            return skip(format!("unable to resolve destination {}", reach.dst));
        };

        let proto: Protocol = match reach.proto.parse() {
            Ok(proto) => proto,
            Err(e) => return skip(format!("{e}")),
        };

        let wait = match reach.wait.as_deref().filter(|w| !w.is_empty()) {
            Some(raw) => match humantime::parse_duration(raw) {
                Ok(wait) => Some(wait),
                Err(_) => {
                    warn!("invalid wait time of {} provided, using default", raw);
                    None
                }
            },
            None => None,
        };

        let spec = match ConnTestSpec::new(proto, dst.clone(), reach.port)
            .with_wait(wait)
            .with_payload(reach.udp_packet_base64.as_deref())
        {
            Ok(spec) => spec,
            Err(e) => return skip(e.to_string()),
        };

        PlannedCheck::Connect {
            meta: ProbeMeta::Connection {
                host: host.to_string(),
                target: dst,
                port: reach.port,
                proto,
            },
            probe,
            spec,
        }
    }
}

fn reachability_meta(host: &str, target: &str) -> ProbeMeta {
    ProbeMeta::Reachability {
        host: host.to_string(),
        target: target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Indices;
    use crate::orchestrator::tests::{LINUX_PING_FAIL, LINUX_PING_OK, harness};
    use soh_c2::Reply;

    const VLAN_ABC: &str = r#"
experiment "reach" {
  node "src" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.10"
    }
  }
  node "a" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
  }
  node "b" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.2"
    }
  }
  node "c" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.3"
    }
  }
  node "other" {
    interface "IF0" {
      vlan    = "OTHER"
      address = "192.168.0.1"
    }
  }
  soh {
    reachability = "sample"
  }
}
"#;

    fn ping_targets(plan: &[PlannedCheck], from: &str) -> Vec<String> {
        plan.iter()
            .filter_map(|check| match check {
                PlannedCheck::Ping { probe, address } if probe.host == from => {
                    Some(address.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn skips(plan: &[PlannedCheck], from: &str) -> Vec<(String, String)> {
        plan.iter()
            .filter_map(|check| match check {
                PlannedCheck::Skip { meta, reason } if meta.host() == from => Some((
                    meta.target().unwrap_or_default().to_string(),
                    reason.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sample_avoids_failed_targets() {
        let mut h = harness(VLAN_ABC);
        h.check.index = Indices::build(&h.check.experiment);
        h.check.index.mark_failed_network("b");

        let mut rng = rand::rng();
        for _ in 0..50 {
            let plan = h.check.plan_icmp(&mut rng);
            let targets = ping_targets(&plan, "src");
            assert_eq!(targets.len(), 1);
            assert!(targets[0] == "10.0.0.1" || targets[0] == "10.0.0.3");
            // Only VLANs the host sits on are sampled.
            assert!(!targets.contains(&"192.168.0.1".to_string()));
        }
    }

    #[test]
    fn test_sample_all_failed_records_error_only() {
        let mut h = harness(VLAN_ABC);
        h.check.index = Indices::build(&h.check.experiment);
        for host in ["a", "b", "c"] {
            h.check.index.mark_failed_network(host);
        }

        let plan = h.check.plan_icmp(&mut rand::rng());
        assert!(ping_targets(&plan, "src").is_empty());

        let skipped = skips(&plan, "src");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].1, "networking not configured on target");
    }

    #[test]
    fn test_full_mode_skip_reasons() {
        let mut h = harness(VLAN_ABC);
        h.check.experiment.soh.reachability = ReachabilityMode::Full;
        h.check.index = Indices::build(&h.check.experiment);
        h.check.index.mark_failed_network("b");
        h.check.index.mark_inactive("a");

        let plan = h.check.plan_icmp(&mut rand::rng());

        assert_eq!(ping_targets(&plan, "src"), vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(
            skips(&plan, "src"),
            vec![("10.0.0.2".to_string(), "networking not configured on target".to_string())]
        );

        // An inactive source still produces a record per target.
        let from_a = skips(&plan, "a");
        assert!(from_a.contains(&("10.0.0.10".to_string(), "C2 not active on host".to_string())));

        // A failed source reports its own networking first.
        let from_b = skips(&plan, "b");
        assert!(from_b.contains(&(
            "10.0.0.1".to_string(),
            "networking not configured on host".to_string()
        )));
    }

    #[tokio::test]
    async fn test_full_reachability_records() {
        let hcl = r#"
experiment "reach" {
  node "h1" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
  }
  node "h2" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.2"
    }
  }
  soh {
    reachability = "full"
  }
}
"#;
        let mut h = harness(hcl);
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("h2", "u-2", &[]);
        h.fake.script("h1", "cc exec ping -c 1 10.0.0.2", vec![Reply::output(LINUX_PING_OK)]);
        h.fake.script("h2", "cc exec ping -c 1 10.0.0.1", vec![Reply::output(LINUX_PING_FAIL)]);

        h.check.index = Indices::build(&h.check.experiment);
        h.check.check_reachability().await.unwrap();

        // A failed ping is not retried.
        assert_eq!(h.fake.issue_count("h2"), 1);

        let status = h.check.status();
        assert_eq!(status["h1"].reachability[0].success, "pinging 10.0.0.2 succeeded");
        let failed = &status["h2"].reachability[0];
        assert_eq!(failed.error, "no successful pings");
        assert_eq!(failed.metadata["hostname"], "h1");
        assert_eq!(h.check.error_count, 1);
    }

    #[tokio::test]
    async fn test_custom_connection_tests() {
        let hcl = r#"
experiment "reach" {
  node "h1" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
  }
  node "h2" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.2"
    }
  }
  soh {
    custom_reachability {
      src   = "h1"
      dst   = "h2|IF0"
      proto = "tcp"
      port  = 80
    }
    custom_reachability {
      src   = "h1"
      dst   = "10.0.0.2"
      proto = "udp"
      port  = 53
      wait  = "2s"
      udp_packet_base64 = "aGVsbG8="
    }
    custom_reachability {
      src   = "h2"
      dst   = "10.0.0.1"
      proto = "tcp"
      port  = 22
    }
  }
}
"#;
        let mut h = harness(hcl);
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("h2", "u-2", &[]);
        h.fake.script(
            "h1",
            "cc test-conn tcp 10.0.0.2 80 wait 5s",
            vec![Reply::output("success")],
        );
        h.fake.script(
            "h1",
            "cc test-conn udp 10.0.0.2 53 wait 2s aGVsbG8=",
            vec![Reply::output("connection fail")],
        );

        h.check.index = Indices::build(&h.check.experiment);
        h.check.index.mark_inactive("h2");
        h.check.check_reachability().await.unwrap();

        let h1 = &h.check.status()["h1"].reachability;
        let ok = h1.iter().find(|s| s.metadata["port"] == 80).unwrap();
        assert_eq!(ok.success, "connection to tcp://10.0.0.2:80 succeeded");
        assert_eq!(ok.metadata["proto"], "tcp");
        assert_eq!(ok.metadata["hostname"], "h2");

        let failed = h1.iter().find(|s| s.metadata["port"] == 53).unwrap();
        assert_eq!(failed.error, "failed to connect to udp://10.0.0.2:53");

        let skipped = &h.check.status()["h2"].reachability[0];
        assert_eq!(skipped.error, "C2 not active on host");
        assert_eq!(h.fake.issue_count("h2"), 0);
    }

    #[tokio::test]
    async fn test_disabled_without_custom_tests() {
        let mut h = harness(VLAN_ABC);
        h.check.experiment.soh.reachability = ReachabilityMode::Off;
        h.check.index = Indices::build(&h.check.experiment);
        h.check.check_reachability().await.unwrap();
        assert!(h.fake.issued().is_empty());
        assert!(h.check.status().is_empty());
    }
}
