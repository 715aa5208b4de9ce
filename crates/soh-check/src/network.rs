use crate::orchestrator::Section;
use crate::{HealthCheck, HostProbe, ProbedInterface, SohError, Timings, probed_interfaces};
use soh_c2::{C2Command, C2Error, Coordinator, Expectation, Outcome, ResultGroup, Verdict};
use soh_probes::ProbeMeta;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// An address the substrate handed out over DHCP during the run.
#[derive(Debug)]
struct LearnedAddress {
    host: String,
    iface: String,
    vlan: String,
    address: String,
}

/// Address, then default route, then gateway ping, for one interface.
struct InterfaceCheck {
    coordinator: Coordinator,
    group: ResultGroup<ProbeMeta>,
    probe: HostProbe,
    probed: ProbedInterface,
    c2_timeout: Duration,
    dhcp_timeout: Duration,
    timings: Timings,
    learned: mpsc::UnboundedSender<LearnedAddress>,
}

impl HealthCheck {
    pub(crate) async fn check_networking(&mut self) -> Result<(), SohError> {
        if self.experiment.soh.skip_network_config {
            info!("Skipping initial network configuration tests per config");
            return Ok(());
        }

        let group = ResultGroup::new();
        let (learned_tx, mut learned_rx) = mpsc::unbounded_channel();

        for host in &self.index.c2_hosts {
            let Some(node) = self.index.nodes.get(host) else {
                continue;
            };

            let interfaces = probed_interfaces(node);
            if interfaces.is_empty() {
                continue;
            }

            let probe = match self.index.probe(&self.experiment, host) {
                Ok(probe) => probe,
                Err(e) => {
                    group.add_error(e, ProbeMeta::Network { host: host.clone() });
                    continue;
                }
            };

            for probed in interfaces {
                if probed.iface.is_dhcp() {
                    info!("Waiting for DHCP address on {} of host {}...", probed.iface.name, host);
                } else {
                    info!("Waiting for IP {} on host {} to be set...", probed.iface.cidr(), host);
                }

                let check = InterfaceCheck {
                    coordinator: self.coordinator.clone(),
                    group: group.clone(),
                    probe: probe.clone(),
                    probed,
                    c2_timeout: self.experiment.soh.c2_timeout,
                    dhcp_timeout: self.experiment.soh.dhcp_timeout,
                    timings: self.timings.clone(),
                    learned: learned_tx.clone(),
                };

                group.spawn(check.run());
            }
        }

        drop(learned_tx);

        let records = self
            .join_phase(&group, "initial network configurations to be validated")
            .await?;

        while let Ok(learned) = learned_rx.try_recv() {
            self.index
                .learn_address(&learned.host, &learned.iface, &learned.vlan, &learned.address);
        }

        for record in &records {
            let Err(err) = &record.outcome else {
                continue;
            };

            let host = record.meta.host();
            if err.is_client_not_active() {
                self.index.mark_inactive(host);
            }
            self.index.mark_failed_network(host);
        }

        self.fold_records(Section::Networking, records);
        Ok(())
    }
}

impl InterfaceCheck {
    fn meta(&self) -> ProbeMeta {
        ProbeMeta::Network {
            host: self.probe.host.clone(),
        }
    }

    async fn run(self) {
        let deadline = Instant::now() + self.timings.network_deadline;
        let strategy = self.probe.strategy;
        let delay = self.timings.retry_delay;

        let address = if self.probed.iface.is_dhcp() {
            match self.wait_for_dhcp().await {
                Ok(address) => address,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    self.group.add_error(e, self.meta());
                    return;
                }
            }
        } else {
            let address = self.probed.iface.address.clone();
            let mask = self.probed.iface.mask;
            let expected = address.clone();

            let configured = Expectation::both(move |resp| {
                if strategy.address_configured(resp, &expected, mask) {
                    return Verdict::Done(format!("IP {expected} configured"));
                }
                retry_until(deadline, delay, "retry time expired waiting for IP to be set")
            });

            if !self.stage(strategy.address_command(), configured).await {
                return;
            }
            address
        };

        debug!(host = %self.probe.host, %address, "interface address confirmed");

        let Some(gateway) = self.probed.iface.gateway.clone() else {
            return;
        };

        let gw = gateway.clone();
        let route = Expectation::both(move |resp| {
            if strategy.default_route_configured(resp, &gw) {
                return Verdict::Done(format!("gateway {gw} configured"));
            }
            retry_until(deadline, delay, "retry time expired waiting for gateway to be set")
        });

        if !self.stage(strategy.route_command(), route).await {
            return;
        }

        let gw = gateway.clone();
        let ping = Expectation::both(move |resp| {
            if strategy.ping_failed(resp) {
                return retry_until(deadline, delay, "retry time expired waiting for gateway to be up");
            }
            Verdict::Done(format!("gateway {gw} is up"))
        });

        self.stage(&strategy.ping_command(&gateway), ping).await;
    }

    /// Run one stage and record its results. Returns whether every result succeeded.
    async fn stage(&self, command: &str, expectation: Expectation) -> bool {
        let cmd = C2Command::exec(self.probe.target.clone(), command, self.c2_timeout);

        let Outcome::Finished(results) = self.coordinator.execute(&cmd, vec![expectation]).await
        else {
            return false;
        };

        let mut passed = true;
        for result in results {
            passed &= result.is_ok();
            self.group.add(result, self.meta());
        }
        passed
    }

    /// Poll the substrate's address table until this NIC has an address.
    async fn wait_for_dhcp(&self) -> Result<String, C2Error> {
        let target = &self.probe.target;
        let substrate = self.coordinator.dispatcher().substrate();
        let cancel = self.coordinator.cancel_token();
        let deadline = Instant::now() + self.dhcp_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(C2Error::Cancelled);
            }

            match substrate.vm_info(&target.namespace, &target.vm).await {
                Ok(Some(record)) => {
                    if let Some(address) = record
                        .addresses
                        .get(self.probed.nic)
                        .filter(|a| !a.is_empty())
                    {
                        // The receiver only goes away once the phase is over.
                        let _ = self.learned.send(LearnedAddress {
                            host: self.probe.host.clone(),
                            iface: self.probed.iface.name.clone(),
                            vlan: self.probed.iface.vlan.clone(),
                            address: address.clone(),
                        });
                        self.group
                            .add_success(format!("IP {address} configured"), self.meta());
                        return Ok(address.clone());
                    }
                }
                Ok(None) => return Err(C2Error::VmNotFound(target.vm.clone())),
                Err(e) => debug!(vm = %target.vm, error = %e, "address table query failed"),
            }

            if Instant::now() >= deadline {
                return Err(C2Error::ValidationFailed(
                    "retry time expired waiting for IP to be set".into(),
                ));
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(C2Error::Cancelled),
                () = tokio::time::sleep(self.timings.dhcp_poll) => {}
            }
        }
    }
}

fn retry_until(deadline: Instant, delay: Duration, expired: &str) -> Verdict {
    if Instant::now() >= deadline {
        return Verdict::Fatal(C2Error::ValidationFailed(expired.to_string()));
    }
    Verdict::Retry(delay)
}
