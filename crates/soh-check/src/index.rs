use soh_c2::{C2Error, Target};
use soh_core::{Experiment, Interface, Node};
use soh_probes::{ProbeStrategy, strategy};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A host resolved into everything needed to probe it.
#[derive(Clone)]
pub struct HostProbe {
    pub host: String,
    pub target: Target,
    pub strategy: &'static dyn ProbeStrategy,
}

impl std::fmt::Debug for HostProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProbe")
            .field("host", &self.host)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// An interface that takes part in health checks, with its NIC position.
#[derive(Debug, Clone)]
pub struct ProbedInterface {
    /// Position among the node's network cards, matching the substrate's
    /// address table.
    pub nic: usize,
    pub iface: Interface,
}

/// Interfaces that are neither management nor serial.
#[must_use]
pub fn probed_interfaces(node: &Node) -> Vec<ProbedInterface> {
    node.interfaces
        .iter()
        .filter(|iface| !iface.is_serial())
        .enumerate()
        .filter(|(_, iface)| !iface.is_management())
        .map(|(nic, iface)| ProbedInterface {
            nic,
            iface: iface.clone(),
        })
        .collect()
}

/// Topology-wide lookups built at the start of every run.
///
/// Hosts only ever leave `c2_hosts` and only ever join `failed_network`.
#[derive(Debug, Clone, Default)]
pub struct Indices {
    /// Every booting VM, including skipped ones.
    pub nodes: BTreeMap<String, Node>,
    /// Hosts whose control channel is presumed alive.
    pub c2_hosts: BTreeSet<String>,
    /// Hosts with at least one probed interface.
    pub reachability_hosts: BTreeSet<String>,
    pub addr_hosts: BTreeMap<String, String>,
    pub vlans: BTreeMap<String, Vec<String>>,
    pub host_vlans: BTreeMap<String, BTreeSet<String>>,
    pub failed_network: BTreeSet<String>,
    /// host -> interface name -> address
    pub host_ips: BTreeMap<String, BTreeMap<String, String>>,
}

impl Indices {
    #[must_use]
    pub fn build(experiment: &Experiment) -> Self {
        let mut index = Self::default();

        for node in &experiment.nodes {
            if !node.is_virtual_machine() || !node.boots() {
                continue;
            }

            let host = node.hostname.clone();
            index.nodes.insert(host.clone(), node.clone());

            if experiment.soh.skips(&host, node.image_file_name()) {
                info!("Skipping host {} per config", host);
                continue;
            }

            index.c2_hosts.insert(host.clone());

            for probed in probed_interfaces(node) {
                let iface = &probed.iface;

                index.reachability_hosts.insert(host.clone());
                index
                    .host_vlans
                    .entry(host.clone())
                    .or_default()
                    .insert(iface.vlan.clone());

                // DHCP addresses are learned once the substrate reports them.
                if !iface.address.is_empty() {
                    index.learn_address(&host, &iface.name, &iface.vlan, &iface.address);
                }
            }
        }

        index
    }

    pub fn learn_address(&mut self, host: &str, iface: &str, vlan: &str, address: &str) {
        self.addr_hosts
            .insert(address.to_string(), host.to_string());

        let addresses = self.vlans.entry(vlan.to_string()).or_default();
        if !addresses.iter().any(|a| a == address) {
            addresses.push(address.to_string());
        }

        self.host_ips
            .entry(host.to_string())
            .or_default()
            .insert(iface.to_string(), address.to_string());
    }

    #[must_use]
    pub fn is_active(&self, host: &str) -> bool {
        self.c2_hosts.contains(host)
    }

    pub fn mark_inactive(&mut self, host: &str) {
        if self.c2_hosts.remove(host) {
            info!("Dropping host {} from C2 checks for the rest of the run", host);
        }
    }

    #[must_use]
    pub fn network_failed(&self, host: &str) -> bool {
        self.failed_network.contains(host)
    }

    pub fn mark_failed_network(&mut self, host: &str) {
        self.failed_network.insert(host.to_string());
    }

    /// Addresses owned by `host`.
    #[must_use]
    pub fn addresses_of(&self, host: &str) -> BTreeSet<&str> {
        self.host_ips
            .get(host)
            .map(|ips| ips.values().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Resolve a literal address or a `host|interface` reference.
    #[must_use]
    pub fn resolve_destination(&self, dst: &str) -> Option<String> {
        match dst.split_once('|') {
            Some((host, iface)) => self.host_ips.get(host)?.get(iface).cloned(),
            None => Some(dst.to_string()),
        }
    }

    /// Hostname owning an address, or empty if the address is not in the topology.
    #[must_use]
    pub fn hostname_for(&self, address: &str) -> String {
        self.addr_hosts.get(address).cloned().unwrap_or_default()
    }

    /// # Errors
    /// Returns `C2Error::VmNotFound` for hosts outside the topology and
    /// `C2Error::ValidationFailed` for unsupported OS types.
    pub fn probe(&self, experiment: &Experiment, host: &str) -> Result<HostProbe, C2Error> {
        let Some(node) = self.nodes.get(host) else {
            return Err(C2Error::VmNotFound(host.to_string()));
        };

        let Some(family) = node.os_family() else {
            return Err(C2Error::ValidationFailed(format!(
                "unknown OS type {}",
                node.os_type
            )));
        };

        let target = Target::new(&experiment.namespace, host, family)
            .id_by_uuid(experiment.soh.use_uuid_for_c2(host));

        Ok(HostProbe {
            host: host.to_string(),
            target,
            strategy: strategy(family),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soh_core::OsFamily;

    const TOPOLOGY: &str = r#"
experiment "demo" {
  node "h1" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
    interface "MGMT0" {
      vlan    = "MGMT"
      address = "172.16.0.1"
    }
  }
  node "h2" {
    os_type = "windows"
    interface "S0" {
      type = "serial"
      vlan = "SER"
    }
    interface "IF0" {
      vlan  = "DATA"
      proto = "dhcp"
    }
  }
  node "h3" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.3"
    }
  }
  node "h4" {
    do_not_boot = true
  }
  node "h5" {
    os_type = "minirouter"
  }
  soh {
    skip_hosts            = ["h3"]
    hosts_use_uuid_for_c2 = "h2"
  }
}
"#;

    fn experiment() -> Experiment {
        Experiment::parse(TOPOLOGY).unwrap()
    }

    #[test]
    fn test_build_skips_and_excludes() {
        let exp = experiment();
        let index = Indices::build(&exp);

        assert!(index.nodes.contains_key("h3"));
        assert!(!index.nodes.contains_key("h4"));
        assert_eq!(
            index.c2_hosts.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["h1", "h2", "h5"]
        );
        assert_eq!(index.vlans["DATA"], vec!["10.0.0.1"]);
        assert!(!index.addr_hosts.contains_key("172.16.0.1"));
        assert!(!index.vlans.contains_key("SER"));
        assert!(index.reachability_hosts.contains("h2"));
        assert!(!index.reachability_hosts.contains("h3"));
        assert!(index.host_vlans["h2"].contains("DATA"));
    }

    #[test]
    fn test_nic_positions_skip_serial() {
        let exp = experiment();
        let h2 = exp.find_node("h2").unwrap();
        let probed = probed_interfaces(h2);
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].nic, 0);
        assert_eq!(probed[0].iface.name, "IF0");
    }

    #[test]
    fn test_learn_and_resolve() {
        let mut index = Indices::build(&experiment());
        index.learn_address("h2", "IF0", "DATA", "10.0.0.7");
        index.learn_address("h2", "IF0", "DATA", "10.0.0.7");

        assert_eq!(index.vlans["DATA"], vec!["10.0.0.1", "10.0.0.7"]);
        assert_eq!(index.hostname_for("10.0.0.7"), "h2");
        assert_eq!(index.resolve_destination("h2|IF0").as_deref(), Some("10.0.0.7"));
        assert_eq!(index.resolve_destination("h2|IF9"), None);
        assert_eq!(index.resolve_destination("192.168.1.1").as_deref(), Some("192.168.1.1"));
        assert!(index.addresses_of("h2").contains("10.0.0.7"));
    }

    #[test]
    fn test_probe_resolution() {
        let exp = experiment();
        let index = Indices::build(&exp);

        let h2 = index.probe(&exp, "h2").unwrap();
        assert_eq!(h2.target.os, OsFamily::Windows);
        assert!(h2.target.id_by_uuid);
        assert_eq!(h2.strategy.family(), OsFamily::Windows);

        let h1 = index.probe(&exp, "h1").unwrap();
        assert!(!h1.target.id_by_uuid);
        assert_eq!(h1.target.namespace, "demo");

        let err = index.probe(&exp, "h5").unwrap_err();
        assert_eq!(err.to_string(), "unknown OS type minirouter");
        assert!(matches!(index.probe(&exp, "nope"), Err(C2Error::VmNotFound(_))));
    }

    #[test]
    fn test_inactive_and_failed_are_one_way() {
        let mut index = Indices::build(&experiment());
        index.mark_inactive("h1");
        index.mark_failed_network("h2");
        assert!(!index.is_active("h1"));
        assert!(index.network_failed("h2"));
    }
}
