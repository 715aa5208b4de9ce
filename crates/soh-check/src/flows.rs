use crate::{HealthCheck, PacketCapture, SohError};
use serde::Deserialize;
use serde_json::Value;
use soh_c2::{C2Command, Expectation, Outcome, Verdict};
use soh_core::ELASTIC_SERVER_LABEL;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Script on the capture server that dumps flow records from Elasticsearch.
pub const QUERY_FLOWS_COMMAND: &str = "query-flows.sh";

#[derive(Deserialize)]
struct SearchResult {
    hits: Option<Hits>,
}

#[derive(Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: Value,
}

#[derive(Deserialize)]
struct FlowRecord {
    source: Endpoint,
    destination: Endpoint,
}

#[derive(Deserialize)]
struct Endpoint {
    ip: String,
    #[serde(default)]
    bytes: u64,
}

/// Turn a search result into a sorted host list and byte matrix.
///
/// `flows[i][j]` is the number of bytes `hosts[i]` sent to `hosts[j]`.
/// Returns `None` when the result holds no hits.
///
/// # Errors
/// Returns `SohError::Json` if the result or any hit is malformed.
pub fn parse_flows(response: &str) -> Result<Option<PacketCapture>, SohError> {
    let result: SearchResult = serde_json::from_str(response)?;

    let Some(hits) = result.hits.filter(|h| !h.hits.is_empty()) else {
        return Ok(None);
    };

    let mut raw: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();

    for hit in hits.hits {
        let flow: FlowRecord = serde_json::from_value(hit.source)?;
        let (src, dst) = (flow.source.ip, flow.destination.ip);

        *raw.entry(src.clone())
            .or_default()
            .entry(dst.clone())
            .or_default() += flow.source.bytes;
        *raw.entry(dst).or_default().entry(src).or_default() += flow.destination.bytes;
    }

    let hosts: Vec<String> = raw.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect();

    let flows = hosts
        .iter()
        .map(|s| {
            hosts
                .iter()
                .map(|d| raw.get(s).and_then(|row| row.get(d)).copied().unwrap_or(0))
                .collect()
        })
        .collect();

    Ok(Some(PacketCapture { hosts, flows }))
}

impl HealthCheck {
    /// The node serving flow data: the configured one, else the labelled one.
    fn flow_server(&self) -> Option<String> {
        if let Some(name) = &self.experiment.soh.elastic_server {
            return Some(name.clone());
        }

        self.experiment
            .find_labelled(ELASTIC_SERVER_LABEL)
            .map(|node| node.hostname.clone())
    }

    /// Pull traffic flows from the capture server into the packet capture.
    ///
    /// Failures are logged and never count as check errors.
    pub(crate) async fn collect_flows(&mut self) -> Result<(), SohError> {
        let Some(server) = self.flow_server() else {
            return Ok(());
        };

        if !self.index.is_active(&server) {
            warn!("Skipping traffic flows: C2 not active on {}", server);
            return Ok(());
        }

        info!("Querying {} for traffic flows", server);

        let probe = match self.index.probe(&self.experiment, &server) {
            Ok(probe) => probe,
            Err(e) => {
                warn!("error executing command '{}': {}", QUERY_FLOWS_COMMAND, e);
                return Ok(());
            }
        };

        let cmd = C2Command::exec(
            probe.target,
            QUERY_FLOWS_COMMAND,
            self.experiment.soh.c2_timeout,
        );
        let expectation = Expectation::both(|resp| Verdict::Done(resp.to_string()));

        let Outcome::Finished(results) = self.coordinator.execute(&cmd, vec![expectation]).await
        else {
            return Err(SohError::Cancelled);
        };

        let Some(result) = results.into_iter().next() else {
            return Ok(());
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("error executing command '{}': {}", QUERY_FLOWS_COMMAND, e);
                return Ok(());
            }
        };

        match parse_flows(&response) {
            Ok(Some(capture)) => self.packet_capture = Some(capture),
            Ok(None) => info!("no flow data found"),
            Err(e) => warn!("error parsing Elasticsearch results: {}", e),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Indices;
    use crate::orchestrator::tests::harness;
    use soh_c2::Reply;

    #[test]
    fn test_parse_flows_matrix() {
        let response = r#"{"hits":{"hits":[
            {"_source":{"source":{"ip":"10.0.0.2","bytes":100},"destination":{"ip":"10.0.0.1","bytes":40}}},
            {"_source":{"source":{"ip":"10.0.0.1","bytes":5},"destination":{"ip":"10.0.0.2","bytes":7}}}
        ]}}"#;

        let capture = parse_flows(response).unwrap().unwrap();
        assert_eq!(capture.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(capture.flows, vec![vec![0, 45], vec![107, 0]]);
    }

    #[test]
    fn test_no_hits() {
        assert!(parse_flows(r#"{"hits":{"hits":[]}}"#).unwrap().is_none());
        assert!(parse_flows("{}").unwrap().is_none());
        assert!(parse_flows("not json").is_err());
    }

    const WITH_SERVER: &str = r#"
experiment "flows" {
  node "h1" {
    interface "IF0" {
      vlan    = "DATA"
      address = "10.0.0.1"
    }
  }
  node "es" {
    labels = { "soh-elastic-server" = "true" }
  }
}
"#;

    const ONE_FLOW: &str = r#"{"hits":{"hits":[
        {"_source":{"source":{"ip":"10.0.0.1","bytes":10},"destination":{"ip":"10.0.0.9","bytes":20}}}
    ]}}"#;

    #[tokio::test]
    async fn test_flows_from_labelled_server() {
        let mut h = harness(WITH_SERVER);
        h.fake.add_active_vm("es", "u-es", &[]);
        h.fake
            .script("es", "cc exec query-flows.sh", vec![Reply::output(ONE_FLOW)]);

        h.check.index = Indices::build(&h.check.experiment);
        h.check.collect_flows().await.unwrap();

        let capture = h.check.packet_capture.as_ref().unwrap();
        assert_eq!(capture.hosts, vec!["10.0.0.1", "10.0.0.9"]);
        assert_eq!(capture.flows, vec![vec![0, 10], vec![20, 0]]);
        assert_eq!(h.check.error_count, 0);
    }

    #[tokio::test]
    async fn test_flow_failures_are_not_counted() {
        let mut h = harness(WITH_SERVER);
        h.fake.add_active_vm("es", "u-es", &[]);
        h.fake
            .script("es", "cc exec query-flows.sh", vec![Reply::output("<html>")]);

        h.check.index = Indices::build(&h.check.experiment);
        h.check.collect_flows().await.unwrap();
        assert!(h.check.packet_capture.is_none());

        h.fake.deactivate("es");
        h.check.collect_flows().await.unwrap();
        assert!(h.check.packet_capture.is_none());
        assert_eq!(h.check.error_count, 0);
    }

    #[tokio::test]
    async fn test_inactive_or_skipped_server_gets_no_command() {
        let mut h = harness(WITH_SERVER);
        h.fake.add_active_vm("es", "u-es", &[]);
        h.fake
            .script("es", "cc exec query-flows.sh", vec![Reply::output(ONE_FLOW)]);

        h.check.index = Indices::build(&h.check.experiment);
        h.check.index.mark_inactive("es");
        h.check.collect_flows().await.unwrap();

        assert_eq!(h.fake.issue_count("es"), 0);
        assert!(h.check.packet_capture.is_none());

        h.check.experiment.soh.skip_hosts = vec!["es".into()];
        h.check.index = Indices::build(&h.check.experiment);
        h.check.collect_flows().await.unwrap();

        assert_eq!(h.fake.issue_count("es"), 0);
        assert!(h.check.packet_capture.is_none());
    }

    #[tokio::test]
    async fn test_initial_run_skips_flows() {
        let mut h = harness(WITH_SERVER);
        h.check.experiment.soh.skip_network_config = true;
        h.fake.add_active_vm("h1", "u-1", &[]);
        h.fake.add_active_vm("es", "u-es", &[]);
        h.fake
            .script("es", "cc exec query-flows.sh", vec![Reply::output(ONE_FLOW)]);

        h.check.run_checks(true).await.unwrap();
        assert!(h.fake.issued().iter().all(|(_, a)| a != "cc exec query-flows.sh"));

        h.check.run_checks(false).await.unwrap();
        assert!(h.check.packet_capture.is_some());
        let last = h.store.history().pop().unwrap();
        assert_eq!(last["packetCapture"]["hosts"][1], "10.0.0.9");
    }
}
