use crate::CoreError;
use crate::extract::{
    block_label, extract_bool, extract_duration, extract_optional_attr_string,
    extract_required_attr_string, extract_string, extract_string_array, extract_string_list_map,
    extract_string_or_array, extract_u16, find_attr, parse_duration,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const DEFAULT_C2_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROFILE_KEY: &str = "sohProfile";
pub const ELASTIC_SERVER_LABEL: &str = "soh-elastic-server";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityMode {
    #[default]
    Off,
    Sample,
    Full,
}

impl ReachabilityMode {
    fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.to_ascii_lowercase().as_str() {
            "" | "off" => Ok(Self::Off),
            "sample" => Ok(Self::Sample),
            "full" => Ok(Self::Full),
            other => Err(CoreError::InvalidConfig(format!(
                "reachability must be 'off', 'sample' or 'full', got '{other}'"
            ))),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ReachabilityMode::Off => "off",
            ReachabilityMode::Sample => "sample",
            ReachabilityMode::Full => "full",
        }
    }
}

/// An explicitly configured connection test between two hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomReachability {
    pub src: String,
    /// Either a literal address or `host|interface`.
    pub dst: String,
    pub proto: String,
    pub port: u16,
    pub wait: Option<String>,
    pub udp_packet_base64: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomHostTest {
    pub name: String,
    pub test_script: String,
    pub executor: Option<String>,
    pub test_stdout: Option<String>,
    pub test_stderr: Option<String>,
    pub validate_stdout: Option<String>,
    pub validate_stderr: Option<String>,
}

impl CustomHostTest {
    #[must_use]
    pub fn has_checks(&self) -> bool {
        [
            &self.test_stdout,
            &self.test_stderr,
            &self.validate_stdout,
            &self.validate_stderr,
        ]
        .iter()
        .any(|check| check.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone)]
pub struct SohConfig {
    pub c2_timeout: Duration,
    pub dhcp_timeout: Duration,
    pub exit_on_error: bool,
    pub reachability: ReachabilityMode,
    pub skip_network_config: bool,
    pub skip_hosts: Vec<String>,
    pub uuid_hosts: BTreeSet<String>,
    pub app_profile_key: String,
    pub host_processes: BTreeMap<String, Vec<String>>,
    pub host_listeners: BTreeMap<String, Vec<String>>,
    pub custom_reachability: Vec<CustomReachability>,
    pub custom_host_tests: BTreeMap<String, Vec<CustomHostTest>>,
    pub elastic_server: Option<String>,
}

impl Default for SohConfig {
    fn default() -> Self {
        Self {
            c2_timeout: DEFAULT_C2_TIMEOUT,
            dhcp_timeout: DEFAULT_DHCP_TIMEOUT,
            exit_on_error: false,
            reachability: ReachabilityMode::Off,
            skip_network_config: false,
            skip_hosts: Vec::new(),
            uuid_hosts: BTreeSet::new(),
            app_profile_key: DEFAULT_PROFILE_KEY.to_string(),
            host_processes: BTreeMap::new(),
            host_listeners: BTreeMap::new(),
            custom_reachability: Vec::new(),
            custom_host_tests: BTreeMap::new(),
            elastic_server: None,
        }
    }
}

impl SohConfig {
    /// Apply the defaulting rules that depend on more than one setting.
    pub fn normalize(&mut self) {
        if self.skip_network_config {
            self.reachability = ReachabilityMode::Off;
        }

        if self.app_profile_key.is_empty() {
            self.app_profile_key = DEFAULT_PROFILE_KEY.to_string();
        }
    }

    /// Whether liveness for `host` is checked by VM UUID rather than hostname.
    #[must_use]
    pub fn use_uuid_for_c2(&self, host: &str) -> bool {
        self.uuid_hosts.contains("all") || self.uuid_hosts.contains(host)
    }

    /// Whether a node is excluded from state-of-health checks.
    ///
    /// Entries ending in `.qc2` or `.qcow2` match against the node's image file name;
    /// everything else matches the hostname.
    #[must_use]
    pub fn skips(&self, hostname: &str, image_file_name: Option<&str>) -> bool {
        self.skip_hosts.iter().any(|entry| {
            let is_image = entry.ends_with(".qc2") || entry.ends_with(".qcow2");
            (is_image && image_file_name == Some(entry.as_str())) || entry == hostname
        })
    }
}

/// Per-host settings carried in app metadata under the profile key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SohProfile {
    #[serde(deserialize_with = "string_list")]
    pub processes: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub listeners: Vec<String>,
    pub custom_tests: Vec<CustomHostTest>,
    pub c2_timeout: Option<String>,
}

impl SohProfile {
    /// Decode a profile from app host metadata.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidConfig` if the metadata does not have the profile shape.
    pub fn from_metadata(value: &serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::InvalidConfig(format!("invalid profile: {e}")))
    }

    /// C2 timeout for probes derived from this profile.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidConfig` if `c2Timeout` is not a valid duration.
    pub fn timeout(&self) -> Result<Duration, CoreError> {
        match self.c2_timeout.as_deref() {
            None | Some("") => Ok(DEFAULT_C2_TIMEOUT),
            Some(raw) => parse_duration(raw),
        }
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Num(serde_json::Number),
    }

    let values = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            Scalar::Str(s) => s,
            Scalar::Num(n) => n.to_string(),
        })
        .collect())
}

pub(crate) fn parse_soh_block(block: &hcl::Block) -> Result<SohConfig, CoreError> {
    let mut config = SohConfig::default();

    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "c2_timeout" => config.c2_timeout = extract_duration(&attr.expr)?,
            "dhcp_timeout" => config.dhcp_timeout = extract_duration(&attr.expr)?,
            "exit_on_error" => config.exit_on_error = extract_bool(&attr.expr)?,
            "reachability" => {
                config.reachability = ReachabilityMode::parse(&extract_string(&attr.expr)?)?;
            }
            "skip_network_config" => config.skip_network_config = extract_bool(&attr.expr)?,
            "skip_hosts" => config.skip_hosts = extract_string_array(&attr.expr)?,
            "hosts_use_uuid_for_c2" => {
                config.uuid_hosts = extract_string_or_array(&attr.expr)
                    .map_err(|_| {
                        CoreError::InvalidConfig(
                            "hosts_use_uuid_for_c2 must be a string or a list of strings".into(),
                        )
                    })?
                    .into_iter()
                    .collect();
            }
            "app_profile_key" => config.app_profile_key = extract_string(&attr.expr)?,
            "host_processes" => config.host_processes = extract_string_list_map(&attr.expr)?,
            "host_listeners" => config.host_listeners = extract_string_list_map(&attr.expr)?,
            _ => {}
        }
    }

    for inner_block in block.body.blocks() {
        match inner_block.identifier.as_str() {
            "custom_reachability" => {
                config
                    .custom_reachability
                    .push(parse_custom_reachability(inner_block)?);
            }
            "host_custom_test" => {
                let host = block_label(inner_block, 0, "custom test host")?;
                let test = parse_custom_host_test(inner_block)?;
                config.custom_host_tests.entry(host).or_default().push(test);
            }
            "packet_capture" => {
                config.elastic_server =
                    extract_optional_attr_string(inner_block, "elastic_server")?;
            }
            _ => {}
        }
    }

    config.normalize();
    Ok(config)
}

fn parse_custom_reachability(block: &hcl::Block) -> Result<CustomReachability, CoreError> {
    let src = extract_required_attr_string(block, "src")?;
    let dst = extract_required_attr_string(block, "dst")?;
    let proto = extract_required_attr_string(block, "proto")?.to_ascii_lowercase();

    if proto != "tcp" && proto != "udp" {
        return Err(CoreError::InvalidConfig(format!(
            "custom_reachability proto must be 'tcp' or 'udp', got '{proto}'"
        )));
    }

    let port = find_attr(block, "port")
        .map(extract_u16)
        .transpose()?
        .ok_or_else(|| {
            CoreError::InvalidConfig("custom_reachability block missing 'port'".into())
        })?;

    Ok(CustomReachability {
        src,
        dst,
        proto,
        port,
        wait: extract_optional_attr_string(block, "wait")?,
        udp_packet_base64: extract_optional_attr_string(block, "udp_packet_base64")?,
    })
}

fn parse_custom_host_test(block: &hcl::Block) -> Result<CustomHostTest, CoreError> {
    let name = block_label(block, 1, "custom test name")?;

    Ok(CustomHostTest {
        name,
        test_script: extract_optional_attr_string(block, "test_script")?.unwrap_or_default(),
        executor: extract_optional_attr_string(block, "executor")?,
        test_stdout: extract_optional_attr_string(block, "test_stdout")?,
        test_stderr: extract_optional_attr_string(block, "test_stderr")?,
        validate_stdout: extract_optional_attr_string(block, "validate_stdout")?,
        validate_stderr: extract_optional_attr_string(block, "validate_stderr")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Experiment;

    fn soh(body: &str) -> SohConfig {
        let hcl = format!("experiment \"t\" {{\n  soh {{\n{body}\n  }}\n}}\n");
        Experiment::parse(&hcl).unwrap().soh
    }

    #[test]
    fn test_defaults() {
        let config = soh("");
        assert_eq!(config.c2_timeout, Duration::from_secs(300));
        assert_eq!(config.dhcp_timeout, Duration::from_secs(300));
        assert_eq!(config.reachability, ReachabilityMode::Off);
        assert_eq!(config.app_profile_key, "sohProfile");
        assert!(!config.exit_on_error);
        assert!(config.uuid_hosts.is_empty());
    }

    #[test]
    fn test_skip_network_config_forces_reachability_off() {
        let config = soh(
            r#"
    reachability        = "sample"
    skip_network_config = true
"#,
        );
        assert_eq!(config.reachability, ReachabilityMode::Off);
    }

    #[test]
    fn test_uuid_hosts_string_or_list() {
        let single = soh(r#"    hosts_use_uuid_for_c2 = "h1""#);
        assert!(single.use_uuid_for_c2("h1"));
        assert!(!single.use_uuid_for_c2("h2"));

        let list = soh(r#"    hosts_use_uuid_for_c2 = ["h1", "h2"]"#);
        assert!(list.use_uuid_for_c2("h2"));

        let all = soh(r#"    hosts_use_uuid_for_c2 = ["all"]"#);
        assert!(all.use_uuid_for_c2("anything"));
    }

    #[test]
    fn test_skip_rules() {
        let config = soh(r#"    skip_hosts = ["h3", "router.qc2"]"#);
        assert!(config.skips("h3", None));
        assert!(config.skips("r1", Some("router.qc2")));
        assert!(!config.skips("h1", Some("ubuntu.qcow2")));
        assert!(!config.skips("h1", None));
    }

    #[test]
    fn test_full_block() {
        let config = soh(
            r#"
    c2_timeout      = "30s"
    exit_on_error   = true
    reachability    = "FULL"
    host_processes  = { h1 = ["sshd", "cron"] }
    host_listeners  = { h1 = [22] }

    custom_reachability {
      src   = "h1"
      dst   = "h2|IF0"
      proto = "UDP"
      port  = 53
      wait  = "2s"
      udp_packet_base64 = "aGVsbG8="
    }

    host_custom_test "h1" "web up" {
      test_script = "curl -s localhost"
      test_stdout = "ok"
    }

    packet_capture {
      elastic_server = "soh-elastic"
    }
"#,
        );
        assert_eq!(config.c2_timeout, Duration::from_secs(30));
        assert!(config.exit_on_error);
        assert_eq!(config.reachability, ReachabilityMode::Full);
        assert_eq!(config.host_processes["h1"], vec!["sshd", "cron"]);
        assert_eq!(config.host_listeners["h1"], vec!["22"]);

        let reach = &config.custom_reachability[0];
        assert_eq!(reach.proto, "udp");
        assert_eq!(reach.port, 53);
        assert_eq!(reach.wait.as_deref(), Some("2s"));

        let test = &config.custom_host_tests["h1"][0];
        assert_eq!(test.name, "web up");
        assert!(test.has_checks());
        assert_eq!(config.elastic_server.as_deref(), Some("soh-elastic"));
    }

    #[test]
    fn test_invalid_reachability_mode() {
        let hcl = "experiment \"t\" {\n  soh {\n    reachability = \"most\"\n  }\n}\n";
        let err = Experiment::parse(hcl).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_invalid_duration() {
        let hcl = "experiment \"t\" {\n  soh {\n    c2_timeout = \"soon\"\n  }\n}\n";
        let err = Experiment::parse(hcl).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_profile_from_metadata() {
        let value = serde_json::json!({
            "processes": ["nginx"],
            "listeners": [80, "443"],
            "customTests": [{"name": "t1", "testScript": "echo hi", "testStdout": "hi"}],
            "c2Timeout": "2m",
        });
        let profile = SohProfile::from_metadata(&value).unwrap();
        assert_eq!(profile.processes, vec!["nginx"]);
        assert_eq!(profile.listeners, vec!["80", "443"]);
        assert_eq!(profile.custom_tests[0].test_script, "echo hi");
        assert_eq!(profile.timeout().unwrap(), Duration::from_secs(120));

        let empty = SohProfile::from_metadata(&serde_json::json!({})).unwrap();
        assert_eq!(empty.timeout().unwrap(), DEFAULT_C2_TIMEOUT);

        assert!(SohProfile::from_metadata(&serde_json::json!({"processes": "nginx"})).is_err());
    }
}
