use crate::extract::{
    block_label, expr_to_json, extract_bool, extract_optional_attr_string, extract_string,
    extract_string_map, extract_u8,
};
use crate::config::parse_soh_block;
use crate::{CoreError, OsFamily, SohConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// An experiment topology together with its apps and state-of-health settings.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: String,
    pub namespace: String,
    pub nodes: Vec<Node>,
    pub apps: Vec<App>,
    pub soh: SohConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub node_type: String,
    pub os_type: String,
    pub image: Option<String>,
    pub do_not_boot: bool,
    pub labels: HashMap<String, String>,
    pub interfaces: Vec<Interface>,
}

impl Node {
    #[must_use]
    pub fn is_virtual_machine(&self) -> bool {
        self.node_type.eq_ignore_ascii_case("VirtualMachine")
    }

    #[must_use]
    pub fn boots(&self) -> bool {
        !self.do_not_boot
    }

    #[must_use]
    pub fn os_family(&self) -> Option<OsFamily> {
        OsFamily::from_os_type(&self.os_type)
    }

    /// File name of the node's first drive image, if it has one.
    #[must_use]
    pub fn image_file_name(&self) -> Option<&str> {
        self.image
            .as_deref()
            .and_then(|image| Path::new(image).file_name())
            .and_then(|name| name.to_str())
    }

    #[must_use]
    pub fn has_label(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    #[default]
    Ethernet,
    Serial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressProto {
    #[default]
    Static,
    Dhcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    pub vlan: String,
    pub address: String,
    pub mask: u8,
    pub gateway: Option<String>,
    pub proto: AddressProto,
}

impl Interface {
    #[must_use]
    pub fn is_management(&self) -> bool {
        self.vlan.eq_ignore_ascii_case("MGMT")
    }

    #[must_use]
    pub fn is_serial(&self) -> bool {
        self.kind == InterfaceKind::Serial
    }

    #[must_use]
    pub fn is_dhcp(&self) -> bool {
        self.proto == AddressProto::Dhcp
    }

    /// `address/mask` as it shows up in `ip addr` output.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.mask)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub hosts: Vec<AppHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppHost {
    pub hostname: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Experiment {
    /// Parse an experiment from an HCL file path.
    ///
    /// # Errors
    /// Returns `CoreError` if the file cannot be read or the contents cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse an experiment from an HCL string.
    ///
    /// # Errors
    /// Returns `CoreError` if the HCL is invalid or required fields are missing.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let body: hcl::Body =
            hcl::from_str(content).map_err(|e| CoreError::HclParse(e.to_string()))?;

        let Some(block) = body
            .blocks()
            .find(|b| b.identifier.as_str() == "experiment")
        else {
            return Err(CoreError::InvalidExperiment(
                "No experiment block found".into(),
            ));
        };

        let name = block_label(block, 0, "experiment name")?;
        let namespace =
            extract_optional_attr_string(block, "namespace")?.unwrap_or_else(|| name.clone());

        let mut nodes = Vec::new();
        let mut apps = Vec::new();
        let mut soh = SohConfig::default();

        for inner_block in block.body.blocks() {
            match inner_block.identifier.as_str() {
                "node" => nodes.push(parse_node(inner_block)?),
                "app" => apps.push(parse_app(inner_block)?),
                "soh" => soh = parse_soh_block(inner_block)?,
                _ => {}
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.hostname.as_str()) {
                return Err(CoreError::InvalidExperiment(format!(
                    "Duplicate node '{}'",
                    node.hostname
                )));
            }
        }

        Ok(Experiment {
            name,
            namespace,
            nodes,
            apps,
            soh,
        })
    }

    #[must_use]
    pub fn find_node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    /// First node carrying the given label key.
    #[must_use]
    pub fn find_labelled(&self, label: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.has_label(label))
    }
}

fn parse_node(block: &hcl::Block) -> Result<Node, CoreError> {
    let hostname = block_label(block, 0, "node hostname")?;

    let mut node_type = "VirtualMachine".to_string();
    let mut os_type = "linux".to_string();
    let mut image = None;
    let mut do_not_boot = false;
    let mut labels = HashMap::new();
    let mut interfaces = Vec::new();

    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "type" => node_type = extract_string(&attr.expr)?,
            "os_type" => os_type = extract_string(&attr.expr)?,
            "image" => image = Some(extract_string(&attr.expr)?),
            "do_not_boot" => do_not_boot = extract_bool(&attr.expr)?,
            "labels" => labels = extract_string_map(&attr.expr)?,
            _ => {}
        }
    }

    for inner_block in block.body.blocks() {
        if inner_block.identifier.as_str() == "interface" {
            interfaces.push(parse_interface(&hostname, inner_block)?);
        }
    }

    Ok(Node {
        hostname,
        node_type,
        os_type,
        image,
        do_not_boot,
        labels,
        interfaces,
    })
}

fn parse_interface(hostname: &str, block: &hcl::Block) -> Result<Interface, CoreError> {
    let name = block_label(block, 0, "interface name")?;

    let mut kind = InterfaceKind::Ethernet;
    let mut vlan = String::new();
    let mut address = String::new();
    let mut mask = 24;
    let mut gateway = None;
    let mut proto = AddressProto::Static;

    for attr in block.body.attributes() {
        match attr.key.as_str() {
            "type" => {
                kind = match extract_string(&attr.expr)?.to_ascii_lowercase().as_str() {
                    "ethernet" => InterfaceKind::Ethernet,
                    "serial" => InterfaceKind::Serial,
                    other => {
                        return Err(CoreError::InvalidExperiment(format!(
                            "Interface '{name}' on '{hostname}' has unknown type '{other}'"
                        )));
                    }
                };
            }
            "vlan" => vlan = extract_string(&attr.expr)?,
            "address" => address = extract_string(&attr.expr)?,
            "mask" => mask = extract_u8(&attr.expr)?,
            "gateway" => {
                let gw = extract_string(&attr.expr)?;
                if !gw.is_empty() {
                    gateway = Some(gw);
                }
            }
            "proto" => {
                proto = match extract_string(&attr.expr)?.to_ascii_lowercase().as_str() {
                    "static" => AddressProto::Static,
                    "dhcp" => AddressProto::Dhcp,
                    other => {
                        return Err(CoreError::InvalidExperiment(format!(
                            "Interface '{name}' on '{hostname}' proto must be 'static' or 'dhcp', got '{other}'"
                        )));
                    }
                };
            }
            _ => {}
        }
    }

    if proto == AddressProto::Static && kind == InterfaceKind::Ethernet && address.is_empty() {
        return Err(CoreError::InvalidExperiment(format!(
            "Static interface '{name}' on '{hostname}' missing address"
        )));
    }

    Ok(Interface {
        name,
        kind,
        vlan,
        address,
        mask,
        gateway,
        proto,
    })
}

fn parse_app(block: &hcl::Block) -> Result<App, CoreError> {
    let name = block_label(block, 0, "app name")?;
    let mut hosts = Vec::new();

    for inner_block in block.body.blocks() {
        if inner_block.identifier.as_str() != "host" {
            continue;
        }

        let hostname = block_label(inner_block, 0, "app host name")?;
        let mut metadata = HashMap::new();
        for attr in inner_block.body.attributes() {
            metadata.insert(attr.key.as_str().to_string(), expr_to_json(&attr.expr)?);
        }

        hosts.push(AppHost { hostname, metadata });
    }

    Ok(App { name, hosts })
}
