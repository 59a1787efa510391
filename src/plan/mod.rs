//! Cluster plan model
//!
//! A plan is the declarative description of a cluster: its identity, networking,
//! certificate and SSH settings, and the five node groups. Plans live on disk as
//! YAML and are immutable for the duration of a run; mutations such as adding a
//! node produce a new plan via [`Plan::with_node`].

mod validate;

pub use validate::{validate, ValidationReport, Violation};
pub(crate) use validate::is_valid_cluster_name;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::storage::{ClusterState, ClusterStatus};

/// Errors raised while loading or saving a plan file.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No file exists at the given path
    #[error("plan file not found at {}", path.display())]
    NotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// The file exists but could not be read or written
    #[error("I/O error on plan file {}: {source}", path.display())]
    Io {
        /// Plan file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The file content is not a well-formed plan
    #[error("malformed plan file {}: {source}", path.display())]
    Parse {
        /// Plan file path
        path: PathBuf,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// The plan could not be rendered as YAML
    #[error("failed to serialize plan: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// Result type for plan I/O.
pub type Result<T> = std::result::Result<T, PlanError>;

/// Role partition a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// etcd key-value store members
    Etcd,
    /// Control plane nodes
    Master,
    /// Workload nodes
    Worker,
    /// Ingress controller nodes
    Ingress,
    /// Storage nodes
    Storage,
}

impl NodeRole {
    /// All roles, in plan order.
    pub const ALL: [NodeRole; 5] = [
        NodeRole::Etcd,
        NodeRole::Master,
        NodeRole::Worker,
        NodeRole::Ingress,
        NodeRole::Storage,
    ];

    /// Group name as it appears in the plan file and inventories.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Etcd => "etcd",
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
            NodeRole::Ingress => "ingress",
            NodeRole::Storage => "storage",
        }
    }

    /// Whether a node can join an existing cluster with this role.
    pub fn can_be_added(self) -> bool {
        matches!(self, NodeRole::Worker | NodeRole::Ingress | NodeRole::Storage)
    }

    /// Whether the group must contain at least one node.
    pub fn is_required(self) -> bool {
        matches!(self, NodeRole::Etcd | NodeRole::Master | NodeRole::Worker)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(NodeRole::Etcd),
            "master" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            "ingress" => Ok(NodeRole::Ingress),
            "storage" => Ok(NodeRole::Storage),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// A single machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Host name, unique across the plan
    pub host: String,
    /// Publicly reachable address used for SSH
    pub ip: String,
    /// Cluster-internal address, defaults to `ip` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internalip: String,
    /// Kubernetes node labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    /// Create a node without labels.
    pub fn new(host: impl Into<String>, ip: impl Into<String>, internalip: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ip: ip.into(),
            internalip: internalip.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Attach labels, replacing any existing ones.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Address used inside the cluster.
    pub fn internal_ip(&self) -> &str {
        if self.internalip.is_empty() {
            &self.ip
        } else {
            &self.internalip
        }
    }

    /// Two entries describe the same machine.
    pub fn same_machine(&self, other: &Node) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.ip == other.ip
            && self.internal_ip() == other.internal_ip()
    }
}

/// A role partition with its expected size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Number of nodes the group must contain
    #[serde(default)]
    pub expected_count: usize,
    /// Ordered member list
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Master group, which additionally carries the API load balancer names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterNodeGroup {
    /// Members and expected count
    #[serde(flatten)]
    pub group: NodeGroup,
    /// FQDN fronting the API servers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balanced_fqdn: String,
    /// Short name fronting the API servers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balanced_short_name: String,
}

/// Pod and service networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Networking {
    /// `overlay` or `routed`
    #[serde(rename = "type", default)]
    pub network_type: String,
    /// CIDR block for pod addresses
    #[serde(default)]
    pub pod_cidr_block: String,
    /// CIDR block for service addresses
    #[serde(default)]
    pub service_cidr_block: String,
    /// Skip CNI installation entirely
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_cni: bool,
}

/// Certificate settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificates {
    /// Validity, as `<n>h` or `<n>d`
    #[serde(default)]
    pub expiry: String,
    /// Subject locality
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location_city: String,
    /// Subject state or province
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location_state: String,
    /// Subject country
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location_country: String,
}

impl Certificates {
    /// Parsed certificate validity.
    pub fn validity(&self) -> Option<chrono::Duration> {
        parse_expiry(&self.expiry)
    }
}

/// Parse `17520h` / `730d` style durations.
pub fn parse_expiry(value: &str) -> Option<chrono::Duration> {
    let value = value.trim();
    let positive = |digits: &str| digits.parse::<i64>().ok().filter(|n| *n > 0);
    if let Some(hours) = value.strip_suffix('h') {
        chrono::Duration::try_hours(positive(hours)?)
    } else if let Some(days) = value.strip_suffix('d') {
        chrono::Duration::try_days(positive(days)?)
    } else {
        None
    }
}

/// SSH access to the nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssh {
    /// Remote user with sudo rights
    #[serde(default)]
    pub user: String,
    /// Private key path
    #[serde(default)]
    pub ssh_key: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// Cluster-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name, also the directory name under the assets root
    #[serde(default)]
    pub name: String,
    /// Networking configuration
    #[serde(default)]
    pub networking: Networking,
    /// Certificate configuration
    #[serde(default)]
    pub certificates: Certificates,
    /// SSH configuration
    #[serde(default)]
    pub ssh: Ssh,
}

/// An NFS export made available to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsVolume {
    /// Server exporting the volume
    #[serde(default)]
    pub nfs_host: String,
    /// Exported path
    #[serde(default)]
    pub mount_path: String,
}

/// NFS volume declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nfs {
    /// Declared volumes
    #[serde(rename = "nfs_volume", default)]
    pub volumes: Vec<NfsVolume>,
}

/// The full cluster plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Cluster-wide settings
    pub cluster: Cluster,
    /// etcd group
    #[serde(default)]
    pub etcd: NodeGroup,
    /// Master group
    #[serde(default)]
    pub master: MasterNodeGroup,
    /// Worker group
    #[serde(default)]
    pub worker: NodeGroup,
    /// Ingress group
    #[serde(default)]
    pub ingress: NodeGroup,
    /// Storage group
    #[serde(default)]
    pub storage: NodeGroup,
    /// NFS volumes
    #[serde(default)]
    pub nfs: Nfs,
}

impl Plan {
    /// Whether a plan file exists at `path`, without parsing it.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().is_file()
    }

    /// Read and parse a plan file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PlanError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a plan from YAML text.
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Render the plan as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(PlanError::Serialize)
    }

    /// Write the plan atomically: a sibling temp file is written, then renamed.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        };

        let body = self.to_yaml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "plan.yaml".to_string());
        let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    /// Structural equality, independent of how either plan was formatted on disk.
    ///
    /// A node without an internal address equals one whose internal address
    /// repeats its public address.
    pub fn equal(a: &Plan, b: &Plan) -> bool {
        a.normalized() == b.normalized()
    }

    fn normalized(&self) -> Plan {
        let mut plan = self.clone();
        for role in NodeRole::ALL {
            for node in &mut plan.group_mut(role).nodes {
                node.internalip = node.internal_ip().to_string();
            }
        }
        plan
    }

    /// Validate every invariant and return all violations found.
    pub fn validate(&self) -> ValidationReport {
        validate(self)
    }

    /// Snapshot this plan as a cluster status record in the `planned` state.
    pub fn to_status(&self) -> ClusterStatus {
        ClusterStatus {
            name: self.cluster.name.clone(),
            desired_state: ClusterState::Installed,
            current_state: ClusterState::Planned,
            plan_fingerprint: self.fingerprint(),
            spec: self.clone(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// BLAKE3 hash over the canonical JSON encoding of the plan.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// The group backing `role`.
    pub fn group(&self, role: NodeRole) -> &NodeGroup {
        match role {
            NodeRole::Etcd => &self.etcd,
            NodeRole::Master => &self.master.group,
            NodeRole::Worker => &self.worker,
            NodeRole::Ingress => &self.ingress,
            NodeRole::Storage => &self.storage,
        }
    }

    fn group_mut(&mut self, role: NodeRole) -> &mut NodeGroup {
        match role {
            NodeRole::Etcd => &mut self.etcd,
            NodeRole::Master => &mut self.master.group,
            NodeRole::Worker => &mut self.worker,
            NodeRole::Ingress => &mut self.ingress,
            NodeRole::Storage => &mut self.storage,
        }
    }

    /// Distinct machines across all groups, in first-seen order.
    pub fn all_nodes(&self) -> Vec<&Node> {
        let mut seen = HashSet::new();
        NodeRole::ALL
            .iter()
            .flat_map(|role| self.group(*role).nodes.iter())
            .filter(|node| seen.insert(node.host.to_ascii_lowercase()))
            .collect()
    }

    /// Whether any group already lists `host`.
    pub fn contains_host(&self, host: &str) -> bool {
        NodeRole::ALL.iter().any(|role| {
            self.group(*role)
                .nodes
                .iter()
                .any(|n| n.host.eq_ignore_ascii_case(host))
        })
    }

    /// Roles held by `host`.
    pub fn roles_of(&self, host: &str) -> Vec<NodeRole> {
        NodeRole::ALL
            .iter()
            .copied()
            .filter(|role| {
                self.group(*role)
                    .nodes
                    .iter()
                    .any(|n| n.host.eq_ignore_ascii_case(host))
            })
            .collect()
    }

    /// Total node entries, counting a multi-role machine once per group.
    pub fn node_entries(&self) -> usize {
        NodeRole::ALL
            .iter()
            .map(|role| self.group(*role).nodes.len())
            .sum()
    }

    /// Whether pod networking is installed, which gates the smoke test.
    pub fn network_configured(&self) -> bool {
        !self.cluster.networking.disable_cni
    }

    /// First master, used as the vantage point for remote verification.
    pub fn first_master(&self) -> Option<&Node> {
        self.master.group.nodes.first()
    }

    /// Address clients use to reach the API server.
    pub fn api_server_host(&self) -> Option<&str> {
        if !self.master.load_balanced_fqdn.is_empty() {
            return Some(&self.master.load_balanced_fqdn);
        }
        self.first_master().map(|n| n.ip.as_str())
    }

    /// A copy of this plan with `node` appended to each of `roles`.
    pub fn with_node(&self, node: &Node, roles: &[NodeRole]) -> Plan {
        let mut plan = self.clone();
        let mut applied = HashSet::new();
        for role in roles {
            if !applied.insert(*role) {
                continue;
            }
            let group = plan.group_mut(*role);
            group.nodes.push(node.clone());
            group.expected_count += 1;
        }
        plan
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) const SAMPLE_PLAN: &str = r#"
cluster:
  name: test-cluster
  networking:
    type: overlay
    pod_cidr_block: 172.16.0.0/16
    service_cidr_block: 172.20.0.0/16
  certificates:
    expiry: 17520h
    location_city: Troy
    location_state: New York
    location_country: US
  ssh:
    user: ubuntu
    ssh_key: /home/ubuntu/.ssh/cluster.pem
    ssh_port: 22
etcd:
  expected_count: 1
  nodes:
    - host: etcd01
      ip: 10.0.0.1
      internalip: 192.168.0.1
master:
  expected_count: 1
  nodes:
    - host: master01
      ip: 10.0.0.2
      internalip: 192.168.0.2
  load_balanced_fqdn: master01.example.com
  load_balanced_short_name: master01
worker:
  expected_count: 1
  nodes:
    - host: worker01
      ip: 10.0.0.3
      internalip: 192.168.0.3
ingress:
  expected_count: 0
  nodes: []
storage:
  expected_count: 0
  nodes: []
"#;

    pub(crate) fn sample_plan() -> Plan {
        Plan::from_yaml(SAMPLE_PLAN).expect("sample plan parses")
    }

    #[test]
    fn test_read_missing_plan_is_not_found() {
        let dir = tempdir().unwrap();
        let err = Plan::read(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, PlanError::NotFound { .. }));
        assert!(!Plan::exists(dir.path().join("missing.yaml")));
    }

    #[test]
    fn test_read_malformed_plan_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(&path, "cluster: [this, is, not, a, map").unwrap();

        let err = Plan::read(&path).unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn test_write_then_read_is_structurally_equal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/plan.yaml");
        let plan = sample_plan().with_node(
            &Node::new("worker02", "10.0.0.4", "").with_labels(BTreeMap::from([(
                "zone".to_string(),
                "a".to_string(),
            )])),
            &[NodeRole::Worker],
        );

        plan.write(&path).unwrap();
        let loaded = Plan::read(&path).unwrap();
        assert!(Plan::equal(&plan, &loaded));
    }

    #[test]
    fn test_equal_ignores_formatting_and_key_order() {
        let reordered = r#"
worker: {nodes: [{internalip: 192.168.0.3, ip: 10.0.0.3, host: worker01}], expected_count: 1}
master:
  load_balanced_short_name: master01
  load_balanced_fqdn: master01.example.com
  nodes: [{host: master01, ip: 10.0.0.2, internalip: 192.168.0.2}]
  expected_count: 1
etcd: {expected_count: 1, nodes: [{host: etcd01, ip: 10.0.0.1, internalip: 192.168.0.1}]}
cluster:
  ssh: {ssh_port: 22, ssh_key: /home/ubuntu/.ssh/cluster.pem, user: ubuntu}
  certificates: {location_country: US, location_state: New York, location_city: Troy, expiry: 17520h}
  networking: {service_cidr_block: 172.20.0.0/16, pod_cidr_block: 172.16.0.0/16, type: overlay}
  name: test-cluster
"#;
        let a = sample_plan();
        let b = Plan::from_yaml(reordered).unwrap();
        assert!(Plan::equal(&a, &b));

        let mut c = b.clone();
        c.worker.nodes[0].ip = "10.0.0.99".to_string();
        assert!(!Plan::equal(&a, &c));
    }

    #[test]
    fn test_with_node_extends_each_role_once() {
        let plan = sample_plan();
        let node = Node::new("node05", "10.0.0.5", "192.168.0.5");
        let extended = plan.with_node(&node, &[NodeRole::Worker, NodeRole::Ingress, NodeRole::Worker]);

        assert_eq!(extended.worker.expected_count, 2);
        assert_eq!(extended.ingress.expected_count, 1);
        assert_eq!(extended.roles_of("node05"), vec![NodeRole::Worker, NodeRole::Ingress]);
        assert!(!plan.contains_host("node05"));
        assert!(extended.validate().is_valid());
    }

    #[test]
    fn test_all_nodes_deduplicates_multi_role_hosts() {
        let mut plan = sample_plan();
        let master = plan.master.group.nodes[0].clone();
        plan.worker.nodes.push(master);
        plan.worker.expected_count = 2;

        let hosts: Vec<&str> = plan.all_nodes().iter().map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["etcd01", "master01", "worker01"]);
        assert_eq!(plan.node_entries(), 4);
    }

    #[test]
    fn test_parse_expiry_units() {
        assert_eq!(parse_expiry("17520h"), chrono::Duration::try_hours(17520));
        assert_eq!(parse_expiry("30d"), chrono::Duration::try_days(30));
        assert_eq!(parse_expiry("0h"), None);
        assert_eq!(parse_expiry("10y"), None);
        assert_eq!(parse_expiry(""), None);
        assert_eq!(parse_expiry("17520é"), None);
        assert_eq!(parse_expiry("é"), None);
        assert_eq!(parse_expiry("1éh"), None);
    }

    #[test]
    fn test_equal_treats_missing_internal_ip_as_public_ip() {
        let mut a = sample_plan();
        a.etcd.nodes[0].internalip = a.etcd.nodes[0].ip.clone();
        let mut b = a.clone();
        b.etcd.nodes[0].internalip.clear();
        assert!(Plan::equal(&a, &b));
        assert!(Plan::equal(&b, &a));

        b.etcd.nodes[0].internalip = "192.168.9.9".to_string();
        assert!(!Plan::equal(&a, &b));
    }

    #[test]
    fn test_to_status_snapshots_plan() {
        let plan = sample_plan();
        let status = plan.to_status();
        assert_eq!(status.name, "test-cluster");
        assert_eq!(status.current_state, ClusterState::Planned);
        assert_eq!(status.desired_state, ClusterState::Installed);
        assert_eq!(status.plan_fingerprint, plan.fingerprint());
        assert!(Plan::equal(&status.spec, &plan));
    }

    #[test]
    fn test_api_server_prefers_load_balancer() {
        let mut plan = sample_plan();
        assert_eq!(plan.api_server_host(), Some("master01.example.com"));
        plan.master.load_balanced_fqdn.clear();
        assert_eq!(plan.api_server_host(), Some("10.0.0.2"));
    }
}
