//! Plan validation.
//!
//! Validation never fails fast: every rule runs and every violation is
//! collected into a [`ValidationReport`].

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use super::{parse_expiry, Node, NodeRole, Plan};

/// One broken rule, addressed by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Field path, e.g. `worker.nodes[1].ip`
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl Violation {
    /// Create a violation.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All violations found in a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Violations in discovery order
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// True when no rule was broken.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Record a violation.
    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// `Ok(())` when valid, otherwise the report itself as the error.
    pub fn into_result(self) -> Result<(), ValidationReport> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(Violation::new(field, message));
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.violations.len() {
            0 => write!(f, "plan is valid"),
            1 => write!(f, "plan is invalid: {}", self.violations[0]),
            n => write!(f, "plan is invalid: {n} violations"),
        }
    }
}

impl std::error::Error for ValidationReport {}

/// Check every plan invariant.
pub fn validate(plan: &Plan) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_cluster(plan, &mut report);
    validate_groups(plan, &mut report);
    validate_hosts(plan, &mut report);
    validate_nfs(plan, &mut report);
    report
}

fn validate_cluster(plan: &Plan, report: &mut ValidationReport) {
    let cluster = &plan.cluster;

    if cluster.name.trim().is_empty() {
        report.add("cluster.name", "must not be empty");
    } else if !is_valid_cluster_name(&cluster.name) {
        report.add(
            "cluster.name",
            "may only contain letters, digits, '-', '_' and '.', and must not start with '.'",
        );
    }

    let networking = &cluster.networking;
    if !networking.disable_cni {
        match networking.network_type.as_str() {
            "overlay" | "routed" => {}
            "" => report.add("cluster.networking.type", "must not be empty"),
            other => report.add(
                "cluster.networking.type",
                format!("unknown networking type {other:?}, expected overlay or routed"),
            ),
        }
    }
    check_cidr(&mut report.violations, "cluster.networking.pod_cidr_block", &networking.pod_cidr_block);
    check_cidr(
        &mut report.violations,
        "cluster.networking.service_cidr_block",
        &networking.service_cidr_block,
    );

    if cluster.certificates.expiry.trim().is_empty() {
        report.add("cluster.certificates.expiry", "must not be empty");
    } else if parse_expiry(&cluster.certificates.expiry).is_none() {
        report.add(
            "cluster.certificates.expiry",
            format!("invalid duration {:?}, expected <n>h or <n>d", cluster.certificates.expiry),
        );
    }

    if cluster.ssh.user.trim().is_empty() {
        report.add("cluster.ssh.user", "must not be empty");
    }
    if cluster.ssh.ssh_key.trim().is_empty() {
        report.add("cluster.ssh.ssh_key", "must not be empty");
    }
    if cluster.ssh.ssh_port == 0 {
        report.add("cluster.ssh.ssh_port", "must be between 1 and 65535");
    }
}

fn validate_groups(plan: &Plan, report: &mut ValidationReport) {
    for role in NodeRole::ALL {
        let group = plan.group(role);

        if role.is_required() && group.nodes.is_empty() {
            report.add(format!("{role}.nodes"), "at least one node is required");
        }
        if group.expected_count != group.nodes.len() {
            report.add(
                format!("{role}.expected_count"),
                format!(
                    "expected_count is {} but {} node(s) are listed",
                    group.expected_count,
                    group.nodes.len()
                ),
            );
        }

        for (index, node) in group.nodes.iter().enumerate() {
            validate_node(&format!("{role}.nodes[{index}]"), node, report);
        }
    }

    if plan.master.group.nodes.len() > 1 && plan.master.load_balanced_fqdn.trim().is_empty() {
        report.add(
            "master.load_balanced_fqdn",
            "required when more than one master is listed",
        );
    }
}

fn validate_node(field: &str, node: &Node, report: &mut ValidationReport) {
    if node.host.trim().is_empty() {
        report.add(format!("{field}.host"), "must not be empty");
    }
    if node.ip.parse::<IpAddr>().is_err() {
        report.add(format!("{field}.ip"), format!("invalid IP address {:?}", node.ip));
    }
    if !node.internalip.is_empty() && node.internalip.parse::<IpAddr>().is_err() {
        report.add(
            format!("{field}.internalip"),
            format!("invalid IP address {:?}", node.internalip),
        );
    }
    for key in node.labels.keys() {
        if key.trim().is_empty() {
            report.add(format!("{field}.labels"), "label keys must not be empty");
        }
    }
}

/// A host may appear in several groups, but always as the same machine, and at
/// most once per group.
fn validate_hosts(plan: &Plan, report: &mut ValidationReport) {
    let mut seen: HashMap<String, (NodeRole, &Node)> = HashMap::new();

    for role in NodeRole::ALL {
        let mut in_group: HashMap<String, usize> = HashMap::new();
        for (index, node) in plan.group(role).nodes.iter().enumerate() {
            if node.host.trim().is_empty() {
                continue;
            }
            let key = node.host.to_ascii_lowercase();

            if let Some(first) = in_group.insert(key.clone(), index) {
                report.add(
                    format!("{role}.nodes[{index}].host"),
                    format!("host {:?} is already listed at {role}.nodes[{first}]", node.host),
                );
                continue;
            }

            match seen.get(&key) {
                Some((other_role, other)) if !other.same_machine(node) => report.add(
                    format!("{role}.nodes[{index}]"),
                    format!(
                        "host {:?} is listed in {other_role} with different addresses",
                        node.host
                    ),
                ),
                Some(_) => {}
                None => {
                    seen.insert(key, (role, node));
                }
            }
        }
    }
}

fn validate_nfs(plan: &Plan, report: &mut ValidationReport) {
    for (index, volume) in plan.nfs.volumes.iter().enumerate() {
        let field = format!("nfs.nfs_volume[{index}]");
        if volume.nfs_host.trim().is_empty() {
            report.add(format!("{field}.nfs_host"), "must not be empty");
        }
        if !volume.mount_path.starts_with('/') {
            report.add(format!("{field}.mount_path"), "must be an absolute path");
        }
    }
}

fn check_cidr(violations: &mut Vec<Violation>, field: &str, value: &str) {
    if value.trim().is_empty() {
        violations.push(Violation::new(field, "must not be empty"));
        return;
    }
    if !is_valid_cidr(value) {
        violations.push(Violation::new(field, format!("invalid CIDR block {value:?}")));
    }
}

fn is_valid_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => prefix <= 32,
        Ok(IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

pub(crate) fn is_valid_cluster_name(name: &str) -> bool {
    !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
