use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::layout::{KEYS_DIR_NAME, KUBECONFIG_FILE_NAME};
use crate::pki::{cert_paths, ADMIN_NAME, CA_CERT_FILE};
use crate::plan::Plan;

/// Secure port of the API server.
pub const API_SERVER_PORT: u16 = 6443;

/// Administrator kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Always `v1`.
    pub api_version: String,
    /// Always `Config`.
    pub kind: String,
    /// Known clusters.
    pub clusters: Vec<NamedCluster>,
    /// Known users.
    pub users: Vec<NamedUser>,
    /// Cluster/user pairings.
    pub contexts: Vec<NamedContext>,
    /// Context used by default.
    pub current_context: String,
}

/// Cluster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name.
    pub name: String,
    /// Connection details.
    pub cluster: ClusterEndpoint,
}

/// API endpoint and trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEndpoint {
    /// `https://host:port`.
    pub server: String,
    /// CA certificate path.
    pub certificate_authority: PathBuf,
}

/// User entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name.
    pub name: String,
    /// Client credentials.
    pub user: UserCredentials,
}

/// Client certificate credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserCredentials {
    /// Client certificate path.
    pub client_certificate: PathBuf,
    /// Client key path.
    pub client_key: PathBuf,
}

/// Context entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name.
    pub name: String,
    /// Pairing.
    pub context: ContextRef,
}

/// Cluster/user pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    /// Cluster entry name.
    pub cluster: String,
    /// User entry name.
    pub user: String,
}

impl Kubeconfig {
    /// Admin kubeconfig for `plan`, referencing certificates under `generated_dir`.
    pub fn for_plan(plan: &Plan, generated_dir: &Path) -> Result<Self> {
        let host = plan
            .api_server_host()
            .ok_or_else(|| anyhow!("plan has no master node to reach the API server"))?;
        let keys_dir = generated_dir.join(KEYS_DIR_NAME);
        let (client_certificate, client_key) = cert_paths(&keys_dir, ADMIN_NAME);
        let name = plan.cluster.name.clone();
        let context = format!("{name}-{ADMIN_NAME}");

        Ok(Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: name.clone(),
                cluster: ClusterEndpoint {
                    server: format!("https://{host}:{API_SERVER_PORT}"),
                    certificate_authority: keys_dir.join(CA_CERT_FILE),
                },
            }],
            users: vec![NamedUser {
                name: ADMIN_NAME.to_string(),
                user: UserCredentials {
                    client_certificate,
                    client_key,
                },
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextRef {
                    cluster: name,
                    user: ADMIN_NAME.to_string(),
                },
            }],
            current_context: context,
        })
    }
}

/// Write the admin kubeconfig into `generated_dir` and return its path.
pub fn generate_kubeconfig(plan: &Plan, generated_dir: &Path) -> Result<PathBuf> {
    let config = Kubeconfig::for_plan(plan, generated_dir)?;
    let path = generated_dir.join(KUBECONFIG_FILE_NAME);

    fs::create_dir_all(generated_dir)
        .with_context(|| format!("Failed to create generated assets directory: {:?}", generated_dir))?;
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize kubeconfig")?;
    fs::write(&path, yaml).with_context(|| format!("Failed to write kubeconfig: {:?}", path))?;

    Ok(path)
}
