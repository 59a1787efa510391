//! Managed asset tree.
//!
//! Every cluster owns a directory named after it under the assets root:
//!
//! ```text
//! <root>/clusterStates.db
//! <root>/<name>/plan.yaml
//! <root>/<name>/ssh-key.pem
//! <root>/<name>/generated/{keys/, kubeconfig}
//! <root>/<name>/runs/<timestamp>-<action>/{inventory.ini, <action>.log}
//! ```

use std::path::{Path, PathBuf};

/// Plan file name inside a cluster directory.
pub const PLAN_FILE_NAME: &str = "plan.yaml";
/// Generated assets directory name.
pub const GENERATED_DIR_NAME: &str = "generated";
/// Certificate directory name inside the generated assets directory.
pub const KEYS_DIR_NAME: &str = "keys";
/// Action run directory name.
pub const RUNS_DIR_NAME: &str = "runs";
/// Imported SSH key file name.
pub const SSH_KEY_FILE_NAME: &str = "ssh-key.pem";
/// State store file name at the assets root.
pub const STORE_FILE_NAME: &str = "clusterStates.db";
/// Kubeconfig file name inside the generated assets directory.
pub const KUBECONFIG_FILE_NAME: &str = "kubeconfig";

/// Deterministic paths derived from the assets root and a cluster name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLayout {
    root: PathBuf,
}

impl AssetLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Assets root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State store path.
    pub fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE_NAME)
    }

    /// Directory owned by cluster `name`.
    pub fn cluster_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Managed plan file for `name`.
    pub fn plan_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(PLAN_FILE_NAME)
    }

    /// Generated assets directory for `name`.
    pub fn generated_dir(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(GENERATED_DIR_NAME)
    }

    /// Certificate directory for `name`.
    pub fn keys_dir(&self, name: &str) -> PathBuf {
        self.generated_dir(name).join(KEYS_DIR_NAME)
    }

    /// Kubeconfig path for `name`.
    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.generated_dir(name).join(KUBECONFIG_FILE_NAME)
    }

    /// Action runs directory for `name`.
    pub fn runs_dir(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(RUNS_DIR_NAME)
    }

    /// Imported SSH key for `name`.
    pub fn ssh_key_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(SSH_KEY_FILE_NAME)
    }

    /// A cluster exists once its plan file is present; the plan is the last
    /// artifact an import writes.
    pub fn cluster_exists(&self, name: &str) -> bool {
        self.plan_path(name).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_are_derived_from_name() {
        let layout = AssetLayout::new("clusters");
        assert_eq!(layout.plan_path("prod"), PathBuf::from("clusters/prod/plan.yaml"));
        assert_eq!(layout.generated_dir("prod"), PathBuf::from("clusters/prod/generated"));
        assert_eq!(layout.keys_dir("prod"), PathBuf::from("clusters/prod/generated/keys"));
        assert_eq!(layout.runs_dir("prod"), PathBuf::from("clusters/prod/runs"));
        assert_eq!(layout.ssh_key_path("prod"), PathBuf::from("clusters/prod/ssh-key.pem"));
        assert_eq!(layout.store_path(), PathBuf::from("clusters/clusterStates.db"));
    }

    #[test]
    fn test_cluster_exists_requires_plan_file() {
        let dir = tempdir().unwrap();
        let layout = AssetLayout::new(dir.path());
        std::fs::create_dir_all(layout.generated_dir("partial")).unwrap();
        assert!(!layout.cluster_exists("partial"));

        std::fs::write(layout.plan_path("partial"), "cluster: {name: partial}\n").unwrap();
        assert!(layout.cluster_exists("partial"));
    }
}
