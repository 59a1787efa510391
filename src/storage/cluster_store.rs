//! Durable cluster status records.
//!
//! One JSON record per cluster name in the `kluster` bucket. Writes are full
//! record upserts, so the last write wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::schema::Storage;
use crate::plan::Plan;

/// Bucket holding cluster status records.
pub const CLUSTER_BUCKET: &str = "kluster";

/// Errors that can occur in the cluster state store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store location could not be prepared
    #[error("IO error at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored record is not valid JSON for a status
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    /// Known but never applied
    Planned,
    /// Every phase of the last apply succeeded
    Installed,
    /// The last apply failed
    InstallFailed,
}

impl ClusterState {
    /// Name as stored.
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::Planned => "planned",
            ClusterState::Installed => "installed",
            ClusterState::InstallFailed => "installFailed",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status record for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Cluster name, the record key
    pub name: String,
    /// State the operator asked for
    pub desired_state: ClusterState,
    /// State last observed
    pub current_state: ClusterState,
    /// Plan the record was produced from
    pub spec: Plan,
    /// BLAKE3 fingerprint of `spec`
    pub plan_fingerprint: String,
    /// Time of the last write
    pub updated_at: DateTime<Utc>,
}

impl ClusterStatus {
    /// Same record with a new current state, stamped now.
    pub fn with_current_state(mut self, state: ClusterState) -> Self {
        self.current_state = state;
        self.updated_at = Utc::now();
        self
    }

    /// Whether the stored plan matches `plan`.
    pub fn matches_plan(&self, plan: &Plan) -> bool {
        self.plan_fingerprint == plan.fingerprint()
    }
}

/// Cluster state store
///
/// Opened once per command and released by [`ClusterStore::close`] or drop.
pub struct ClusterStore {
    storage: Storage,
    path: PathBuf,
}

impl ClusterStore {
    /// Open the store, creating its parent directories, file and table as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let storage = Storage::open(&path)?;
        debug!(path = %path.display(), "Opened cluster state store");

        Ok(Self { storage, path })
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert the record for `name`.
    pub fn put(&mut self, name: &str, status: &ClusterStatus) -> Result<()> {
        let value = serde_json::to_vec(status)?;
        self.storage.bucket_put(CLUSTER_BUCKET, name, &value)?;
        debug!(cluster = name, state = %status.current_state, "Stored cluster status");
        Ok(())
    }

    /// Record for `name`, if any.
    pub fn get(&self, name: &str) -> Result<Option<ClusterStatus>> {
        match self.storage.bucket_get(CLUSTER_BUCKET, name)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the record for `name`; returns whether it existed.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        Ok(self.storage.bucket_delete(CLUSTER_BUCKET, name)?)
    }

    /// Every cluster name with a record, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.storage.bucket_keys(CLUSTER_BUCKET)?)
    }

    /// Release the handle, checkpointing the write-ahead log.
    pub fn close(self) -> Result<()> {
        self.storage.close()?;
        Ok(())
    }
}
