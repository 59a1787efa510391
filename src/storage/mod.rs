//! Persistent cluster state.
//!
//! A single SQLite file at the assets root holds one table of namespaced
//! key-value buckets; cluster status records live in one bucket.

/// Cluster status records.
pub mod cluster_store;
/// Database schema and connection management.
pub mod schema;

pub use cluster_store::{ClusterState, ClusterStatus, ClusterStore, StoreError, CLUSTER_BUCKET};
pub use schema::{Storage, StorageConfig};
