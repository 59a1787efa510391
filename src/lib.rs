// kluster - Cluster Lifecycle Orchestration
//
// Imports declarative cluster plans, drives them through a phased
// installation over SSH, grows clusters node by node, and records the
// outcome of every run in a durable state store.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Per-command context tying configuration, layout and store together
pub mod cluster;
/// Configuration file handling
pub mod config;
/// Crate-level errors and operator-facing formatting
pub mod errors;
/// Import of externally produced plans
pub mod import;
/// On-disk layout of managed clusters
pub mod layout;
/// Phased installation engine
pub mod phase;
/// Certificate authority and node certificates
pub mod pki;
/// Cluster plan model and validation
pub mod plan;
/// Remote command channel and named actions
pub mod remote;
/// Retry with exponential backoff
pub mod retry;
/// Persistent cluster state
pub mod storage;
/// Post-install verification against the live cluster
pub mod verify;

/// Command-line interface
#[cfg(feature = "cli")]
pub mod cli;

pub use cluster::ClusterContext;
pub use config::Config;
pub use errors::{format_error, Error, ErrorKind, Result};
pub use layout::AssetLayout;
pub use phase::{Executor, ExecutorError, ExecutorOptions, OutputFormat, Phase};
pub use plan::{Node, NodeRole, Plan};
pub use retry::RetryPolicy;
pub use storage::{ClusterState, ClusterStatus, ClusterStore};
