//! Phased installation engine.
//!
//! An [`Executor`] drives one plan through validate, certificates,
//! credentials, install and smoke-test, recording progress in an
//! [`ExecutionState`]. Remote work goes through the [`ActionRunner`] and
//! [`RemoteCommand`] seams so tests can substitute in-memory doubles.
//!
//! [`ActionRunner`]: crate::remote::ActionRunner
//! [`RemoteCommand`]: crate::remote::RemoteCommand

/// Admin kubeconfig generation.
pub mod credentials;
/// Executor and its error type.
pub mod executor;
/// Executor options and output format.
pub mod options;
/// Phases and lifecycle state.
pub mod state;

pub use credentials::{generate_kubeconfig, Kubeconfig, API_SERVER_PORT};
pub use executor::{Executor, ExecutorError, RunReport, INSTALL_ACTION, PREFLIGHT_ACTION, SMOKE_TEST_ACTION};
pub use options::{ExecutorOptions, OutputFormat};
pub use state::{ExecutionState, LifecycleState, Phase};
