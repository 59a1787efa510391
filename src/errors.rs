// Error Handling
//
// Crate-level error type, the error taxonomy reported to operators, and
// user-facing formatting with remediation hints.

use std::fmt;
use thiserror::Error;

use crate::import::ImportError;
use crate::phase::ExecutorError;
use crate::pki::PkiError;
use crate::plan::{PlanError, ValidationReport};
use crate::remote::RemoteError;
use crate::storage::StoreError;
use crate::verify::VerifyError;

/// Result type for kluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every failure the orchestrator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed plan or store content
    Parse,
    /// One or more plan invariants violated
    Validation,
    /// A cluster, plan file, artifact, or action does not exist
    NotFound,
    /// An import collides with a different existing plan
    Conflict,
    /// A phase of a run failed
    Phase,
    /// A remote operation timed out or lost its connection
    TransientRemote,
    /// The state store or the asset tree could not be read or written
    Persistence,
}

impl ErrorKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Phase => "phase",
            ErrorKind::TransientRemote => "transient-remote",
            ErrorKind::Persistence => "persistence",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// kluster error types
#[derive(Debug, Error)]
pub enum Error {
    /// Plan file could not be loaded or saved
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Plan failed validation
    #[error(transparent)]
    Invalid(#[from] ValidationReport),

    /// State store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Import failure
    #[error(transparent)]
    Import(#[from] ImportError),

    /// Executor failure
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Remote channel failure outside of a phase
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Remote verification gave up
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Certificate generation failure
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// No plan has been imported under this name
    #[error("cluster {name:?} not found")]
    ClusterNotFound {
        /// Requested cluster name
        name: String,
    },

    /// A command failed and recording its failure status failed as well
    #[error("{cause}: {persistence}")]
    RecordFailed {
        /// The command failure
        cause: Box<Error>,
        /// The store failure hit while recording it
        persistence: StoreError,
    },
}

impl Error {
    /// Create a cluster-not-found error
    pub fn cluster_not_found(name: impl Into<String>) -> Self {
        Error::ClusterNotFound { name: name.into() }
    }

    /// Combine a command failure with the store failure that followed it.
    pub fn record_failed(cause: Error, persistence: StoreError) -> Self {
        Error::RecordFailed {
            cause: Box::new(cause),
            persistence,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Plan(e) => plan_kind(e),
            Error::Invalid(_) => ErrorKind::Validation,
            Error::Store(e) => store_kind(e),
            Error::Import(e) => match e {
                ImportError::Conflict { .. } => ErrorKind::Conflict,
                ImportError::Plan(inner) => plan_kind(inner),
                ImportError::MissingSource { .. } => ErrorKind::NotFound,
                ImportError::InvalidName { .. } => ErrorKind::Validation,
                ImportError::Io { .. } => ErrorKind::Persistence,
            },
            Error::Executor(e) => match e {
                ExecutorError::Validation(_)
                | ExecutorError::NodeExists { .. }
                | ExecutorError::InvalidRoles { .. } => ErrorKind::Validation,
                ExecutorError::UnknownAction { .. } => ErrorKind::NotFound,
                ExecutorError::Phase { .. } | ExecutorError::Action(_) => ErrorKind::Phase,
            },
            Error::Remote(e) if e.is_transient() => ErrorKind::TransientRemote,
            Error::Remote(_) => ErrorKind::Phase,
            Error::Verify(e) if e.is_transient() => ErrorKind::TransientRemote,
            Error::Verify(_) => ErrorKind::Phase,
            Error::Pki(_) => ErrorKind::Phase,
            Error::ClusterNotFound { .. } => ErrorKind::NotFound,
            Error::RecordFailed { .. } => ErrorKind::Persistence,
        }
    }

    /// Get user-friendly suggestion for recovery
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ClusterNotFound { name } => Some(format!(
                "No plan is managed under {name:?}. Run `kluster import <plan-file>` first."
            )),
            Error::Plan(PlanError::Parse { .. }) => {
                Some("Check the plan file for YAML syntax errors.".to_string())
            }
            Error::Invalid(_) | Error::Executor(ExecutorError::Validation(_)) => {
                Some("Fix the listed plan violations and retry.".to_string())
            }
            Error::Import(ImportError::Conflict { .. }) => Some(
                "A different plan is already imported under this name. Rename the cluster in \
                 the new plan or remove the existing cluster directory."
                    .to_string(),
            ),
            Error::Executor(ExecutorError::UnknownAction { known, .. }) => {
                Some(format!("Known actions: {}", known.join(", ")))
            }
            Error::Executor(ExecutorError::NodeExists { .. }) => {
                Some("Use a host name that is not already part of the plan.".to_string())
            }
            Error::Executor(ExecutorError::Phase { .. }) | Error::Executor(ExecutorError::Action(_)) => Some(
                "Inspect the latest log under the cluster's runs directory, fix the cause and \
                 re-run `kluster apply`."
                    .to_string(),
            ),
            Error::Verify(_) | Error::Remote(_) if self.kind() == ErrorKind::TransientRemote => {
                Some("Check network reachability of the nodes and retry.".to_string())
            }
            Error::Store(_) | Error::RecordFailed { .. } => Some(
                "The cluster state store could not be written. Check permissions on the assets \
                 root and retry."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Whether retrying the same command unchanged may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientRemote | ErrorKind::Persistence)
    }
}

fn plan_kind(e: &PlanError) -> ErrorKind {
    match e {
        PlanError::NotFound { .. } => ErrorKind::NotFound,
        PlanError::Parse { .. } => ErrorKind::Parse,
        PlanError::Io { .. } | PlanError::Serialize(_) => ErrorKind::Persistence,
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::Serialization(_) => ErrorKind::Parse,
        _ => ErrorKind::Persistence,
    }
}

/// Format error for display to the user
pub fn format_error(error: &Error) -> String {
    let mut message = format!("Error: {}", error);

    if let Error::Invalid(report) | Error::Executor(ExecutorError::Validation(report)) = error {
        for violation in &report.violations {
            message.push_str(&format!("\n  - {}", violation));
        }
    }

    if let Some(suggestion) = error.suggestion() {
        message.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Violation;
    use std::path::PathBuf;

    #[test]
    fn test_cluster_not_found_suggests_import() {
        let error = Error::cluster_not_found("prod");
        assert_eq!(error.kind(), ErrorKind::NotFound);
        let text = format_error(&error);
        assert!(text.starts_with("Error: cluster \"prod\" not found"));
        assert!(text.contains("kluster import"));
    }

    #[test]
    fn test_plan_error_kinds() {
        let missing: Error = PlanError::NotFound {
            path: PathBuf::from("/nope/plan.yaml"),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let parse_err = serde_yaml::from_str::<crate::plan::Plan>("[").unwrap_err();
        let malformed: Error = PlanError::Parse {
            path: PathBuf::from("plan.yaml"),
            source: parse_err,
        }
        .into();
        assert_eq!(malformed.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_validation_report_lists_every_violation() {
        let mut report = ValidationReport::default();
        report.push(Violation::new("etcd.nodes", "at least one node is required"));
        report.push(Violation::new("cluster.name", "must not be empty"));

        let error: Error = report.into();
        assert_eq!(error.kind(), ErrorKind::Validation);
        let text = format_error(&error);
        assert!(text.contains("etcd.nodes: at least one node is required"));
        assert!(text.contains("cluster.name: must not be empty"));
    }

    #[test]
    fn test_record_failed_combines_both_messages() {
        let cause = Error::cluster_not_found("a");
        let persistence = StoreError::Io {
            path: PathBuf::from("/ro/clusterStates.db"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        };
        let error = Error::record_failed(cause, persistence);
        let text = error.to_string();
        assert!(text.contains("cluster \"a\" not found"));
        assert!(text.contains("read-only"));
        assert_eq!(error.kind(), ErrorKind::Persistence);
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_phase_failure_names_phase_and_points_at_logs() {
        let error: Error = ExecutorError::Phase {
            phase: crate::phase::Phase::Install,
            cause: anyhow::anyhow!("action kubernetes.yaml failed"),
        }
        .into();

        assert_eq!(error.kind(), ErrorKind::Phase);
        assert!(!error.is_recoverable());
        let text = format_error(&error);
        assert!(text.starts_with("Error: install phase failed: action kubernetes.yaml failed"));
        assert!(text.contains("runs directory"));
    }

    #[test]
    fn test_verify_error_kind_follows_the_remote_failure() {
        let gave_up: Error = VerifyError::NodeNotReady {
            host: "worker02".to_string(),
            attempts: 3,
            last_output: "status NotReady".to_string(),
        }
        .into();
        assert_eq!(gave_up.kind(), ErrorKind::TransientRemote);
        assert!(format_error(&gave_up).contains("network reachability"));

        let cannot_start: Error = VerifyError::Remote {
            subject: "node worker02".to_string(),
            source: RemoteError::Spawn {
                program: "ssh".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            },
        }
        .into();
        assert_eq!(cannot_start.kind(), ErrorKind::Phase);
        assert!(!cannot_start.is_recoverable());
        assert!(!format_error(&cannot_start).contains("network reachability"));
    }

    #[test]
    fn test_unknown_action_lists_known_actions() {
        let error: Error = ExecutorError::UnknownAction {
            action: "reboot.yaml".to_string(),
            known: vec!["kubernetes.yaml".to_string(), "preflight.yaml".to_string()],
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert_eq!(
            error.suggestion().as_deref(),
            Some("Known actions: kubernetes.yaml, preflight.yaml")
        );
    }
}
