//! Remote health verification.
//!
//! Polls read-only cluster state through a [`RemoteCommand`] target until it
//! meets expectations or the retry policy gives up.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::plan::Node;
use crate::remote::{RemoteCommand, RemoteError};
use crate::retry::{with_backoff, RetryPolicy};

/// Namespace assumed for rollouts named without one.
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Verification gave up.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A rollout never reached its expected ready count
    #[error("rollout {name} not ready after {attempts} attempt(s), last observed: {last_output}")]
    Rollout {
        /// Rollout name as given in the expectation map
        name: String,
        /// Attempts made
        attempts: u32,
        /// Last observation
        last_output: String,
    },

    /// A node never reported Ready
    #[error("node {host} not ready after {attempts} attempt(s), last observed: {last_output}")]
    NodeNotReady {
        /// Node host name
        host: String,
        /// Attempts made
        attempts: u32,
        /// Last observation
        last_output: String,
    },

    /// The remote channel failed in a way another attempt cannot fix
    #[error("cannot verify {subject}: {source}")]
    Remote {
        /// Rollout name or node host being verified
        subject: String,
        /// Channel failure
        #[source]
        source: RemoteError,
    },
}

impl VerifyError {
    /// Whether polling gave up on an observation or a transient channel
    /// failure, rather than on a channel that cannot work at all.
    pub fn is_transient(&self) -> bool {
        !matches!(self, VerifyError::Remote { .. })
    }
}

/// Why a single poll did not succeed.
#[derive(Debug)]
enum Attempt {
    Short { ready: u32, expected: u32 },
    NotReady(String),
    Unparseable(String),
    Remote(RemoteError),
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Short { ready, expected } => write!(f, "{ready}/{expected} replicas ready"),
            Attempt::NotReady(status) => write!(f, "status {status}"),
            Attempt::Unparseable(output) => write!(f, "unexpected output {output:?}"),
            Attempt::Remote(e) => write!(f, "{e}"),
        }
    }
}

/// Wait until every rollout in `expected` has at least its expected number of
/// ready replicas, as seen from `target`.
///
/// Keys are `namespace/name`, or a bare name in [`DEFAULT_NAMESPACE`].
pub async fn verify_deployment<R: RemoteCommand>(
    remote: &R,
    target: &Node,
    expected: &HashMap<String, u32>,
    policy: &RetryPolicy,
) -> Result<(), VerifyError> {
    let mut names: Vec<&String> = expected.keys().collect();
    names.sort();

    for name in names {
        let want = expected[name];
        let command = ready_replicas_command(name);
        let command = command.as_str();
        let operation = format!("verify rollout {name}");

        with_backoff(policy, &operation, || async move {
            let output = match remote.execute(target, command).await {
                Ok(output) => output,
                Err(e) if retryable(&e) => return Err(Attempt::Remote(e)),
                Err(e) => return Ok(Err(e)),
            };
            let ready = parse_ready_replicas(&output).ok_or_else(|| Attempt::Unparseable(output.trim().to_string()))?;
            if ready >= want {
                Ok(Ok(ready))
            } else {
                Err(Attempt::Short { ready, expected: want })
            }
        })
        .await
        .map_err(|last| VerifyError::Rollout {
            name: name.clone(),
            attempts: policy.attempts(),
            last_output: last.to_string(),
        })?
        .map_err(|source| VerifyError::Remote {
            subject: format!("rollout {name}"),
            source,
        })?;

        info!(rollout = %name, expected = want, "Rollout ready");
    }

    Ok(())
}

/// Wait until `host` reports `Ready`, as seen from `target`.
pub async fn verify_node_ready<R: RemoteCommand>(
    remote: &R,
    target: &Node,
    host: &str,
    policy: &RetryPolicy,
) -> Result<(), VerifyError> {
    let node_name = host.to_ascii_lowercase();
    let command = format!("kubectl get node {node_name} --no-headers");
    let command = command.as_str();
    let operation = format!("verify node {node_name}");

    with_backoff(policy, &operation, || async move {
        let output = match remote.execute(target, command).await {
            Ok(output) => output,
            Err(e) if retryable(&e) => return Err(Attempt::Remote(e)),
            Err(e) => return Ok(Err(e)),
        };
        match node_status(&output) {
            Some(status) if is_ready(status) => Ok(Ok(())),
            Some(status) => Err(Attempt::NotReady(status.to_string())),
            None => Err(Attempt::Unparseable(output.trim().to_string())),
        }
    })
    .await
    .map_err(|last| VerifyError::NodeNotReady {
        host: host.to_string(),
        attempts: policy.attempts(),
        last_output: last.to_string(),
    })?
    .map_err(|source| VerifyError::Remote {
        subject: format!("node {node_name}"),
        source,
    })?;

    info!(host, "Node ready");
    Ok(())
}

/// Timeouts and lost connections may clear up. A command that ran and failed
/// is an observation too: kubectl exits non-zero until the object exists.
/// Anything else, such as a missing ssh binary, stops polling at once.
fn retryable(e: &RemoteError) -> bool {
    e.is_transient() || matches!(e, RemoteError::CommandFailed { .. })
}

fn ready_replicas_command(name: &str) -> String {
    let (namespace, deployment) = name.split_once('/').unwrap_or((DEFAULT_NAMESPACE, name));
    format!("kubectl -n {namespace} get deployment {deployment} -o jsonpath='{{.status.readyReplicas}}'")
}

/// An absent `readyReplicas` field renders as empty output and means zero.
fn parse_ready_replicas(output: &str) -> Option<u32> {
    let trimmed = output.trim().trim_matches('\'');
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse().ok()
}

/// Second column of `kubectl get node --no-headers`.
fn node_status(output: &str) -> Option<&str> {
    output.lines().find(|l| !l.trim().is_empty())?.split_whitespace().nth(1)
}

fn is_ready(status: &str) -> bool {
    status.split(',').any(|part| part == "Ready")
}
