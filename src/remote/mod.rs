//! Remote execution.
//!
//! Two seams reach the machines of a cluster: [`RemoteCommand`] runs one
//! read-only command on one node and returns its output, and
//! [`ActionRunner`] applies a named configuration action to a set of nodes.
//! Both are traits so the executor can be driven by test doubles.

/// Named configuration actions.
pub mod actions;
/// SSH command channel.
pub mod ssh;

pub use actions::{render_inventory, ActionError, ActionRequest, ActionRun, ActionRunner, CommandActionRunner};
pub use ssh::SshClient;

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::plan::Node;

/// Errors from the remote command channel.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The command did not finish within its timeout
    #[error("command on {host} timed out after {after:?}: {command}")]
    Timeout {
        /// Target host
        host: String,
        /// Remote command line
        command: String,
        /// Timeout that elapsed
        after: Duration,
    },

    /// The node could not be reached
    #[error("cannot connect to {host}: {message}")]
    Connection {
        /// Target host
        host: String,
        /// Client diagnostics
        message: String,
    },

    /// The command ran and exited non-zero
    #[error("command on {host} failed with status {status:?}: {output}")]
    CommandFailed {
        /// Target host
        host: String,
        /// Remote command line
        command: String,
        /// Exit status, if any
        status: Option<i32>,
        /// Captured output
        output: String,
    },

    /// The local client program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl RemoteError {
    /// Timeouts and connection failures may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Timeout { .. } | RemoteError::Connection { .. })
    }
}

/// Abstraction for running one command on one node, enabling test doubles.
#[allow(async_fn_in_trait)]
pub trait RemoteCommand {
    /// Run `command` on `node` with elevated privileges and return its stdout.
    async fn execute(&self, node: &Node, command: &str) -> Result<String, RemoteError>;
}

impl<T: RemoteCommand + ?Sized> RemoteCommand for &T {
    async fn execute(&self, node: &Node, command: &str) -> Result<String, RemoteError> {
        (**self).execute(node, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = RemoteError::Timeout {
            host: "master01".to_string(),
            command: "kubectl get nodes".to_string(),
            after: Duration::from_secs(60),
        };
        let refused = RemoteError::Connection {
            host: "master01".to_string(),
            message: "Connection refused".to_string(),
        };
        let failed = RemoteError::CommandFailed {
            host: "master01".to_string(),
            command: "false".to_string(),
            status: Some(1),
            output: String::new(),
        };

        assert!(timeout.is_transient());
        assert!(refused.is_transient());
        assert!(!failed.is_transient());
        assert!(timeout.to_string().contains("timed out"));
    }
}
