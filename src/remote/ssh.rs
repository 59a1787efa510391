use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{RemoteCommand, RemoteError};
use crate::config::RemoteConfig;
use crate::plan::{Node, Ssh};

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Runs commands on nodes through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshClient {
    binary: String,
    user: String,
    key: PathBuf,
    port: u16,
    timeout: Duration,
    strict_host_key_checking: bool,
}

impl SshClient {
    /// Client for the plan's SSH settings, using `key` as the identity file.
    pub fn new(config: &RemoteConfig, ssh: &Ssh, key: impl Into<PathBuf>) -> Self {
        Self {
            binary: config.ssh_binary.clone(),
            user: ssh.user.clone(),
            key: key.into(),
            port: ssh.ssh_port,
            timeout: config.command_timeout(),
            strict_host_key_checking: config.strict_host_key_checking,
        }
    }

    /// Identity file in use.
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments passed to the client, excluding the binary itself.
    pub fn args(&self, node: &Node, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.key.display().to_string(),
        ];
        if !self.strict_host_key_checking {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }
        args.push(format!("{}@{}", self.user, node.ip));
        args.push(format!("sudo {command}"));
        args
    }
}

impl RemoteCommand for SshClient {
    async fn execute(&self, node: &Node, command: &str) -> Result<String, RemoteError> {
        debug!(host = %node.host, ip = %node.ip, command, "Running remote command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(node, command))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(host = %node.host, command, "Remote command timed out after {:?}", self.timeout);
                RemoteError::Timeout {
                    host: node.host.clone(),
                    command: command.to_string(),
                    after: self.timeout,
                }
            })?
            .map_err(|source| RemoteError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(SSH_CONNECTION_FAILURE) => Err(RemoteError::Connection {
                host: node.host.clone(),
                message: stderr,
            }),
            status => Err(RemoteError::CommandFailed {
                host: node.host.clone(),
                command: command.to_string(),
                status,
                output: if stderr.is_empty() { stdout.trim().to_string() } else { stderr },
            }),
        }
    }
}
