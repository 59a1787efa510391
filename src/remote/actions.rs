use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ActionsConfig;
use crate::layout::AssetLayout;
use crate::phase::OutputFormat;
use crate::plan::{NodeRole, Plan};

/// Inventory file written into every run directory.
pub const INVENTORY_FILE_NAME: &str = "inventory.ini";

/// Errors from running a named action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// No action with this name is known
    #[error("unknown action {action:?}")]
    UnknownAction {
        /// Requested action
        action: String,
    },

    /// The action program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Run directory, inventory or log could not be written
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The action did not finish in time
    #[error("action {action} timed out after {after:?}")]
    Timeout {
        /// Action name
        action: String,
        /// Timeout that elapsed
        after: Duration,
    },

    /// The action exited non-zero
    #[error("action {action} failed with status {status:?}, see {}", log.display())]
    Failed {
        /// Action name
        action: String,
        /// Exit status, if any
        status: Option<i32>,
        /// Log with the full output
        log: PathBuf,
    },
}

/// One request to apply an action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionRequest {
    /// Action name, e.g. `kubernetes.yaml`
    pub action: String,
    /// Restrict execution to these hosts; empty means every node
    pub limit: Vec<String>,
    /// Force services to restart so they pick up new configuration
    pub restart_services: bool,
    /// Additional variables handed to the action
    pub extra_vars: BTreeMap<String, String>,
}

impl ActionRequest {
    /// Request for `action` against every node.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    /// Restrict to the given hosts.
    pub fn limited_to(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.limit = hosts.into_iter().collect();
        self
    }

    /// Set the restart flag.
    pub fn restarting(mut self, restart_services: bool) -> Self {
        self.restart_services = restart_services;
        self
    }

    /// Add one extra variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }
}

/// Record of a completed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRun {
    /// Action name
    pub action: String,
    /// Directory holding the inventory and log, when one was written
    pub run_dir: Option<PathBuf>,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Abstraction for applying named actions to nodes, enabling test doubles.
#[allow(async_fn_in_trait)]
pub trait ActionRunner {
    /// Names of every action this runner can apply.
    fn known_actions(&self) -> Vec<String>;

    /// Apply one action to the plan's nodes.
    async fn run_action(&self, plan: &Plan, request: &ActionRequest) -> Result<ActionRun, ActionError>;
}

impl<T: ActionRunner + ?Sized> ActionRunner for &T {
    fn known_actions(&self) -> Vec<String> {
        (**self).known_actions()
    }

    async fn run_action(&self, plan: &Plan, request: &ActionRequest) -> Result<ActionRun, ActionError> {
        (**self).run_action(plan, request).await
    }
}

/// Runs actions by invoking an external program, one file per action.
///
/// Each run gets its own directory under the cluster's runs directory holding
/// the generated inventory and a log with the program's full output.
#[derive(Debug, Clone)]
pub struct CommandActionRunner {
    program: String,
    actions_dir: PathBuf,
    timeout: Duration,
    runs_dir: PathBuf,
    generated_dir: PathBuf,
    ssh_key: PathBuf,
    output: OutputFormat,
}

impl CommandActionRunner {
    /// Runner for cluster `name` under `layout`.
    pub fn new(config: &ActionsConfig, layout: &AssetLayout, name: &str, ssh_key: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            actions_dir: config.playbooks_dir.clone(),
            timeout: config.timeout(),
            runs_dir: layout.runs_dir(name),
            generated_dir: layout.generated_dir(name),
            ssh_key: ssh_key.into(),
            output: OutputFormat::default(),
        }
    }

    /// Stream program output to stdout (`Raw`) or only to the log (`Simple`).
    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    /// Directory holding one file per action.
    pub fn actions_dir(&self) -> &Path {
        &self.actions_dir
    }

    fn prepare_run_dir(&self, action: &str) -> Result<PathBuf, ActionError> {
        let stem = action_stem(action);
        let run_dir = self
            .runs_dir
            .join(format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), stem));
        fs::create_dir_all(&run_dir).map_err(|source| ActionError::Io {
            path: run_dir.clone(),
            source,
        })?;
        Ok(run_dir)
    }

    fn extra_vars(&self, plan: &Plan, request: &ActionRequest) -> String {
        let mut vars = BTreeMap::new();
        vars.insert("kluster_cluster_name".to_string(), plan.cluster.name.clone());
        vars.insert(
            "kluster_generated_dir".to_string(),
            self.generated_dir.display().to_string(),
        );
        vars.insert(
            "kluster_restart_services".to_string(),
            request.restart_services.to_string(),
        );
        vars.extend(request.extra_vars.clone());
        serde_json::to_string(&vars).unwrap_or_else(|_| "{}".to_string())
    }
}

impl ActionRunner for CommandActionRunner {
    fn known_actions(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.actions_dir) else {
            return Vec::new();
        };
        let mut actions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.ends_with(".yaml") || name.ends_with(".yml"))
            .collect();
        actions.sort();
        actions
    }

    async fn run_action(&self, plan: &Plan, request: &ActionRequest) -> Result<ActionRun, ActionError> {
        let action_file = self.actions_dir.join(&request.action);
        if !action_file.is_file() {
            return Err(ActionError::UnknownAction {
                action: request.action.clone(),
            });
        }

        let started = Instant::now();
        let run_dir = self.prepare_run_dir(&request.action)?;
        let inventory = run_dir.join(INVENTORY_FILE_NAME);
        let log_path = run_dir.join(format!("{}.log", action_stem(&request.action)));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ActionError::Io { path, source }
        };

        fs::write(&inventory, render_inventory(plan, &self.ssh_key)).map_err(io_err(&inventory))?;

        let mut args = vec![
            "-i".to_string(),
            inventory.display().to_string(),
            action_file.display().to_string(),
            "--extra-vars".to_string(),
            self.extra_vars(plan, request),
        ];
        if !request.limit.is_empty() {
            args.push("--limit".to_string());
            args.push(request.limit.join(","));
        }

        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(io_err(&log_path))?;
        let stderr = log.try_clone().map_err(io_err(&log_path))?;

        info!(
            action = %request.action,
            cluster = %plan.cluster.name,
            limit = ?request.limit,
            log = %log_path.display(),
            "Running action"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ActionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let echo = self.output == OutputFormat::Raw;
        let mut log = tokio::fs::File::from_std(log);
        let header = format!("$ {} {}\n", self.program, args.join(" "));

        let pump = async {
            log.write_all(header.as_bytes()).await?;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if echo {
                        println!("{line}");
                    }
                    log.write_all(line.as_bytes()).await?;
                    log.write_all(b"\n").await?;
                }
            }
            log.flush().await?;
            let status = child.wait().await?;
            Ok::<ExitStatus, io::Error>(status)
        };

        let outcome = tokio::time::timeout(self.timeout, pump).await;
        let status = match outcome {
            Ok(result) => result.map_err(io_err(&log_path))?,
            Err(_) => {
                warn!(action = %request.action, "Action timed out after {:?}", self.timeout);
                let _ = child.kill().await;
                return Err(ActionError::Timeout {
                    action: request.action.clone(),
                    after: self.timeout,
                });
            }
        };

        if !status.success() {
            return Err(ActionError::Failed {
                action: request.action.clone(),
                status: status.code(),
                log: log_path,
            });
        }

        debug!(action = %request.action, elapsed_ms = started.elapsed().as_millis() as u64, "Action finished");
        Ok(ActionRun {
            action: request.action.clone(),
            run_dir: Some(run_dir),
            elapsed: started.elapsed(),
        })
    }
}

fn action_stem(action: &str) -> &str {
    action
        .strip_suffix(".yaml")
        .or_else(|| action.strip_suffix(".yml"))
        .unwrap_or(action)
}

/// INI inventory listing every node group with its addresses.
pub fn render_inventory(plan: &Plan, ssh_key: &Path) -> String {
    let ssh = &plan.cluster.ssh;
    let mut out = String::new();

    let _ = writeln!(out, "[all:vars]");
    let _ = writeln!(out, "ansible_ssh_user={}", ssh.user);
    let _ = writeln!(out, "ansible_ssh_private_key_file={}", ssh_key.display());
    let _ = writeln!(out, "ansible_port={}", ssh.ssh_port);

    for role in NodeRole::ALL {
        let _ = writeln!(out, "\n[{role}]");
        for node in &plan.group(role).nodes {
            let _ = write!(
                out,
                "{} ansible_host={} internal_ipv4={}",
                node.host,
                node.ip,
                node.internal_ip()
            );
            if !node.labels.is_empty() {
                let labels: Vec<String> = node.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                let _ = write!(out, " node_labels=\"{}\"", labels.join(","));
            }
            out.push('\n');
        }
    }

    out
}
