//! Per-command cluster context.
//!
//! [`ClusterContext`] owns everything one command invocation needs: the loaded
//! configuration, the asset layout and the open state store. It is created once
//! at command start and closed at the end, so no handle outlives the command.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::layout::AssetLayout;
use crate::phase::{ExecutionState, Executor, ExecutorOptions, OutputFormat, RunReport};
use crate::plan::{Node, NodeRole, Plan};
use crate::remote::{ActionRun, ActionRunner, CommandActionRunner, RemoteCommand, SshClient};
use crate::storage::{ClusterState, ClusterStatus, ClusterStore};

/// State of the latest apply, kept in the cluster's runs directory.
pub const LAST_RUN_FILE_NAME: &str = "last-run.json";

/// Everything known about one managed cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Managed plan
    pub plan: Plan,
    /// Recorded status, absent until the first apply
    pub status: Option<ClusterStatus>,
    /// Phase record of the latest apply
    pub last_run: Option<ExecutionState>,
}

/// Configuration, layout and state store for one command.
pub struct ClusterContext {
    config: Config,
    layout: AssetLayout,
    store: ClusterStore,
}

impl ClusterContext {
    /// Open the state store under the configured assets root.
    pub fn open(config: Config) -> Result<Self> {
        let layout = AssetLayout::new(config.assets.root.clone());
        let store = ClusterStore::open(layout.store_path())?;
        Ok(Self { config, layout, store })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Asset layout in effect.
    pub fn layout(&self) -> &AssetLayout {
        &self.layout
    }

    /// The open state store.
    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    /// Release the state store.
    pub fn close(self) -> Result<()> {
        self.store.close()?;
        Ok(())
    }

    /// Plan of an imported cluster.
    pub fn require_cluster(&self, name: &str) -> Result<Plan> {
        if !self.layout.cluster_exists(name) {
            return Err(Error::cluster_not_found(name));
        }
        Ok(Plan::read(self.layout.plan_path(name))?)
    }

    /// Executor options for `name`, with verification retries from the configuration.
    pub fn executor_options(&self, name: &str) -> ExecutorOptions {
        ExecutorOptions {
            verify_policy: self.config.verify.retry_policy(),
            ..ExecutorOptions::new(self.layout.generated_dir(name))
        }
    }

    /// SSH key for `name`: the imported key if present, else the plan's own.
    pub fn ssh_key(&self, name: &str, plan: &Plan) -> PathBuf {
        let imported = self.layout.ssh_key_path(name);
        if imported.is_file() {
            imported
        } else {
            PathBuf::from(&plan.cluster.ssh.ssh_key)
        }
    }

    /// SSH command channel to the nodes of `plan`.
    pub fn ssh_client(&self, name: &str, plan: &Plan) -> SshClient {
        SshClient::new(&self.config.remote, &plan.cluster.ssh, self.ssh_key(name, plan))
    }

    /// Action runner writing its runs under `name`'s runs directory.
    pub fn action_runner(&self, name: &str, plan: &Plan, output: OutputFormat) -> CommandActionRunner {
        CommandActionRunner::new(&self.config.actions, &self.layout, name, self.ssh_key(name, plan)).with_output(output)
    }

    /// Install `name` and record the outcome.
    ///
    /// A status is written whether or not the run succeeds; when both the run
    /// and the write fail the returned error carries both.
    pub async fn apply<A: ActionRunner, R: RemoteCommand>(
        &mut self,
        name: &str,
        executor: &mut Executor<A, R>,
    ) -> Result<RunReport> {
        let plan = self.require_cluster(name)?;
        let status = plan.to_status();

        let outcome = executor.run(&plan).await;
        let current = match &outcome {
            Ok(_) => ClusterState::Installed,
            Err(_) => ClusterState::InstallFailed,
        };

        let last_run = self.layout.runs_dir(name).join(LAST_RUN_FILE_NAME);
        if let Err(e) = executor.state.save_to_path(&last_run) {
            warn!(path = %last_run.display(), error = %e, "Failed to save run state");
        }

        let recorded = self.store.put(name, &status.with_current_state(current));
        info!(cluster = name, state = %current, "Recorded cluster status");

        match (outcome, recorded) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(persistence)) => Err(persistence.into()),
            (Err(cause), Ok(())) => Err(cause.into()),
            (Err(cause), Err(persistence)) => Err(Error::record_failed(cause.into(), persistence)),
        }
    }

    /// Add a node to `name`, then persist the extended plan and its status.
    ///
    /// Nothing is written when the executor fails.
    pub async fn add_node<A: ActionRunner, R: RemoteCommand>(
        &mut self,
        name: &str,
        executor: &mut Executor<A, R>,
        node: Node,
        roles: &[NodeRole],
        labels: BTreeMap<String, String>,
    ) -> Result<Plan> {
        let plan = self.require_cluster(name)?;
        let extended = executor.add_node(&plan, node, roles, labels).await?;

        extended.write(self.layout.plan_path(name))?;
        let status = extended.to_status().with_current_state(ClusterState::Installed);
        self.store.put(name, &status)?;

        Ok(extended)
    }

    /// Run one named action against `name`.
    pub async fn step<A: ActionRunner, R: RemoteCommand>(
        &self,
        name: &str,
        executor: &Executor<A, R>,
        action: &str,
    ) -> Result<ActionRun> {
        let plan = self.require_cluster(name)?;
        Ok(executor.step(&plan, action).await?)
    }

    /// Plan, recorded status and latest run of `name`.
    pub fn info(&self, name: &str) -> Result<ClusterInfo> {
        let plan = self.require_cluster(name)?;
        let status = self.store.get(name)?;
        let last_run = ExecutionState::load_from_path(&self.layout.runs_dir(name).join(LAST_RUN_FILE_NAME)).ok();

        Ok(ClusterInfo {
            name: name.to_string(),
            plan,
            status,
            last_run,
        })
    }
}
