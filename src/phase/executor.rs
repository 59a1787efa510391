use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::layout::KEYS_DIR_NAME;
use crate::pki::{self, CertificateReport};
use crate::plan::{Node, NodeRole, Plan, ValidationReport};
use crate::remote::{ActionError, ActionRequest, ActionRun, ActionRunner, RemoteCommand};
use crate::verify::{verify_deployment, verify_node_ready};

use super::credentials::generate_kubeconfig;
use super::options::ExecutorOptions;
use super::state::{ExecutionState, Phase};

/// Action run during validation unless preflight is skipped.
pub const PREFLIGHT_ACTION: &str = "preflight.yaml";
/// Action that converges every node.
pub const INSTALL_ACTION: &str = "kubernetes.yaml";
/// Action exercising a freshly installed cluster.
pub const SMOKE_TEST_ACTION: &str = "smoketest.yaml";

/// Errors raised by the executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The plan failed validation; nothing ran remotely
    #[error("{0}")]
    Validation(ValidationReport),

    /// A phase failed and the remaining phases were not run
    #[error("{phase} phase failed: {cause:#}")]
    Phase {
        /// Failing phase
        phase: Phase,
        /// What went wrong
        cause: anyhow::Error,
    },

    /// The requested action is not known to the runner
    #[error("unknown action {action:?}")]
    UnknownAction {
        /// Requested action
        action: String,
        /// Actions the runner offers
        known: Vec<String>,
    },

    /// The node to add is already part of the plan
    #[error("host {host:?} is already part of the plan")]
    NodeExists {
        /// Host name
        host: String,
    },

    /// The roles requested for a new node are empty or not addable
    #[error("invalid roles for a new node: [{roles}]; allowed roles are worker, ingress and storage")]
    InvalidRoles {
        /// Roles as requested
        roles: String,
    },

    /// A standalone action failed
    #[error(transparent)]
    Action(#[from] ActionError),
}

/// Output of a full run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final state snapshot.
    pub state: ExecutionState,
    /// Certificates generated or reused.
    pub certificates: CertificateReport,
    /// Kubeconfig written by the credentials phase.
    pub kubeconfig: PathBuf,
    /// Actions applied, in order.
    pub actions: Vec<ActionRun>,
}

/// Drives a plan through the installation phases.
pub struct Executor<A: ActionRunner, R: RemoteCommand> {
    /// Mutable lifecycle state of the latest run.
    pub state: ExecutionState,
    options: ExecutorOptions,
    runner: A,
    remote: R,
}

impl<A: ActionRunner, R: RemoteCommand> Executor<A, R> {
    /// Create an executor over an action runner and a remote command channel.
    pub fn new(runner: A, remote: R, options: ExecutorOptions) -> Self {
        Self {
            state: ExecutionState::default(),
            options: options.normalized(),
            runner,
            remote,
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run every phase in order, stopping at the first failure.
    pub async fn run(&mut self, plan: &Plan) -> Result<RunReport, ExecutorError> {
        self.state = ExecutionState::default();
        let mut actions = Vec::new();
        info!(cluster = %plan.cluster.name, "Starting installation");

        self.validate(plan)?;
        if self.options.skip_preflight {
            info!("Skipping preflight checks");
        } else {
            let run = self
                .runner
                .run_action(plan, &ActionRequest::new(PREFLIGHT_ACTION))
                .await
                .map_err(|e| self.failed(Phase::Validate, e.into()))?;
            actions.push(run);
        }
        self.state.advance(Phase::Validate);

        let certificates = self
            .generate_certificates(plan, self.options.force_certificates)
            .map_err(|e| self.failed(Phase::Certificates, e))?;
        self.state.advance(Phase::Certificates);

        let kubeconfig = self
            .generate_credentials(plan)
            .map_err(|e| self.failed(Phase::Credentials, e))?;
        self.state.advance(Phase::Credentials);

        let run = self
            .install(plan, self.options.restart_services)
            .await
            .map_err(|e| self.failed(Phase::Install, e))?;
        actions.push(run);
        self.state.advance(Phase::Install);

        if plan.network_configured() {
            let run = self
                .run_smoke_test(plan)
                .await
                .map_err(|e| self.failed(Phase::SmokeTest, e))?;
            actions.push(run);
            self.state.advance(Phase::SmokeTest);
        } else {
            info!("Pod networking disabled, skipping smoke test");
            self.state.skip(Phase::SmokeTest);
        }

        self.state.finish();
        info!(cluster = %plan.cluster.name, "Installation finished");

        Ok(RunReport {
            state: self.state.clone(),
            certificates,
            kubeconfig,
            actions,
        })
    }

    /// Ensure the CA, node and admin certificates for `plan` exist.
    pub fn generate_certificates(&self, plan: &Plan, force: bool) -> anyhow::Result<CertificateReport> {
        let keys_dir = self.options.generated_assets_dir.join(KEYS_DIR_NAME);
        let report = pki::generate_certificates(plan, &keys_dir, force)?;
        info!(
            generated = report.generated.len(),
            reused = report.reused.len(),
            "Certificates ready"
        );
        Ok(report)
    }

    /// Write the admin kubeconfig.
    pub fn generate_credentials(&self, plan: &Plan) -> anyhow::Result<PathBuf> {
        let path = generate_kubeconfig(plan, &self.options.generated_assets_dir)?;
        info!(path = %path.display(), "Kubeconfig written");
        Ok(path)
    }

    /// Converge every node of the plan.
    pub async fn install(&self, plan: &Plan, restart_services: bool) -> anyhow::Result<ActionRun> {
        let request = ActionRequest::new(INSTALL_ACTION).restarting(restart_services);
        Ok(self.runner.run_action(plan, &request).await?)
    }

    /// Run the smoke test action, then wait for the expected rollouts.
    pub async fn run_smoke_test(&self, plan: &Plan) -> anyhow::Result<ActionRun> {
        let run = self
            .runner
            .run_action(plan, &ActionRequest::new(SMOKE_TEST_ACTION))
            .await?;

        let target = plan
            .first_master()
            .ok_or_else(|| anyhow::anyhow!("plan has no master node to verify from"))?;
        verify_deployment(
            &self.remote,
            target,
            &self.options.smoke_test_rollouts,
            &self.options.verify_policy,
        )
        .await?;

        Ok(run)
    }

    /// Add `node` with `roles` to the cluster and return the extended plan.
    ///
    /// Nothing is executed remotely when the host is already present or the
    /// extended plan does not validate.
    pub async fn add_node(
        &mut self,
        plan: &Plan,
        node: Node,
        roles: &[NodeRole],
        labels: BTreeMap<String, String>,
    ) -> Result<Plan, ExecutorError> {
        self.state = ExecutionState::default();

        if roles.is_empty() || roles.iter().any(|r| !r.can_be_added()) {
            return Err(ExecutorError::InvalidRoles {
                roles: roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(","),
            });
        }
        if plan.contains_host(&node.host) {
            return Err(ExecutorError::NodeExists { host: node.host });
        }

        let node = node.with_labels(labels);
        let extended = plan.with_node(&node, roles);
        self.validate(&extended)?;
        self.state.advance(Phase::Validate);
        info!(host = %node.host, ?roles, "Adding node");

        self.generate_certificates(&extended, false)
            .map_err(|e| self.failed(Phase::Certificates, e))?;
        self.state.advance(Phase::Certificates);

        let request = ActionRequest::new(INSTALL_ACTION)
            .limited_to([node.host.clone()])
            .restarting(self.options.restart_services);
        self.runner
            .run_action(&extended, &request)
            .await
            .map_err(|e| self.failed(Phase::Install, e.into()))?;

        let outcome = match extended.first_master() {
            Some(target) => verify_node_ready(&self.remote, target, &node.host, &self.options.verify_policy)
                .await
                .map_err(anyhow::Error::from),
            None => Err(anyhow::anyhow!("plan has no master node to verify from")),
        };
        outcome.map_err(|e| self.failed(Phase::Install, e))?;
        self.state.advance(Phase::Install);

        self.state.finish();
        info!(host = %node.host, "Node added");
        Ok(extended)
    }

    /// Run one named action outside the phase sequence.
    pub async fn step(&self, plan: &Plan, action: &str) -> Result<ActionRun, ExecutorError> {
        let known = self.runner.known_actions();
        if !known.iter().any(|k| k == action) {
            return Err(ExecutorError::UnknownAction {
                action: action.to_string(),
                known,
            });
        }

        plan.validate().into_result().map_err(ExecutorError::Validation)?;

        let request = ActionRequest::new(action).restarting(self.options.restart_services);
        let run = self.runner.run_action(plan, &request).await?;
        info!(action, elapsed = ?run.elapsed, "Action finished");
        Ok(run)
    }

    fn validate(&mut self, plan: &Plan) -> Result<(), ExecutorError> {
        plan.validate().into_result().map_err(|report| {
            warn!(violations = report.violations.len(), "Plan is invalid");
            self.state.fail(Phase::Validate, report.to_string());
            ExecutorError::Validation(report)
        })
    }

    fn failed(&mut self, phase: Phase, cause: anyhow::Error) -> ExecutorError {
        warn!(%phase, error = %format!("{cause:#}"), "Phase failed");
        self.state.fail(phase, format!("{cause:#}"));
        ExecutorError::Phase { phase, cause }
    }
}
