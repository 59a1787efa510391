use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One ordered step of an installation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Plan validation and preflight checks.
    Validate,
    /// Certificate authority and node certificates.
    Certificates,
    /// Administrator kubeconfig.
    Credentials,
    /// Remote configuration of every node.
    Install,
    /// Post-install functional check.
    SmokeTest,
}

impl Phase {
    /// Phases in execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Validate,
        Phase::Certificates,
        Phase::Credentials,
        Phase::Install,
        Phase::SmokeTest,
    ];

    /// Stable phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Certificates => "certificates",
            Phase::Credentials => "credentials",
            Phase::Install => "install",
            Phase::SmokeTest => "smoke-test",
        }
    }

    /// Lifecycle state reached once this phase completes.
    pub fn completed_state(self) -> LifecycleState {
        match self {
            Phase::Validate => LifecycleState::Validated,
            Phase::Certificates => LifecycleState::CertificatesGenerated,
            Phase::Credentials => LifecycleState::CredentialsGenerated,
            Phase::Install => LifecycleState::Installed,
            Phase::SmokeTest => LifecycleState::SmokeTested,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    /// No phase has run.
    Created,
    /// Plan validated.
    Validated,
    /// Certificates in place.
    CertificatesGenerated,
    /// Kubeconfig written.
    CredentialsGenerated,
    /// Nodes configured.
    Installed,
    /// Smoke test passed.
    SmokeTested,
    /// Run finished successfully.
    Done,
    /// Run aborted in the given phase.
    Failed(Phase),
}

impl LifecycleState {
    /// True once no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Failed(_))
    }
}

/// Mutable execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Current lifecycle state.
    pub lifecycle: LifecycleState,
    /// Phases completed, in order.
    pub completed: Vec<Phase>,
    /// Phases intentionally not run.
    pub skipped: Vec<Phase>,
    /// Terminal error message, if the run failed.
    pub last_error: Option<String>,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    /// End of the run, once terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleState::Created,
            completed: Vec::new(),
            skipped: Vec::new(),
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl ExecutionState {
    /// Record a completed phase.
    pub fn advance(&mut self, phase: Phase) {
        self.completed.push(phase);
        self.lifecycle = phase.completed_state();
    }

    /// Record a phase that was not run.
    pub fn skip(&mut self, phase: Phase) {
        self.skipped.push(phase);
    }

    /// Abort in `phase`.
    pub fn fail(&mut self, phase: Phase, error: impl Into<String>) {
        self.lifecycle = LifecycleState::Failed(phase);
        self.last_error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Finish successfully.
    pub fn finish(&mut self) {
        self.lifecycle = LifecycleState::Done;
        self.finished_at = Some(Utc::now());
    }

    /// Whether `phase` completed in this run.
    pub fn has_completed(&self, phase: Phase) -> bool {
        self.completed.contains(&phase)
    }

    /// Persist state to JSON file.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Load state from JSON file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
