use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// How remote action output is presented.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Phase summaries only; full output goes to the run log.
    #[default]
    Simple,
    /// Stream action output as it is produced.
    Raw,
}

impl OutputFormat {
    /// Parse format from CLI string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Options for one executor.
///
/// `skip_preflight`, `restart_services` and `force_certificates` are
/// independent modifiers of single phases; none of them adds or removes a
/// lifecycle transition.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Directory receiving certificates and the kubeconfig.
    pub generated_assets_dir: PathBuf,
    /// Force services to restart during install.
    pub restart_services: bool,
    /// Do not run the preflight action during validation.
    pub skip_preflight: bool,
    /// Regenerate certificates even when valid ones exist.
    pub force_certificates: bool,
    /// Action output presentation.
    pub output_format: OutputFormat,
    /// Retry policy for remote verification.
    pub verify_policy: RetryPolicy,
    /// Rollouts the smoke test waits for, with their expected ready replicas.
    pub smoke_test_rollouts: HashMap<String, u32>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            generated_assets_dir: PathBuf::new(),
            restart_services: false,
            skip_preflight: false,
            force_certificates: false,
            output_format: OutputFormat::Simple,
            verify_policy: RetryPolicy::default(),
            smoke_test_rollouts: default_smoke_test_rollouts(),
        }
    }
}

fn default_smoke_test_rollouts() -> HashMap<String, u32> {
    HashMap::from([("kube-dns".to_string(), 1)])
}

impl ExecutorOptions {
    /// Options writing generated assets into `dir`.
    pub fn new(generated_assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            generated_assets_dir: generated_assets_dir.into(),
            ..Self::default()
        }
    }

    /// Clamp retry settings into a usable range.
    pub fn normalized(mut self) -> Self {
        if self.verify_policy.max_attempts == 0 {
            self.verify_policy.max_attempts = 1;
        }

        if !(self.verify_policy.multiplier.is_finite() && self.verify_policy.multiplier >= 1.0) {
            self.verify_policy.multiplier = 1.0;
        }

        if self.verify_policy.max_delay < self.verify_policy.initial_delay {
            self.verify_policy.max_delay = self.verify_policy.initial_delay;
        }

        self
    }

    /// Worst-case wall time verification may spend per rollout.
    pub fn verify_budget(&self) -> Duration {
        (1..self.verify_policy.attempts())
            .map(|n| self.verify_policy.delay_after(n))
            .sum()
    }
}
