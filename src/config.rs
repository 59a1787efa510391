// Configuration
//
// Optional `kluster.toml` settings for the asset tree, the remote channel, the
// action runner and verification retries. Every section has defaults, so a
// missing file is equivalent to an empty one.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "kluster.toml";

/// Environment variable overriding `assets.root`
pub const ROOT_ENV_VAR: &str = "KLUSTER_ROOT";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Asset tree settings
    pub assets: AssetsConfig,

    /// SSH channel settings
    pub remote: RemoteConfig,

    /// Remote action runner settings
    pub actions: ActionsConfig,

    /// Verification retry settings
    pub verify: VerifyConfig,
}

impl Config {
    /// Load configuration
    ///
    /// Reads `path` when given (the file must exist), otherwise `kluster.toml`
    /// in the working directory if present, otherwise defaults. `KLUSTER_ROOT`
    /// is applied on top and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Config::default()
                }
            }
        };

        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            if !root.trim().is_empty() {
                config.assets.root = PathBuf::from(root);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse one TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Save configuration as pretty TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Override the assets root, as `--root` does.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.assets.root = root.into();
        self
    }

    /// Reject values no run could work with.
    pub fn validate(&self) -> Result<()> {
        if self.assets.root.as_os_str().is_empty() {
            bail!("assets.root must not be empty");
        }
        if self.remote.ssh_binary.trim().is_empty() {
            bail!("remote.ssh_binary must not be empty");
        }
        if self.remote.command_timeout_secs == 0 {
            bail!("remote.command_timeout_secs must be greater than zero");
        }
        if self.actions.program.trim().is_empty() {
            bail!("actions.program must not be empty");
        }
        if self.actions.timeout_secs == 0 {
            bail!("actions.timeout_secs must be greater than zero");
        }
        if !(self.verify.multiplier.is_finite() && self.verify.multiplier >= 1.0) {
            bail!("verify.multiplier must be a finite number >= 1.0");
        }
        if self.verify.max_delay_ms < self.verify.initial_delay_ms {
            bail!("verify.max_delay_ms must not be smaller than verify.initial_delay_ms");
        }
        Ok(())
    }
}

/// Asset tree settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Root directory holding every managed cluster
    pub root: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("clusters"),
        }
    }
}

/// SSH channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// SSH client binary
    pub ssh_binary: String,

    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,

    /// Verify host keys against known_hosts
    pub strict_host_key_checking: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            command_timeout_secs: 60,
            strict_host_key_checking: false,
        }
    }
}

impl RemoteConfig {
    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Remote action runner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Program invoked per action
    pub program: String,

    /// Directory holding one file per known action
    pub playbooks_dir: PathBuf,

    /// Per-action timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            program: "ansible-playbook".to_string(),
            playbooks_dir: PathBuf::from("ansible/playbooks"),
            timeout_secs: 3600,
        }
    }
}

impl ActionsConfig {
    /// Per-action timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Verification retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Attempts per rollout or node check
    pub max_attempts: u32,

    /// First delay in milliseconds
    pub initial_delay_ms: u64,

    /// Delay cap in milliseconds
    pub max_delay_ms: u64,

    /// Delay growth factor
    pub multiplier: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl VerifyConfig {
    /// Retry policy for verification
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}
