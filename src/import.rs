//! Import of externally produced plans.
//!
//! An import merges a plan file and its optional artifacts (SSH key, generated
//! assets, action runs) into the managed layout of the cluster it names. Every
//! artifact is first copied to a staging name next to its destination and then
//! renamed into place; the plan goes last, so a present plan file means the
//! import completed. Re-importing the same plan is a no-op and importing a
//! different plan under an existing name is refused.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::layout::AssetLayout;
use crate::plan::{is_valid_cluster_name, Plan, PlanError};

/// Errors that can occur while importing
#[derive(Debug, Error)]
pub enum ImportError {
    /// A different plan is already managed under this name
    #[error("cluster {name:?} already exists with a different plan at {}", path.display())]
    Conflict {
        /// Cluster name
        name: String,
        /// Managed plan path
        path: PathBuf,
    },

    /// The source or managed plan could not be read
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A source artifact given on the command line does not exist
    #[error("{what} not found at {}", path.display())]
    MissingSource {
        /// Artifact kind
        what: &'static str,
        /// Path given
        path: PathBuf,
    },

    /// The plan's cluster name cannot be used as a directory name
    #[error("invalid cluster name {name:?}")]
    InvalidName {
        /// Name found in the plan
        name: String,
    },

    /// Copy or rename failed
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Result type for import operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Sources for one import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Plan file to import
    pub plan_file: PathBuf,
    /// Private key for node access
    pub ssh_key: Option<PathBuf>,
    /// Previously generated assets directory
    pub generated_assets_dir: Option<PathBuf>,
    /// Previous action runs directory
    pub runs_dir: Option<PathBuf>,
}

impl ImportOptions {
    /// Import `plan_file` alone.
    pub fn new(plan_file: impl Into<PathBuf>) -> Self {
        Self {
            plan_file: plan_file.into(),
            ..Default::default()
        }
    }

    /// Also import an SSH key.
    pub fn with_ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(path.into());
        self
    }

    /// Also import a generated assets directory.
    pub fn with_generated_assets_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.generated_assets_dir = Some(path.into());
        self
    }

    /// Also import a runs directory.
    pub fn with_runs_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(path.into());
        self
    }
}

/// What an import did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Artifacts were copied into the managed layout
    Imported {
        /// Cluster name
        name: String,
    },
    /// The identical plan was already managed; nothing changed
    AlreadyImported {
        /// Cluster name
        name: String,
    },
}

impl ImportOutcome {
    /// Cluster name.
    pub fn name(&self) -> &str {
        match self {
            ImportOutcome::Imported { name } | ImportOutcome::AlreadyImported { name } => name,
        }
    }
}

/// Import a plan and its artifacts under `layout`.
pub fn import(layout: &AssetLayout, opts: &ImportOptions) -> Result<ImportOutcome> {
    let plan = Plan::read(&opts.plan_file)?;
    let name = plan.cluster.name.clone();
    if name.is_empty() || !is_valid_cluster_name(&name) {
        return Err(ImportError::InvalidName { name });
    }

    let dest_plan = layout.plan_path(&name);
    if Plan::exists(&dest_plan) {
        let existing = Plan::read(&dest_plan)?;
        if Plan::equal(&existing, &plan) {
            info!(cluster = %name, "Plan already imported");
            return Ok(ImportOutcome::AlreadyImported { name });
        }
        return Err(ImportError::Conflict {
            name,
            path: dest_plan,
        });
    }

    check_source(opts.ssh_key.as_deref(), "ssh key", false)?;
    check_source(opts.generated_assets_dir.as_deref(), "generated assets directory", true)?;
    check_source(opts.runs_dir.as_deref(), "runs directory", true)?;

    let cluster_dir = layout.cluster_dir(&name);
    fs::create_dir_all(&cluster_dir).map_err(io_err(&cluster_dir))?;

    if let Some(key) = &opts.ssh_key {
        let dest = layout.ssh_key_path(&name);
        stage_and_replace(key, &dest)?;
        restrict_permissions(&dest)?;
    }
    if let Some(dir) = &opts.generated_assets_dir {
        stage_and_replace(dir, &layout.generated_dir(&name))?;
    }
    if let Some(dir) = &opts.runs_dir {
        stage_and_replace(dir, &layout.runs_dir(&name))?;
    }

    stage_and_replace(&opts.plan_file, &dest_plan)?;

    info!(cluster = %name, path = %dest_plan.display(), "Imported plan");
    Ok(ImportOutcome::Imported { name })
}

fn check_source(path: Option<&Path>, what: &'static str, dir: bool) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let present = if dir { path.is_dir() } else { path.is_file() };
    if present {
        Ok(())
    } else {
        Err(ImportError::MissingSource {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Copy `src` to a staging name beside `dest`, then rename it over `dest`.
///
/// Anything already at `dest` is replaced whole.
fn stage_and_replace(src: &Path, dest: &Path) -> Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = dest.with_file_name(format!(".{}.importing.{}", file_name, std::process::id()));

    remove_path(&staging)?;
    if let Err(e) = copy_path(src, &staging) {
        let _ = remove_path(&staging);
        return Err(e);
    }

    if fs::symlink_metadata(dest).is_ok() {
        debug!(path = %dest.display(), "Replacing leftover artifact");
        remove_path(dest)?;
    }
    fs::rename(&staging, dest).map_err(io_err(dest))?;
    Ok(())
}

fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        fs::copy(src, dst).map_err(io_err(dst))?;
        return Ok(());
    }

    fs::create_dir_all(dst).map_err(io_err(dst))?;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            ImportError::Io {
                path,
                source: e.into(),
            }
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(io_err(&out))?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::copy(entry.path(), &out).map_err(io_err(&out))?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_err(path)),
        Ok(_) => fs::remove_file(path).map_err(io_err(path)),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err(path))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ImportError {
    let path = path.to_path_buf();
    move |source| ImportError::Io { path, source }
}
