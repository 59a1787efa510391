// CLI Interface
//
// Command-line entry points: import, apply, add-node, step and info.

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cluster::{ClusterContext, ClusterInfo};
use crate::config::Config;
use crate::errors::Error;
use crate::import::{import, ImportOptions, ImportOutcome};
use crate::layout::AssetLayout;
use crate::phase::{Executor, OutputFormat, RunReport};
use crate::plan::{Node, NodeRole};

/// kluster - Cluster Lifecycle Orchestrator
#[derive(Parser, Debug)]
#[command(name = "kluster")]
#[command(author = "Kluster Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Import cluster plans, install them over SSH and track their state", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./kluster.toml when present)
    #[arg(global = true, long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Assets root, overriding the configuration and KLUSTER_ROOT
    #[arg(global = true, long = "root", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(global = true, long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import a plan file and its artifacts into the assets root
    Import {
        /// Plan file to import
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// SSH private key used to reach the nodes
        #[arg(long = "ssh-key", value_name = "FILE")]
        ssh_key: Option<PathBuf>,

        /// Previously generated assets directory
        #[arg(long = "generated-assets-dir", value_name = "DIR")]
        generated_assets_dir: Option<PathBuf>,

        /// Previous runs directory
        #[arg(long = "runs-dir", value_name = "DIR")]
        runs_dir: Option<PathBuf>,
    },

    /// Install an imported cluster
    Apply {
        /// Cluster name
        #[arg(value_name = "CLUSTER")]
        cluster: String,

        /// Force services to restart so they pick up configuration changes
        #[arg(long = "restart-services")]
        restart_services: bool,

        /// Action output format
        #[arg(long = "output", short = 'o', value_enum, default_value_t = OutputFormat::Simple)]
        output: OutputFormat,

        /// Skip the preflight checks
        #[arg(long = "skip-preflight")]
        skip_preflight: bool,

        /// Regenerate certificates even when valid ones exist
        #[arg(long = "force-certificates")]
        force_certificates: bool,
    },

    /// Add a worker, ingress or storage node to an installed cluster
    AddNode {
        /// Cluster name
        #[arg(value_name = "CLUSTER")]
        cluster: String,

        /// Roles of the new node
        #[arg(long = "roles", value_enum, value_delimiter = ',', required = true)]
        roles: Vec<NodeRole>,

        /// Host name of the new node
        #[arg(value_name = "HOST")]
        host: String,

        /// Address used to reach the node
        #[arg(value_name = "IP")]
        ip: String,

        /// Address used inside the cluster
        #[arg(value_name = "INTERNAL_IP")]
        internal_ip: Option<String>,

        /// Node labels as key=value pairs
        #[arg(long = "labels", value_delimiter = ',', value_parser = parse_label)]
        labels: Vec<(String, String)>,

        /// Force services to restart on the new node
        #[arg(long = "restart-services")]
        restart_services: bool,
    },

    /// Run a single named action against a cluster
    Step {
        /// Cluster name
        #[arg(value_name = "CLUSTER")]
        cluster: String,

        /// Action file name, e.g. kubernetes.yaml
        #[arg(value_name = "ACTION")]
        action: String,

        /// Action output format
        #[arg(long = "output", short = 'o', value_enum, default_value_t = OutputFormat::Simple)]
        output: OutputFormat,
    },

    /// Show the plan and recorded state of a cluster
    Info {
        /// Cluster name
        #[arg(value_name = "CLUSTER")]
        cluster: String,

        /// Output format
        #[arg(long = "output", short = 'o', value_enum, default_value_t = InfoFormat::Simple)]
        output: InfoFormat,
    },
}

/// Output format of `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InfoFormat {
    /// Human-readable summary
    Simple,
    /// The full record as JSON
    Json,
}

impl Cli {
    /// Run the CLI
    pub async fn run(self) -> AnyhowResult<()> {
        init_logging(self.verbose);

        let config = load_config(self.config.as_deref(), self.root)?;
        debug!(root = %config.assets.root.display(), "Configuration loaded");

        match self.command {
            Commands::Import {
                plan,
                ssh_key,
                generated_assets_dir,
                runs_dir,
            } => {
                let opts = ImportOptions {
                    plan_file: plan,
                    ssh_key,
                    generated_assets_dir,
                    runs_dir,
                };
                cmd_import_impl(config, opts)
            }
            Commands::Apply {
                cluster,
                restart_services,
                output,
                skip_preflight,
                force_certificates,
            } => {
                let flags = ApplyFlags {
                    restart_services,
                    output,
                    skip_preflight,
                    force_certificates,
                };
                cmd_apply_impl(config, &cluster, flags).await
            }
            Commands::AddNode {
                cluster,
                roles,
                host,
                ip,
                internal_ip,
                labels,
                restart_services,
            } => {
                let node = Node::new(host, ip, internal_ip.unwrap_or_default());
                let labels = labels.into_iter().collect();
                cmd_add_node_impl(config, &cluster, node, &roles, labels, restart_services).await
            }
            Commands::Step { cluster, action, output } => cmd_step_impl(config, &cluster, &action, output).await,
            Commands::Info { cluster, output } => cmd_info_impl(config, &cluster, output),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> AnyhowResult<Config> {
    let config = Config::load(path).context("Failed to load configuration")?;
    Ok(match root {
        Some(root) => config.with_root(root),
        None => config,
    })
}

/// Parse one `key=value` label.
fn parse_label(value: &str) -> std::result::Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("label {value:?} must have the form key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("label {value:?} has an empty key"));
    }
    Ok((key.to_string(), val.trim().to_string()))
}

/// Import command implementation
fn cmd_import_impl(config: Config, opts: ImportOptions) -> AnyhowResult<()> {
    let layout = AssetLayout::new(config.assets.root);
    let outcome = import(&layout, &opts).map_err(Error::from)?;

    match outcome {
        ImportOutcome::Imported { name } => {
            println!("Imported cluster {name:?} into {}", layout.cluster_dir(&name).display());
        }
        ImportOutcome::AlreadyImported { name } => {
            println!("Cluster {name:?} is already imported with an identical plan");
        }
    }
    Ok(())
}

struct ApplyFlags {
    restart_services: bool,
    output: OutputFormat,
    skip_preflight: bool,
    force_certificates: bool,
}

/// Apply command implementation
async fn cmd_apply_impl(config: Config, cluster: &str, flags: ApplyFlags) -> AnyhowResult<()> {
    let mut ctx = ClusterContext::open(config)?;
    let plan = ctx.require_cluster(cluster)?;

    let mut options = ctx.executor_options(cluster);
    options.restart_services = flags.restart_services;
    options.skip_preflight = flags.skip_preflight;
    options.force_certificates = flags.force_certificates;
    options.output_format = flags.output;

    let runner = ctx.action_runner(cluster, &plan, flags.output);
    let remote = ctx.ssh_client(cluster, &plan);
    let mut executor = Executor::new(runner, remote, options);

    let report = ctx.apply(cluster, &mut executor).await?;
    ctx.close()?;

    print_run_report(cluster, &report);
    Ok(())
}

/// Add-node command implementation
async fn cmd_add_node_impl(
    config: Config,
    cluster: &str,
    node: Node,
    roles: &[NodeRole],
    labels: BTreeMap<String, String>,
    restart_services: bool,
) -> AnyhowResult<()> {
    let mut ctx = ClusterContext::open(config)?;
    let plan = ctx.require_cluster(cluster)?;

    let mut options = ctx.executor_options(cluster);
    options.restart_services = restart_services;

    let runner = ctx.action_runner(cluster, &plan, OutputFormat::Simple);
    let remote = ctx.ssh_client(cluster, &plan);
    let mut executor = Executor::new(runner, remote, options);

    let host = node.host.clone();
    let extended = ctx.add_node(cluster, &mut executor, node, roles, labels).await?;
    ctx.close()?;

    println!(
        "Node {host:?} added to cluster {cluster:?} as {}",
        extended
            .roles_of(&host)
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

/// Step command implementation
async fn cmd_step_impl(config: Config, cluster: &str, action: &str, output: OutputFormat) -> AnyhowResult<()> {
    let ctx = ClusterContext::open(config)?;
    let plan = ctx.require_cluster(cluster)?;

    let mut options = ctx.executor_options(cluster);
    options.output_format = output;
    let runner = ctx.action_runner(cluster, &plan, output);
    let remote = ctx.ssh_client(cluster, &plan);
    let executor = Executor::new(runner, remote, options);

    let run = ctx.step(cluster, &executor, action).await?;
    ctx.close()?;

    println!("Action {} finished in {:.1}s", run.action, run.elapsed.as_secs_f64());
    if let Some(dir) = run.run_dir {
        println!("Logs: {}", dir.display());
    }
    Ok(())
}

/// Info command implementation
fn cmd_info_impl(config: Config, cluster: &str, output: InfoFormat) -> AnyhowResult<()> {
    let ctx = ClusterContext::open(config)?;
    let info = ctx.info(cluster)?;
    ctx.close()?;

    match output {
        InfoFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        InfoFormat::Simple => print!("{}", render_info(&info)),
    }
    Ok(())
}

fn print_run_report(cluster: &str, report: &RunReport) {
    for phase in &report.state.completed {
        println!("  {:<14} done", phase.as_str());
    }
    for phase in &report.state.skipped {
        println!("  {:<14} skipped", phase.as_str());
    }
    println!(
        "Certificates: {} generated, {} reused",
        report.certificates.generated.len(),
        report.certificates.reused.len()
    );
    println!("Cluster {cluster:?} installed. Kubeconfig: {}", report.kubeconfig.display());
}

fn render_info(info: &ClusterInfo) -> String {
    let mut out = format!("Cluster: {}\n", info.name);

    match &info.status {
        Some(status) => {
            out.push_str(&format!(
                "State: {} (desired {}), updated {}\n",
                status.current_state,
                status.desired_state,
                status.updated_at.to_rfc3339()
            ));
            if !status.matches_plan(&info.plan) {
                out.push_str("Note: the managed plan changed since the state was recorded\n");
            }
        }
        None => out.push_str("State: not applied yet\n"),
    }

    out.push_str("Nodes:\n");
    for role in NodeRole::ALL {
        for node in &info.plan.group(role).nodes {
            out.push_str(&format!(
                "  {:<8} {:<20} {:<16} {}\n",
                role.as_str(),
                node.host,
                node.ip,
                node.internal_ip()
            ));
        }
    }

    if let Some(run) = &info.last_run {
        out.push_str(&format!("Last run: {:?}", run.lifecycle));
        if let Some(error) = &run.last_error {
            out.push_str(&format!(" ({error})"));
        }
        out.push('\n');
    }
    out
}
