//! CLI module for vastnfs-k8s
//!
//! Provides kubectl-like subcommands:
//! - `vastnfs-k8s deploy` - Install or upgrade the module across the cluster
//! - `vastnfs-k8s status` - Show the module state of every node
//! - `vastnfs-k8s unload` - Tear down the NFS stack on nodes
//! - `vastnfs-k8s uninstall` - Remove the workload and unload everywhere
//! - `vastnfs-k8s logs` - Follow the logs of the current workers

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Default namespace of the module loader workload
pub const DEFAULT_NAMESPACE: &str = "vastnfs";

#[derive(Parser, Debug)]
#[command(name = "vastnfs-k8s")]
#[command(about = "Deploy and manage the VAST NFS kernel module across Kubernetes nodes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.vastnfs-k8s/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// kubeconfig context to use
    #[arg(long, global = true, env = "VASTNFS_KUBE_CONTEXT")]
    pub context: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Find `--env-file` before clap runs
///
/// The env file has to be loaded first so that env-backed arguments such as
/// `--context` see its values.
pub fn env_file_arg<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install or upgrade the module on every node
    Deploy(DeployArgs),

    /// Show the module state of every node
    Status(StatusArgs),

    /// Unload the NFS stack on nodes (all nodes when none are given)
    Unload(UnloadArgs),

    /// Delete the workload and unload the module everywhere
    Uninstall(UninstallArgs),

    /// Follow the logs of the current workers
    Logs(LogsArgs),
}

/// Arguments for the deploy command
#[derive(Parser, Debug)]
pub struct DeployArgs {
    /// Manifest template of the module loader workload (YAML)
    pub manifest: PathBuf,

    /// Module version the nodes should end up running
    #[arg(long = "target", value_name = "VERSION")]
    pub target_version: String,

    /// Image reference of the module loader
    #[arg(long)]
    pub image: String,

    /// Namespace to deploy to
    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Image pull secret that must exist in the namespace
    #[arg(long)]
    pub pull_secret: Option<String>,

    /// Secure boot signing key (requires --signing-cert)
    #[arg(long, requires = "signing_cert")]
    pub signing_key: Option<String>,

    /// Secure boot signing certificate (requires --signing-key)
    #[arg(long, requires = "signing_key")]
    pub signing_cert: Option<String>,

    /// The image ships pre-built modules
    #[arg(long)]
    pub prebuilt: bool,

    /// Skip the redeploy when every node already runs the target version
    #[arg(long)]
    pub fast_path: bool,

    /// Show the decision without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Also report whether every node runs this version
    #[arg(long, value_name = "VERSION")]
    pub expect: Option<String>,
}

/// Arguments for the unload command
#[derive(Parser, Debug)]
pub struct UnloadArgs {
    /// Nodes to unload (default: every node)
    pub nodes: Vec<String>,
}

/// Arguments for the uninstall command
///
/// Takes the same rendering inputs as `deploy` so the deleted resources are
/// exactly the ones that were applied.
#[derive(Parser, Debug)]
pub struct UninstallArgs {
    /// Manifest template the workload was deployed from
    pub manifest: PathBuf,

    /// Module version the workload was deployed with
    #[arg(long = "target", value_name = "VERSION")]
    pub target_version: String,

    /// Image reference the workload was deployed with
    #[arg(long)]
    pub image: String,

    /// Namespace the workload lives in
    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Image pull secret the workload was deployed with
    #[arg(long)]
    pub pull_secret: Option<String>,
}

/// Arguments for the logs command
#[derive(Parser, Debug)]
pub struct LogsArgs {
    /// Namespace of the workers
    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
}
