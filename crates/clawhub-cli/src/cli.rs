use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "clawhub",
    about = "Self-hosted control plane for fleets of OpenClaw bot instances",
    version
)]
pub struct Cli {
    /// Server URL used by remote commands.
    #[arg(long, env = "CLAWHUB_URL", global = true, default_value = "http://127.0.0.1:8780")]
    pub url: String,

    /// Operator token; defaults to the token file written by `serve`.
    #[arg(long, env = "CLAWHUB_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane: API, scheduler, and reconciler.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(long, default_value_t = 8780)]
        port: u16,

        /// In-memory store; all state lost on exit.
        #[arg(long)]
        ephemeral: bool,

        /// Path to the persistent store (default: ~/.clawhub/state.redb).
        #[arg(long)]
        store_path: Option<PathBuf>,

        /// Generate a fresh operator token even if one exists.
        #[arg(long)]
        rotate_token: bool,

        /// Dev mode: permits the insecure container runtime with a warning.
        #[arg(long)]
        dev: bool,

        /// Disable automatic reconcile after drift scans.
        #[arg(long)]
        no_auto_reconcile: bool,
    },

    /// Register a new bot instance from a manifest file.
    Create {
        /// Instance name (also the on-target profile name).
        name: String,

        /// Path to the manifest YAML.
        manifest: PathBuf,

        #[arg(long, value_enum, default_value = "local")]
        deployment: DeploymentArg,

        /// Provision immediately instead of waiting for scheduler pickup.
        #[arg(long)]
        now: bool,
    },

    /// Reconcile one instance.
    Reconcile { id: String },

    /// List all instances.
    List,

    /// Fleet summary.
    Status,

    /// Run a drift check (one instance, or the whole fleet).
    Drift {
        id: Option<String>,
    },

    /// Stop an instance; reconcile resumes it.
    Stop { id: String },

    /// Restart an instance's compute.
    Restart { id: String },

    /// Destroy an instance and all its resources.
    Destroy { id: String },

    /// Recent agent logs.
    Logs {
        id: String,

        #[arg(long, default_value_t = 100)]
        tail: u32,
    },

    /// Diagnostic checks for one instance.
    Doctor { id: String },

    /// Recent audit events.
    Events {
        /// Filter to one instance.
        #[arg(long)]
        instance: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum DeploymentArg {
    Local,
    Aws,
    Gcp,
    Azure,
}
