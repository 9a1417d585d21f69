//! Commands for the Capstan CLI
//!

use clap::{self, Parser, Subcommand};

use capstan_core::logging::LevelFilter;

/// Capstan: identity-driven access governance for QuickSight
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None, arg_required_else_help = true)]
pub(crate) struct CapstanArgs {
    #[clap(subcommand)]
    pub(crate) command: CapstanCommand,
    #[clap(global = true, short = 'v', long)]
    pub(crate) log_level: Option<LevelFilter>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CapstanCommand {
    /// Create a Capstan project in a new directory
    Init {
        /// Project name
        project_name: Option<String>,
        /// Overwrite the project config if it exists
        #[clap(short, long, value_parser, default_value = "false")]
        overwrite: bool,
    },
    /// Fetch the identity snapshot and persist it to the snapshot store
    Fetch,
    /// Diff desired state against the target without applying anything
    Diff,
    /// Run one lease-guarded reconciliation cycle
    Apply,
    /// Reconcile on a fixed schedule until interrupted
    Run {
        /// Seconds between cycles (defaults to the configured interval)
        #[clap(short, long, value_parser)]
        every: Option<u64>,
    },
}
