use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Drives version checks, build planning and the worker pool over one
/// recipe tree.
#[derive(Debug, Clone, Parser)]
#[command(name = "buildwarden", author, about, version)]
pub struct Args {
    /// Be verbose. Specify twice to be more verbose.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to config.toml.
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: Utf8PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check versions, plan, and build every pkgbase the planner selects.
    Batch,
    /// Build one recipe in-place, in this process, without a worker
    /// subprocess. Useful for local testing of a single recipe.
    Build {
        pkgbase: String,
    },
    /// Run the version checker only and print what it would schedule,
    /// without building anything.
    Recheck,
}
