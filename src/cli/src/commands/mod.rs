//! CLI command definitions and dispatch.

mod build;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stratum_core::config::BuilderConfig;
use stratum_core::error::{BuildError, UNPOSITIONED_EXIT_CODE};

/// Stratum - layered, cache-aware image builder.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    /// Builder configuration file (default: <root>/config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a recipe
    Build(build::BuildArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI command to its handler.
pub async fn dispatch(cli: Cli, config: BuilderConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Process exit status for a command error.
///
/// Build errors carry their own positional code; anything else is reported
/// as unpositioned.
pub fn exit_code(error: &(dyn std::error::Error + 'static)) -> i32 {
    error
        .downcast_ref::<BuildError>()
        .map(BuildError::exit_code)
        .unwrap_or(UNPOSITIONED_EXIT_CODE)
}
