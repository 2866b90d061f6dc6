//! Stratum CLI entry point.

use clap::Parser;
use stratum_core::config::BuilderConfig;
use stratum_core::error::UNPOSITIONED_EXIT_CODE;
use tracing_subscriber::EnvFilter;

use stratum_cli::commands::{dispatch, exit_code, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match BuilderConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(UNPOSITIONED_EXIT_CODE);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(exit_code(e.as_ref()));
    }
}
