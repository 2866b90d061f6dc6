//! `stratum build` command - Build an image from a recipe.
//!
//! Parses the recipe, reuses cached layers where possible, executes the
//! rest, and emits the image manifest as JSON on stdout (or to `--output`).
//! Progress goes to stderr so stdout stays machine-readable.

use std::path::PathBuf;

use clap::Args;
use stratum_core::config::BuilderConfig;
use stratum_runtime::build::{BuildOptions, Builder};

use crate::output;

#[derive(Args)]
pub struct BuildArgs {
    /// Path to the recipe file
    pub recipe: PathBuf,

    /// Do not use cached layers for this build
    #[arg(long)]
    pub no_cache: bool,

    /// Suppress build output
    #[arg(short, long)]
    pub quiet: bool,

    /// Write the manifest to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

pub async fn execute(
    args: BuildArgs,
    config: BuilderConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = BuildOptions {
        no_cache: args.no_cache,
        quiet: args.quiet,
    };

    tracing::debug!(
        recipe = %args.recipe.display(),
        root = %config.root_dir.display(),
        no_cache = options.no_cache,
        "Starting build"
    );

    let builder = Builder::from_config(&config, options)?;
    let result = builder.build_file(&args.recipe).await?;
    let json = result.manifest.to_json_pretty()?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json)).map_err(|e| {
                format!("Failed to write manifest to {}: {}", path.display(), e)
            })?;
            if !args.quiet {
                eprintln!("Manifest written to {}", path.display());
            }
        }
        None => println!("{}", json),
    }

    if !args.quiet {
        eprintln!("{}", output::step_table(&result, builder.store()));
        eprintln!("{}", output::summary_line(&result));
    }

    Ok(())
}
