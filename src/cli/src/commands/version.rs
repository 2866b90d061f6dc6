//! `stratum version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("stratum version {}", stratum_core::VERSION);
    println!("runtime {}", stratum_runtime::VERSION);
    Ok(())
}
