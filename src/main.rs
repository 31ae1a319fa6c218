//! cardata-bridge - unified CLI entrypoint.
//!
//! Usage:
//!   cardata-bridge start --config config/bridge.toml
//!   cardata-bridge check --config config/bridge.toml

use anyhow::Result;
use cardata_bridge::cli::commands::{run_check, run_start};
use cardata_bridge::cli::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Check(args) => run_check(args),
    }
}
