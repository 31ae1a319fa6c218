//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// cardata-bridge - BMW CarData streaming to local Mosquitto.
#[derive(Parser)]
#[command(name = "cardata-bridge")]
#[command(version)]
#[command(about = "Bridge BMW CarData streaming MQTT to a local broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bridge
    Start(StartArgs),

    /// Validate configuration and stored credentials, then exit
    Check(CheckArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file (falls back to BRIDGE_CONFIG, then config/bridge.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file (falls back to BRIDGE_CONFIG, then config/bridge.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
