//! cardata-bridge CLI - command-line interface.
//!
//! - `cardata-bridge start` - Run the bridge
//! - `cardata-bridge check` - Validate configuration and stored credentials

mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, StartArgs};
