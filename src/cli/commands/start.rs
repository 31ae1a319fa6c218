//! Start command - launches the bridge.

use crate::bridge::Bridge;
use crate::cli::args::StartArgs;
use crate::config::Config;
use crate::telemetry;
use crate::time::SystemClock;
use anyhow::Result;
use std::sync::Arc;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::resolve(args.config.as_deref())?;
    config.validate()?;
    telemetry::init_tracing(config.log_level.as_deref())?;

    let bridge = Bridge::new(Arc::new(config), SystemClock).await?;
    bridge.run().await
}
