//! Check command - validates configuration and stored credentials.

use crate::auth::{jwt, CredentialStore};
use crate::cli::args::CheckArgs;
use crate::config::Config;
use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::resolve(args.config.as_deref())?;
    config.validate()?;
    println!("config ok: account {}", config.account_id);

    let store = CredentialStore::new(config.state_dir());
    let creds = store
        .load()
        .with_context(|| format!("credential store at {}", store.dir().display()))?;
    println!("credential store ok: {}", store.dir().display());

    let expiry = jwt::expiry_unix(&creds.identity_token);
    if expiry == 0 {
        anyhow::bail!("identity token carries no usable expiry; a refresh (or a new device authorization) is required");
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    if expiry <= now {
        println!("identity token EXPIRED {}s ago (the bridge will refresh on start)", now - expiry);
    } else {
        println!("identity token valid for another {}s", expiry - now);
    }
    Ok(())
}
