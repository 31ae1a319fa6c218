use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

/// Top-level configuration for the bridge process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// CarData account identifier (GCID); upstream MQTT username.
    pub account_id: String,
    /// OAuth client identifier issued alongside the account.
    pub client_id: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Upstream (vendor) broker connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// PEM bundle used as the TLS trust store.
    #[serde(default = "default_ca_bundle")]
    pub ca_bundle: PathBuf,
    /// Seconds after a CONNECT is issued before the session is considered hung.
    #[serde(default = "default_connect_hang_seconds")]
    pub connect_hang_seconds: i64,
}

/// Local broker connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Local topic namespace and translation switches.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Namespace prefix for all local topics; a trailing `/` is enforced.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Enable per-field republish under `<prefix>vehicles/<vin>/<property>`.
    #[serde(default)]
    pub split: bool,
    /// Retain flag applied to raw and split republishes.
    #[serde(default)]
    pub retain: bool,
    /// Publish raw messages at `<prefix><suffix>` instead of `<prefix>raw/<suffix>`.
    #[serde(default)]
    pub legacy_raw: bool,
    /// Debounce window before the stable status channel reports a disconnect.
    #[serde(default = "default_status_stable_delay")]
    pub status_stable_delay_seconds: i64,
}

/// Token endpoint and refresh cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_endpoint")]
    pub endpoint: String,
    /// Override for the credential state directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Refresh this many seconds before the identity token expires.
    #[serde(default = "default_soft_margin")]
    pub soft_margin_seconds: i64,
    /// Safety margin for clock drift between this host and the issuer.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: i64,
    /// Refresh at least this often regardless of the reported expiry.
    #[serde(default = "default_hard_interval")]
    pub hard_interval_seconds: i64,
    /// Minimum spacing between consecutive refresh attempts.
    #[serde(default = "default_min_refresh_spacing")]
    pub min_refresh_spacing_seconds: i64,
}

impl Config {
    /// Load configuration from an explicit path, `BRIDGE_CONFIG`, or the default location.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os("BRIDGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        Self::load(&path)
    }

    /// Load configuration from a specific TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let mut cfg: Config = toml::from_str(&data)
            .with_context(|| format!("invalid TOML config {}", path_ref.display()))?;
        if !cfg.topics.prefix.is_empty() && !cfg.topics.prefix.ends_with('/') {
            cfg.topics.prefix.push('/');
        }
        Ok(cfg)
    }

    /// Validate schema-level invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if is_placeholder_id(&self.account_id) {
            bail!("account_id missing or placeholder; complete the device authorization flow and fill in your GCID");
        }
        if is_placeholder_id(&self.client_id) {
            bail!("client_id missing or placeholder; register a CarData client and fill in its id");
        }
        if self.upstream.host.is_empty() {
            bail!("upstream.host must be non-empty");
        }
        if self.tokens.endpoint.is_empty() {
            bail!("tokens.endpoint must be non-empty");
        }
        if self.topics.status_stable_delay_seconds < 0 {
            bail!("topics.status_stable_delay_seconds must be >= 0");
        }
        if self.tokens.min_refresh_spacing_seconds <= 0 {
            bail!("tokens.min_refresh_spacing_seconds must be > 0");
        }
        if self.upstream.connect_hang_seconds <= 0 {
            bail!("upstream.connect_hang_seconds must be > 0");
        }
        Ok(())
    }

    /// Directory holding the persisted credential artifacts.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.tokens.state_dir {
            return dir.clone();
        }
        if let Some(state) = dirs::state_dir() {
            return state.join("cardata-bridge");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".local/state/cardata-bridge");
        }
        // very rare fallback (no HOME): stay relative but consistent
        PathBuf::from("./.local/state/cardata-bridge")
    }
}

/// Reject empty identifiers and the all-ones placeholder shipped in sample configs.
fn is_placeholder_id(v: &str) -> bool {
    v.is_empty() || v.chars().all(|c| c == '1' || c == '-')
}

fn default_upstream_host() -> String {
    "customer.streaming-cardata.bmwgroup.com".into()
}

const fn default_upstream_port() -> u16 {
    9000
}

fn default_ca_bundle() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/ca-certificates.crt")
}

const fn default_connect_hang_seconds() -> i64 {
    30
}

fn default_local_host() -> String {
    "127.0.0.1".into()
}

const fn default_local_port() -> u16 {
    1883
}

fn default_prefix() -> String {
    "bmw/".into()
}

const fn default_status_stable_delay() -> i64 {
    5
}

fn default_token_endpoint() -> String {
    "https://customer.bmwgroup.com/gcdm/oauth/token".into()
}

const fn default_soft_margin() -> i64 {
    600
}

const fn default_clock_skew() -> i64 {
    60
}

const fn default_hard_interval() -> i64 {
    2700
}

const fn default_min_refresh_spacing() -> i64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            ca_bundle: default_ca_bundle(),
            connect_hang_seconds: default_connect_hang_seconds(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
            username: None,
            password: None,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            split: false,
            retain: false,
            legacy_raw: false,
            status_stable_delay_seconds: default_status_stable_delay(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            endpoint: default_token_endpoint(),
            state_dir: None,
            soft_margin_seconds: default_soft_margin(),
            clock_skew_seconds: default_clock_skew(),
            hard_interval_seconds: default_hard_interval(),
            min_refresh_spacing_seconds: default_min_refresh_spacing(),
        }
    }
}
