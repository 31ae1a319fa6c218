//! In-memory credential state and the OAuth2 refresh-token exchange.

use crate::auth::jwt;
use crate::auth::store::CredentialStore;
use crate::core::config::Config;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credential {name} missing or empty in {}; run the device authorization flow first", .dir.display())]
    MissingCredential { name: &'static str, dir: PathBuf },
    #[error("identity token carries no usable expiry")]
    InvalidToken,
    #[error("token refresh failed: {detail}")]
    RefreshHttp { status: Option<u16>, detail: String },
    #[error("persisting credentials failed: {0}")]
    Persistence(#[source] std::io::Error),
}

/// The full credential triple plus derived bookkeeping.
///
/// `expiry_unix` comes exclusively from the identity token's `exp` claim;
/// a value of 0 marks the set as unusable for authentication.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub identity_token: String,
    pub refresh_token: String,
    pub access_token: String,
    pub expiry_unix: i64,
    pub last_refresh_unix: i64,
}

/// Owns the current credential set and decides when a refresh is due.
///
/// Mutated only through [`TokenManager::install`] after a refresh has been
/// persisted, so in-memory state can never run ahead of disk.
pub struct TokenManager {
    store: CredentialStore,
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    soft_margin_seconds: i64,
    clock_skew_seconds: i64,
    hard_interval_seconds: i64,
    current: CredentialSet,
}

impl TokenManager {
    /// Load the persisted credentials and derive the expiry.
    ///
    /// An undecodable identity token is not an error here; the caller must
    /// check [`TokenManager::is_valid`] and attempt an immediate refresh.
    pub fn load(
        config: &Config,
        store: CredentialStore,
        http: reqwest::Client,
        now: i64,
    ) -> Result<Self, TokenError> {
        let stored = store.load()?;
        let expiry_unix = jwt::expiry_unix(&stored.identity_token);
        Ok(Self {
            store,
            http,
            endpoint: config.tokens.endpoint.clone(),
            client_id: config.client_id.clone(),
            soft_margin_seconds: config.tokens.soft_margin_seconds,
            clock_skew_seconds: config.tokens.clock_skew_seconds,
            hard_interval_seconds: config.tokens.hard_interval_seconds,
            current: CredentialSet {
                identity_token: stored.identity_token,
                refresh_token: stored.refresh_token,
                access_token: stored.access_token,
                expiry_unix,
                last_refresh_unix: now,
            },
        })
    }

    pub fn is_valid(&self) -> bool {
        self.current.expiry_unix != 0
    }

    pub fn identity_token(&self) -> &str {
        &self.current.identity_token
    }

    pub fn expiry_unix(&self) -> i64 {
        self.current.expiry_unix
    }

    /// True once the token is close enough to expiry to warrant a refresh.
    pub fn needs_soft_refresh(&self, now: i64) -> bool {
        self.current.expiry_unix - now <= self.soft_margin_seconds + self.clock_skew_seconds
    }

    /// True once the last successful refresh is old enough, independent of
    /// the reported expiry. Guards against clock skew and provider-side
    /// lifetime changes.
    pub fn needs_hard_refresh(&self, now: i64) -> bool {
        now - self.current.last_refresh_unix >= self.hard_interval_seconds
    }

    /// Snapshot everything a refresh needs so the exchange can run as its
    /// own task while the manager stays untouched until `install`.
    pub fn begin_refresh(&self) -> RefreshRequest {
        RefreshRequest {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            client_id: self.client_id.clone(),
            refresh_token: self.current.refresh_token.clone(),
            store: self.store.clone(),
        }
    }

    /// Adopt a freshly persisted credential set.
    pub fn install(&mut self, mut set: CredentialSet, now: i64) {
        set.last_refresh_unix = now;
        self.current = set;
    }
}

/// Shared HTTP client for the token endpoint, with the bounded
/// connect/total timeouts the exchange contract requires.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .user_agent(concat!("cardata-bridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| anyhow::anyhow!("building HTTP client failed: {err}"))
}

/// One OAuth2 refresh-token exchange, detached from the manager.
pub struct RefreshRequest {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    refresh_token: String,
    store: CredentialStore,
}

impl RefreshRequest {
    /// Perform the exchange and persist the result.
    ///
    /// The three artifacts hit disk atomically before the new set is
    /// returned; on any failure the store is left with the previous
    /// content (a best-effort diagnostic dump aside).
    pub async fn execute(self) -> Result<CredentialSet, TokenError> {
        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|err| TokenError::RefreshHttp {
                status: None,
                detail: err.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| TokenError::RefreshHttp {
            status: Some(status.as_u16()),
            detail: err.to_string(),
        })?;
        self.store.write_debug_response(&body);

        if !status.is_success() {
            return Err(TokenError::RefreshHttp {
                status: Some(status.as_u16()),
                detail: format!("HTTP {}: {}", status.as_u16(), snippet(&body)),
            });
        }
        let json: serde_json::Value =
            serde_json::from_str(&body).map_err(|err| TokenError::RefreshHttp {
                status: Some(status.as_u16()),
                detail: format!("unparseable body: {err}"),
            })?;
        if json.get("error").is_some_and(|e| !e.is_null()) {
            let description = json
                .get("error_description")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("no description");
            return Err(TokenError::RefreshHttp {
                status: Some(status.as_u16()),
                detail: format!(
                    "{}: {}",
                    json.get("error").and_then(serde_json::Value::as_str).unwrap_or("error"),
                    description
                ),
            });
        }

        let identity_token = required_field(&json, status.as_u16(), "id_token")?;
        let refresh_token = required_field(&json, status.as_u16(), "refresh_token")?;
        let access_token = required_field(&json, status.as_u16(), "access_token")?;

        let expiry_unix = jwt::expiry_unix(&identity_token);
        if expiry_unix == 0 {
            return Err(TokenError::InvalidToken);
        }

        self.store
            .persist(&identity_token, &refresh_token, &access_token)
            .map_err(TokenError::Persistence)?;

        tracing::info!(
            expiry_unix,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "token refreshed via HTTP"
        );
        Ok(CredentialSet {
            identity_token,
            refresh_token,
            access_token,
            expiry_unix,
            last_refresh_unix: 0,
        })
    }
}

fn required_field(
    json: &serde_json::Value,
    status: u16,
    name: &'static str,
) -> Result<String, TokenError> {
    let value = json
        .get(name)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if value.is_empty() {
        return Err(TokenError::RefreshHttp {
            status: Some(status),
            detail: format!("{name} missing or empty in response"),
        });
    }
    Ok(value.to_string())
}

fn snippet(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}

/// Spacing gate for refresh attempts; at most one claim per window.
#[derive(Debug)]
pub struct RefreshGate {
    min_spacing_seconds: i64,
    last_attempt_unix: i64,
}

impl RefreshGate {
    pub fn new(min_spacing_seconds: i64) -> Self {
        Self {
            min_spacing_seconds,
            last_attempt_unix: 0,
        }
    }

    /// Claim an attempt slot; false while the previous attempt is too recent.
    pub fn try_claim(&mut self, now: i64) -> bool {
        if self.last_attempt_unix != 0 && now - self.last_attempt_unix < self.min_spacing_seconds {
            return false;
        }
        self.last_attempt_unix = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::fs;

    fn fake_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#).as_bytes());
        format!("{header}.{payload}.sig")
    }

    fn manager_with_expiry(expiry: i64, now: i64) -> (tempfile::TempDir, TokenManager) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("identity_token"), fake_jwt(expiry)).unwrap();
        fs::write(dir.path().join("refresh_token"), "refresh-opaque").unwrap();
        let config: Config = toml::from_str(
            r#"
account_id = "gcid-1234"
client_id = "client-5678"
"#,
        )
        .unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        let mgr = TokenManager::load(&config, store, reqwest::Client::new(), now).unwrap();
        (dir, mgr)
    }

    #[test]
    fn soft_refresh_boundary() {
        let now = 1_700_000_000;
        // margin 600 + skew 60 => due at 660 seconds before expiry
        let (_d, mgr) = manager_with_expiry(now + 660, now);
        assert!(mgr.needs_soft_refresh(now));
        let (_d, mgr) = manager_with_expiry(now + 661, now);
        assert!(!mgr.needs_soft_refresh(now));
    }

    #[test]
    fn hard_refresh_fires_despite_distant_expiry() {
        let now = 1_700_000_000;
        let (_d, mgr) = manager_with_expiry(now + 10_000, now - 2_700);
        assert!(!mgr.needs_soft_refresh(now));
        assert!(mgr.needs_hard_refresh(now));
        let (_d, mgr) = manager_with_expiry(now + 10_000, now - 2_699);
        assert!(!mgr.needs_hard_refresh(now));
    }

    #[test]
    fn load_keeps_invalid_token_flagged() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("identity_token"), "not-a-jwt").unwrap();
        fs::write(dir.path().join("refresh_token"), "refresh").unwrap();
        let config: Config = toml::from_str(
            r#"
account_id = "gcid-1234"
client_id = "client-5678"
"#,
        )
        .unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        let mgr = TokenManager::load(&config, store, reqwest::Client::new(), 0).unwrap();
        assert!(!mgr.is_valid());
    }

    #[test]
    fn install_updates_current_set() {
        let now = 1_700_000_000;
        let (_d, mut mgr) = manager_with_expiry(now + 3600, now);
        mgr.install(
            CredentialSet {
                identity_token: fake_jwt(now + 7200),
                refresh_token: "new-refresh".into(),
                access_token: "new-access".into(),
                expiry_unix: now + 7200,
                last_refresh_unix: 0,
            },
            now + 100,
        );
        assert_eq!(mgr.expiry_unix(), now + 7200);
        assert!(!mgr.needs_hard_refresh(now + 100));
        assert!(mgr.needs_hard_refresh(now + 100 + 2700));
    }

    #[test]
    fn gate_enforces_minimum_spacing() {
        let mut gate = RefreshGate::new(10);
        let mut claims = 0;
        // 100 due-checks within one second of simulated time
        for _ in 0..100 {
            if gate.try_claim(1_700_000_000) {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[test]
    fn gate_allows_one_claim_per_window() {
        let mut gate = RefreshGate::new(10);
        let mut claims = 0;
        for t in 0..100 {
            if gate.try_claim(1_700_000_000 + t) {
                claims += 1;
            }
        }
        assert_eq!(claims, 10);
    }
}
