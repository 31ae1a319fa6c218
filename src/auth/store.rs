//! On-disk credential store with atomic replace semantics.
//!
//! The three artifacts live as single files under the state directory. A
//! write stages the new content into a temp file in the same directory,
//! flushes it, renames it over the destination, and flushes the directory
//! entry, so a crash at any point leaves the old content or the new content
//! but never a truncated file.

use crate::auth::tokens::TokenError;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const IDENTITY_TOKEN_FILE: &str = "identity_token";
pub const REFRESH_TOKEN_FILE: &str = "refresh_token";
pub const ACCESS_TOKEN_FILE: &str = "access_token";
const DEBUG_RESPONSE_FILE: &str = "token_refresh_response.json";

/// Credentials as read from disk. The access token is diagnostic only and
/// may be absent.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub identity_token: String,
    pub refresh_token: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the persisted artifacts, trimming surrounding whitespace.
    ///
    /// Fails if the identity or refresh token is absent or empty; a missing
    /// access token is tolerated.
    pub fn load(&self) -> Result<StoredCredentials, TokenError> {
        let identity_token = self.read_trimmed(IDENTITY_TOKEN_FILE);
        let refresh_token = self.read_trimmed(REFRESH_TOKEN_FILE);
        let access_token = self.read_trimmed(ACCESS_TOKEN_FILE);
        if identity_token.is_empty() {
            return Err(TokenError::MissingCredential {
                name: IDENTITY_TOKEN_FILE,
                dir: self.dir.clone(),
            });
        }
        if refresh_token.is_empty() {
            return Err(TokenError::MissingCredential {
                name: REFRESH_TOKEN_FILE,
                dir: self.dir.clone(),
            });
        }
        Ok(StoredCredentials {
            identity_token,
            refresh_token,
            access_token,
        })
    }

    /// Persist all three artifacts with atomic replace semantics.
    pub fn persist(&self, identity: &str, refresh: &str, access: &str) -> io::Result<()> {
        self.write_atomic(IDENTITY_TOKEN_FILE, identity.as_bytes())?;
        self.write_atomic(REFRESH_TOKEN_FILE, refresh.as_bytes())?;
        self.write_atomic(ACCESS_TOKEN_FILE, access.as_bytes())?;
        Ok(())
    }

    /// Best-effort dump of the raw token-endpoint response for diagnostics.
    /// Never fails the refresh.
    pub fn write_debug_response(&self, body: &str) {
        let pretty = serde_json::from_str::<serde_json::Value>(body)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .map(|mut s| {
                s.push('\n');
                s
            })
            .unwrap_or_else(|_| body.to_string());
        if let Err(err) = fs::write(self.dir.join(DEBUG_RESPONSE_FILE), pretty) {
            tracing::debug!("writing {DEBUG_RESPONSE_FILE} failed: {err}");
        }
    }

    fn read_trimmed(&self, name: &str) -> String {
        fs::read_to_string(self.dir.join(name))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.stage(name, data)?;
        self.commit(tmp, name)
    }

    /// Stage the new content into a flushed temp file in the target directory.
    fn stage(&self, name: &str, data: &[u8]) -> io::Result<NamedTempFile> {
        let mut tmp = tempfile::Builder::new()
            .prefix(name)
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }
        Ok(tmp)
    }

    /// Rename the staged file over the destination and flush the directory
    /// entry so the rename itself survives a crash.
    fn commit(&self, tmp: NamedTempFile, name: &str) -> io::Result<()> {
        tmp.persist(self.dir.join(name)).map_err(|e| e.error)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        store.persist("old-identity", "old-refresh", "old-access").unwrap();
        (dir, store)
    }

    #[test]
    fn load_round_trips_trimmed_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join(IDENTITY_TOKEN_FILE), "  id-token\n").unwrap();
        fs::write(dir.path().join(REFRESH_TOKEN_FILE), "refresh\r\n").unwrap();
        let creds = store.load().unwrap();
        assert_eq!(creds.identity_token, "id-token");
        assert_eq!(creds.refresh_token, "refresh");
        assert_eq!(creds.access_token, "");
    }

    #[test]
    fn load_fails_on_missing_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join(REFRESH_TOKEN_FILE), "refresh").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            TokenError::MissingCredential { name, .. } if name == IDENTITY_TOKEN_FILE
        ));
    }

    #[test]
    fn load_fails_on_empty_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join(IDENTITY_TOKEN_FILE), "id").unwrap();
        fs::write(dir.path().join(REFRESH_TOKEN_FILE), "   \n").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            TokenError::MissingCredential { name, .. } if name == REFRESH_TOKEN_FILE
        ));
    }

    #[test]
    fn persist_replaces_all_three() {
        let (dir, store) = seeded_store();
        store.persist("new-identity", "new-refresh", "new-access").unwrap();
        let creds = store.load().unwrap();
        assert_eq!(creds.identity_token, "new-identity");
        assert_eq!(creds.refresh_token, "new-refresh");
        assert_eq!(creds.access_token, "new-access");
        drop(dir);
    }

    // A crash between temp-write and rename must leave the destination
    // either fully old or fully new, never truncated. Dropping the staged
    // temp file without committing simulates the crash at every byte
    // boundary of the new content.
    #[test]
    fn crash_before_commit_leaves_old_content() {
        let (_dir, store) = seeded_store();
        let new_content = b"brand-new-identity-token-value";
        for cut in 0..=new_content.len() {
            let tmp = store.stage(IDENTITY_TOKEN_FILE, &new_content[..cut]).unwrap();
            drop(tmp); // crash: staged bytes vanish, destination untouched
            let creds = store.load().unwrap();
            assert_eq!(creds.identity_token, "old-identity", "cut at {cut}");
        }
    }

    #[test]
    fn crash_after_commit_leaves_new_content() {
        let (_dir, store) = seeded_store();
        let tmp = store.stage(IDENTITY_TOKEN_FILE, b"new-identity").unwrap();
        store.commit(tmp, IDENTITY_TOKEN_FILE).unwrap();
        let creds = store.load().unwrap();
        assert_eq!(creds.identity_token, "new-identity");
    }

    #[test]
    fn stray_temp_files_do_not_affect_load() {
        let (_dir, store) = seeded_store();
        fs::write(
            store.dir().join(format!("{IDENTITY_TOKEN_FILE}.garbage.tmp")),
            "partial",
        )
        .unwrap();
        let creds = store.load().unwrap();
        assert_eq!(creds.identity_token, "old-identity");
    }

    #[cfg(unix)]
    #[test]
    fn persisted_files_are_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = seeded_store();
        let mode = fs::metadata(store.dir().join(IDENTITY_TOKEN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
