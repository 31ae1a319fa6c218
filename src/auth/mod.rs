//! Credential lifecycle.
//!
//! - `jwt` - expiry extraction from the identity token
//! - `store` - crash-safe on-disk credential store
//! - `tokens` - in-memory credential state and OAuth refresh

pub mod jwt;
pub mod store;
pub mod tokens;

pub use store::{CredentialStore, StoredCredentials};
pub use tokens::{CredentialSet, RefreshGate, RefreshRequest, TokenError, TokenManager};
