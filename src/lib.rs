#![forbid(unsafe_code)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]

//! # cardata-bridge
//!
//! Bridges the BMW CarData streaming broker (MQTT v5 over TLS) to a locally
//! operated Mosquitto broker, republishing every message under a local topic
//! namespace while keeping the OAuth credential valid and the upstream
//! session alive across rate limits, network failures, and token expiry.
//!
//! ## Layout
//!
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//! - `auth` - Credential store, JWT expiry decoding, token refresh
//! - `bridge` - Sessions, backoff, translation, status, supervisor
//! - `ops::telemetry` - Logging initialization
//! - `cli` - Command-line entry points

// Core infrastructure
pub mod core;

// Credential lifecycle
pub mod auth;

// Broker sessions and orchestration
pub mod bridge;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, time};
pub use ops::telemetry;
