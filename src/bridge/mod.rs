//! Broker sessions and orchestration.
//!
//! - `backoff` - reason-class delay table with jitter
//! - `translate` - raw and split message translation
//! - `status` - immediate and debounced connectivity channels
//! - `session` - MQTT session construction and pump tasks
//! - `supervisor` - tick loop, backoff fence, watchdog, rebuilds

pub mod backoff;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod translate;

pub use supervisor::Bridge;
