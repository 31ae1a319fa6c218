//! Backoff policy for the upstream session.
//!
//! The delay is a pure function of the failure class so independent bridge
//! instances can be reasoned about; the jitter desynchronizes their retries.

use rand::Rng;
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use std::time::Duration;

pub const JITTER_MS: i64 = 250;

/// Failure classes the upstream broker distinguishes for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonClass {
    QuotaExceeded,
    ServerBusy,
    Unspecified,
    NotAuthorized,
    Other,
}

/// Base delay before the next connect attempt for a failure class.
pub fn base_delay(class: ReasonClass) -> Duration {
    let secs = match class {
        ReasonClass::QuotaExceeded => 60,
        ReasonClass::ServerBusy | ReasonClass::Unspecified => 20,
        ReasonClass::NotAuthorized => 30,
        ReasonClass::Other => 5,
    };
    Duration::from_secs(secs)
}

/// Base delay in milliseconds with symmetric random jitter applied.
pub fn jittered_delay_ms(class: ReasonClass) -> i64 {
    let base = base_delay(class).as_millis() as i64;
    let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
    (base + jitter).max(0)
}

/// Map a CONNACK reason code onto a failure class.
pub fn classify_connect(code: ConnectReturnCode) -> ReasonClass {
    match code {
        ConnectReturnCode::QuotaExceeded => ReasonClass::QuotaExceeded,
        ConnectReturnCode::ServerBusy => ReasonClass::ServerBusy,
        ConnectReturnCode::UnspecifiedError => ReasonClass::Unspecified,
        ConnectReturnCode::NotAuthorized => ReasonClass::NotAuthorized,
        _ => ReasonClass::Other,
    }
}
