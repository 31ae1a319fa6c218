//! Per-message topic and payload translation.
//!
//! Upstream topics arrive as `<account-id>/<suffix>`. Every message is
//! republished verbatim under the local namespace; split mode additionally
//! fans the JSON `data` object out into one message per vehicle property.

use crate::core::config::TopicConfig;
use thiserror::Error;

const VIN_LENGTH: usize = 17;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("vehicle identifier {0:?} is not {VIN_LENGTH} characters")]
    InvalidIdentifier(String),
    #[error("no data object in payload")]
    NoData,
}

/// One outbound local publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Stateless topic/payload mapper; recomputed per message.
#[derive(Debug, Clone)]
pub struct Translator {
    prefix: String,
    split: bool,
    retain: bool,
    legacy_raw: bool,
}

impl Translator {
    pub fn new(topics: &TopicConfig) -> Self {
        Self {
            prefix: topics.prefix.clone(),
            split: topics.split,
            retain: topics.retain,
            legacy_raw: topics.legacy_raw,
        }
    }

    pub fn split_enabled(&self) -> bool {
        self.split
    }

    /// The unconditional verbatim republish.
    pub fn raw(&self, topic: &str, payload: &[u8]) -> OutMessage {
        let out_topic = match topic.split_once('/') {
            Some((_, suffix)) if !suffix.is_empty() => {
                if self.legacy_raw {
                    format!("{}{}", self.prefix, suffix)
                } else {
                    format!("{}raw/{}", self.prefix, suffix)
                }
            }
            _ => {
                if self.legacy_raw && !topic.is_empty() {
                    format!("{}{}", self.prefix, topic)
                } else {
                    format!("{}raw", self.prefix)
                }
            }
        };
        OutMessage {
            topic: out_topic,
            payload: payload.to_vec(),
            retain: self.retain,
        }
    }

    /// Fan the payload's `data` object out into per-property messages.
    ///
    /// Each entry that carries a `value` member is republished as its full
    /// JSON object (value plus optional unit and timestamp); serde_json
    /// keeps object keys ordered, so the serialization is deterministic.
    pub fn split(&self, topic: &str, payload: &[u8]) -> Result<Vec<OutMessage>, TranslationError> {
        let parsed: serde_json::Value = serde_json::from_slice(payload)?;

        let vin = match parsed.get("vin").and_then(serde_json::Value::as_str) {
            Some(vin) => vin.to_string(),
            None => vin_from_topic(topic).unwrap_or_default(),
        };
        if vin.len() != VIN_LENGTH {
            return Err(TranslationError::InvalidIdentifier(vin));
        }

        let data = parsed
            .get("data")
            .and_then(serde_json::Value::as_object)
            .ok_or(TranslationError::NoData)?;

        let mut out = Vec::new();
        for (property, entry) in data {
            if entry.get("value").is_none() {
                continue;
            }
            out.push(OutMessage {
                topic: format!("{}vehicles/{}/{}", self.prefix, vin, property),
                payload: serde_json::to_vec(entry)?,
                retain: self.retain,
            });
        }
        Ok(out)
    }
}

/// Topic path segment immediately following the account id.
fn vin_from_topic(topic: &str) -> Option<String> {
    let (_, rest) = topic.split_once('/')?;
    let vin = match rest.split_once('/') {
        Some((vin, _)) => vin,
        None => rest,
    };
    Some(vin.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator(split: bool, retain: bool, legacy_raw: bool) -> Translator {
        Translator {
            prefix: "bmw/".into(),
            split,
            retain,
            legacy_raw,
        }
    }

    #[test]
    fn raw_republish_under_raw_subtree() {
        let t = translator(false, false, false);
        let out = t.raw("ACC123/WBA12345678901234/status", b"payload");
        assert_eq!(out.topic, "bmw/raw/WBA12345678901234/status");
        assert_eq!(out.payload, b"payload");
        assert!(!out.retain);
    }

    #[test]
    fn raw_republish_legacy_mode() {
        let t = translator(false, false, true);
        let out = t.raw("ACC123/WBA12345678901234/status", b"x");
        assert_eq!(out.topic, "bmw/WBA12345678901234/status");
    }

    #[test]
    fn raw_republish_without_suffix() {
        let t = translator(false, false, false);
        assert_eq!(t.raw("ACC123", b"x").topic, "bmw/raw");
    }

    #[test]
    fn raw_republish_carries_retain_flag() {
        let t = translator(false, true, false);
        assert!(t.raw("ACC123/a", b"x").retain);
    }

    #[test]
    fn split_takes_vin_from_topic() {
        let t = translator(true, false, false);
        let out = t
            .split(
                "ACC123/WBA12345678901234/status",
                br#"{"data":{"range_km":{"value":420}}}"#,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "bmw/vehicles/WBA12345678901234/range_km");
        assert_eq!(out[0].payload, br#"{"value":420}"#);
    }

    #[test]
    fn split_prefers_vin_field() {
        let t = translator(true, false, false);
        let out = t
            .split(
                "ACC123/ignored-topic-part/status",
                br#"{"vin":"WBA98765432109876","data":{"soc":{"value":81,"unit":"%"}}}"#,
            )
            .unwrap();
        assert_eq!(out[0].topic, "bmw/vehicles/WBA98765432109876/soc");
        assert_eq!(out[0].payload, br#"{"unit":"%","value":81}"#);
    }

    #[test]
    fn split_rejects_short_and_long_identifiers() {
        let t = translator(true, false, false);
        for vin in ["WBA1234567890123", "WBA123456789012345"] {
            let err = t
                .split(
                    &format!("ACC123/{vin}/status"),
                    br#"{"data":{"soc":{"value":81}}}"#,
                )
                .unwrap_err();
            assert!(matches!(err, TranslationError::InvalidIdentifier(_)), "{vin}");
        }
    }

    #[test]
    fn split_rejects_missing_data() {
        let t = translator(true, false, false);
        let err = t
            .split("ACC123/WBA12345678901234", br#"{"telematics":true}"#)
            .unwrap_err();
        assert!(matches!(err, TranslationError::NoData));
    }

    #[test]
    fn split_rejects_non_json_payload() {
        let t = translator(true, false, false);
        let err = t.split("ACC123/WBA12345678901234", b"\x00\x01binary").unwrap_err();
        assert!(matches!(err, TranslationError::InvalidPayload(_)));
    }

    #[test]
    fn split_skips_entries_without_value() {
        let t = translator(true, false, false);
        let out = t
            .split(
                "ACC123/WBA12345678901234/status",
                br#"{"data":{"soc":{"value":81},"meta":{"note":"n/a"}}}"#,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "bmw/vehicles/WBA12345678901234/soc");
    }

    #[test]
    fn split_preserves_unit_and_timestamp() {
        let t = translator(true, false, false);
        let out = t
            .split(
                "ACC123/WBA12345678901234/status",
                br#"{"data":{"range_km":{"value":420,"unit":"km","timestamp":1700000000}}}"#,
            )
            .unwrap();
        assert_eq!(
            out[0].payload,
            br#"{"timestamp":1700000000,"unit":"km","value":420}"#
        );
    }

    #[test]
    fn split_emits_properties_in_key_order() {
        let t = translator(true, false, false);
        let out = t
            .split(
                "ACC123/WBA12345678901234/status",
                br#"{"data":{"soc":{"value":81},"range_km":{"value":420}}}"#,
            )
            .unwrap();
        let topics: Vec<_> = out.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            [
                "bmw/vehicles/WBA12345678901234/range_km",
                "bmw/vehicles/WBA12345678901234/soc",
            ]
        );
    }
}
