//! Connectivity status channels for the local broker.
//!
//! The immediate channel mirrors every upstream transition and is always
//! retained so new subscribers see the current state at once; the local
//! session's Last-Will covers ungraceful bridge loss on the same topic.
//! The stable channel debounces short disconnects: it only reports a
//! disconnect that has persisted uninterrupted for the configured window.

use crate::core::config::TopicConfig;

/// One status publish for the local session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEmit {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug)]
pub struct StatusPublisher {
    status_topic: String,
    stable_topic: String,
    stable_delay_ms: i64,
    retain_stable: bool,
    stable_connected: bool,
    pending_down_deadline_ms: Option<i64>,
}

impl StatusPublisher {
    pub fn new(topics: &TopicConfig) -> Self {
        Self {
            status_topic: format!("{}status", topics.prefix),
            stable_topic: format!("{}status_stable", topics.prefix),
            stable_delay_ms: topics.status_stable_delay_seconds * 1000,
            retain_stable: topics.retain,
            stable_connected: false,
            pending_down_deadline_ms: None,
        }
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    /// Startup publishes: both channels report disconnected.
    pub fn initial(&self, now_ms: i64) -> Vec<StatusEmit> {
        vec![
            self.immediate_emit(false, now_ms),
            self.stable_emit(false, now_ms),
        ]
    }

    /// Record a connection transition; returns the publishes it caused.
    pub fn transition(&mut self, connected: bool, now_ms: i64) -> Vec<StatusEmit> {
        let mut out = vec![self.immediate_emit(connected, now_ms)];
        if connected {
            self.pending_down_deadline_ms = None;
            if !self.stable_connected {
                self.stable_connected = true;
                out.push(self.stable_emit(true, now_ms));
            }
        } else if self.stable_connected && self.pending_down_deadline_ms.is_none() {
            self.pending_down_deadline_ms = Some(now_ms + self.stable_delay_ms);
        }
        out
    }

    /// Flip the stable channel once a pending disconnect has aged past the window.
    pub fn tick(&mut self, now_ms: i64) -> Option<StatusEmit> {
        let deadline = self.pending_down_deadline_ms?;
        if now_ms < deadline {
            return None;
        }
        self.pending_down_deadline_ms = None;
        self.stable_connected = false;
        Some(self.stable_emit(false, now_ms))
    }

    fn immediate_emit(&self, connected: bool, now_ms: i64) -> StatusEmit {
        StatusEmit {
            topic: self.status_topic.clone(),
            payload: payload(connected, now_ms / 1000),
            // always retained so the state is rediscoverable immediately
            retain: true,
        }
    }

    fn stable_emit(&self, connected: bool, now_ms: i64) -> StatusEmit {
        StatusEmit {
            topic: self.stable_topic.clone(),
            payload: payload(connected, now_ms / 1000),
            retain: self.retain_stable,
        }
    }
}

fn payload(connected: bool, timestamp: i64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "connected": connected,
        "timestamp": timestamp,
    }))
    .unwrap_or_else(|_| Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TopicConfig;

    fn publisher() -> StatusPublisher {
        // 5 second stabilization window, global retain off
        StatusPublisher::new(&TopicConfig::default())
    }

    fn stable_emits(emits: &[StatusEmit]) -> Vec<&StatusEmit> {
        emits.iter().filter(|e| e.topic == "bmw/status_stable").collect()
    }

    #[test]
    fn immediate_channel_is_always_retained() {
        let mut p = publisher();
        for emit in p.transition(true, 0) {
            if emit.topic == "bmw/status" {
                assert!(emit.retain);
            }
        }
        for emit in p.transition(false, 1_000) {
            if emit.topic == "bmw/status" {
                assert!(emit.retain);
            }
        }
    }

    #[test]
    fn short_disconnect_never_reaches_stable_channel() {
        let mut p = publisher();
        p.transition(true, 0);
        // disconnect at t=0s, reconnect at t=3s, window 5s
        let emits = p.transition(false, 0);
        assert!(stable_emits(&emits).is_empty());
        for t in 1..=3 {
            assert!(p.tick(t * 1000).is_none());
        }
        let emits = p.transition(true, 3_000);
        assert!(stable_emits(&emits).is_empty());
        // well past the original deadline nothing fires
        for t in 4..=20 {
            assert!(p.tick(t * 1000).is_none());
        }
    }

    #[test]
    fn long_disconnect_flips_stable_exactly_once() {
        let mut p = publisher();
        p.transition(true, 0);
        p.transition(false, 0);
        for t in 1..5 {
            assert!(p.tick(t * 1000).is_none());
        }
        let emit = p.tick(5_000).expect("stable flip at the window edge");
        assert_eq!(emit.topic, "bmw/status_stable");
        assert_eq!(emit.payload, br#"{"connected":false,"timestamp":5}"#);
        for t in 6..=10 {
            assert!(p.tick(t * 1000).is_none());
        }
    }

    #[test]
    fn repeated_disconnect_events_keep_first_deadline() {
        let mut p = publisher();
        p.transition(true, 0);
        p.transition(false, 0);
        // a second disconnect report must not push the deadline out
        p.transition(false, 4_000);
        assert!(p.tick(5_000).is_some());
    }

    #[test]
    fn reconnect_raises_stable_immediately() {
        let mut p = publisher();
        p.transition(true, 0);
        p.transition(false, 0);
        p.tick(5_000).unwrap();
        let emits = p.transition(true, 9_000);
        let stable = stable_emits(&emits);
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].payload, br#"{"connected":true,"timestamp":9}"#);
    }

    #[test]
    fn initial_state_reports_disconnected_on_both_channels() {
        let p = publisher();
        let emits = p.initial(0);
        assert_eq!(emits.len(), 2);
        assert!(emits.iter().all(|e| e.payload.starts_with(br#"{"connected":false"#)));
    }
}
