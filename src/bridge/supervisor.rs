//! The supervisory loop that owns both broker sessions.
//!
//! A fixed 1-second tick drives every time-based decision: refresh
//! scheduling, the backoff fence, and the connect-hang watchdog. Session
//! events arrive over a single queue, so all connection bookkeeping has one
//! writer. Recovery never mutates a live upstream session after a hang or a
//! refresh; it replaces the whole session handle, which is the mechanism
//! that avoids inconsistent protocol/TLS state.

use crate::auth::{self, CredentialStore, RefreshGate, TokenError, TokenManager};
use crate::bridge::backoff::{self, ReasonClass};
use crate::bridge::session::{
    self, BridgeEvent, LocalEvent, UpstreamEvent, UpstreamHandle,
};
use crate::bridge::status::StatusPublisher;
use crate::bridge::translate::Translator;
use crate::core::config::Config;
use crate::core::time::Clock;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TICK: Duration = Duration::from_secs(1);
/// Fence applied when a refresh attempt fails.
const REFRESH_FAILURE_FENCE_MS: i64 = 15_000;
/// Settling fence between a successful refresh and the session rebuild.
const POST_REFRESH_FENCE_MS: i64 = 1_000;
/// Fence applied when a session rebuild itself fails.
const REBUILD_FAILURE_FENCE_MS: i64 = 2_000;

/// Upstream connection state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    BackoffWait,
}

/// Top-level orchestrator owning both sessions and the credential state.
pub struct Bridge<C: Clock> {
    config: Arc<Config>,
    clock: C,
    tokens: TokenManager,
    translator: Translator,
    status: StatusPublisher,
    local_client: rumqttc::AsyncClient,
    local_pump: JoinHandle<()>,
    upstream: UpstreamHandle,
    state: ConnState,
    /// Unix ms before which no connect or rebuild action may run.
    fence_ms: i64,
    /// Unix ms of the pending connect attempt; 0 once acknowledged.
    last_attempt_ms: i64,
    refresh_gate: RefreshGate,
    refresh_inflight: bool,
    rebuild_pending: bool,
    events_tx: mpsc::Sender<BridgeEvent>,
    events_rx: Option<mpsc::Receiver<BridgeEvent>>,
    stopping: bool,
}

impl<C: Clock> Bridge<C> {
    /// Load credentials, start both sessions, and publish the initial status.
    pub async fn new(config: Arc<Config>, clock: C) -> Result<Self> {
        let store = CredentialStore::new(config.state_dir());
        let http = auth::tokens::http_client()?;
        let now = clock.unix_seconds();
        let mut tokens = TokenManager::load(&config, store, http, now)
            .context("loading credentials failed")?;
        if !tokens.is_valid() {
            tracing::warn!("identity token carries no usable expiry; attempting refresh");
            let set = tokens
                .begin_refresh()
                .execute()
                .await
                .context("cannot obtain a valid identity token; re-run the device authorization flow")?;
            tokens.install(set, clock.unix_seconds());
        }
        tracing::info!(
            expiry_unix = tokens.expiry_unix(),
            expires_in = tokens.expiry_unix() - clock.unix_seconds(),
            "credentials loaded"
        );

        let (events_tx, events_rx) = mpsc::channel(256);
        let status = StatusPublisher::new(&config.topics);
        let (local_client, local_pump) =
            session::spawn_local(&config, status.status_topic(), events_tx.clone());
        let upstream = UpstreamHandle::spawn(&config, tokens.identity_token(), events_tx.clone(), 1)
            .context("building the upstream session failed")?;

        let now_ms = clock.unix_millis();
        let refresh_gate = RefreshGate::new(config.tokens.min_refresh_spacing_seconds);
        let bridge = Self {
            translator: Translator::new(&config.topics),
            status,
            local_client,
            local_pump,
            upstream,
            state: ConnState::Connecting,
            fence_ms: 0,
            last_attempt_ms: now_ms,
            refresh_gate,
            refresh_inflight: false,
            rebuild_pending: false,
            events_tx,
            events_rx: Some(events_rx),
            stopping: false,
            config,
            clock,
            tokens,
        };
        for emit in bridge.status.initial(now_ms) {
            bridge.publish_local(&emit.topic, emit.payload, emit.retain).await;
        }
        Ok(bridge)
    }

    /// Run until SIGINT/SIGTERM, then disconnect both sessions.
    pub async fn run(mut self) -> Result<()> {
        let mut events = self
            .events_rx
            .take()
            .context("bridge event queue already taken")?;
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("bridge running");

        loop {
            tokio::select! {
                biased;
                sig = shutdown_signal(), if !self.stopping => {
                    tracing::info!("received {sig}, shutting down");
                    self.stopping = true;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
            }
            if self.stopping {
                break;
            }
        }
        self.shutdown().await
    }

    async fn handle_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Upstream { generation, event } => {
                if generation != self.upstream.generation {
                    tracing::debug!(generation, "discarding event from replaced session");
                    return;
                }
                self.handle_upstream(event).await;
            }
            BridgeEvent::Local(LocalEvent::Up) => {
                tracing::info!(
                    host = %self.config.local.host,
                    port = self.config.local.port,
                    "local broker connected"
                );
            }
            BridgeEvent::Local(LocalEvent::Down { detail }) => {
                tracing::warn!("local broker connection lost: {detail}");
            }
            BridgeEvent::RefreshDone(result) => self.on_refresh_done(result).await,
        }
    }

    async fn handle_upstream(&mut self, event: UpstreamEvent) {
        let now_ms = self.clock.unix_millis();
        match event {
            UpstreamEvent::ConnAckOk { session_present } => {
                tracing::info!(session_present, "upstream connected");
                self.state = ConnState::Connected;
                self.last_attempt_ms = 0;
                let filter = format!("{}/+", self.config.account_id);
                if let Err(err) = self
                    .upstream
                    .client
                    .subscribe(filter.clone(), rumqttc::v5::mqttbytes::QoS::AtLeastOnce)
                    .await
                {
                    tracing::error!(%filter, "subscribe failed: {err}");
                }
                self.status_transition(true).await;
            }
            UpstreamEvent::ConnAckErr { class, detail } => {
                let delay_ms = backoff::jittered_delay_ms(class);
                tracing::warn!(?class, delay_ms, "upstream connect rejected: {detail}");
                self.state = ConnState::BackoffWait;
                self.fence_ms = now_ms + delay_ms;
                self.last_attempt_ms = 0;
                self.status_transition(false).await;
            }
            UpstreamEvent::Message { topic, payload } => {
                self.forward(&topic, &payload).await;
            }
            UpstreamEvent::Disconnected { detail } => {
                tracing::warn!("upstream sent DISCONNECT: {detail}");
                self.on_upstream_lost(now_ms, ReasonClass::Other).await;
            }
            UpstreamEvent::TransportError { class, detail } => {
                tracing::warn!(?class, "upstream transport error: {detail}");
                self.on_upstream_lost(now_ms, class).await;
            }
        }
    }

    /// Common path for losing an established or in-flight connection.
    async fn on_upstream_lost(&mut self, now_ms: i64, class: ReasonClass) {
        match self.state {
            ConnState::Connected | ConnState::Connecting => {
                let delay_ms = backoff::jittered_delay_ms(class);
                self.state = ConnState::BackoffWait;
                self.fence_ms = now_ms + delay_ms;
                self.last_attempt_ms = 0;
                self.status_transition(false).await;
            }
            // already backing off: keep the fence a prior reason code set
            ConnState::BackoffWait | ConnState::Disconnected => {}
        }
    }

    async fn on_refresh_done(&mut self, result: Result<crate::auth::CredentialSet, TokenError>) {
        self.refresh_inflight = false;
        let now_ms = self.clock.unix_millis();
        match result {
            Ok(set) => {
                self.tokens.install(set, now_ms / 1000);
                tracing::info!(
                    expiry_unix = self.tokens.expiry_unix(),
                    "credential refreshed; rebuilding upstream session"
                );
                self.status_transition(false).await;
                self.fence_ms = self.fence_ms.max(now_ms + POST_REFRESH_FENCE_MS);
                self.rebuild_pending = true;
            }
            Err(err) => {
                tracing::warn!("token refresh failed, retry soon: {err}");
                self.fence_ms = self.fence_ms.max(now_ms + REFRESH_FAILURE_FENCE_MS);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now_ms = self.clock.unix_millis();
        let now_s = now_ms / 1000;

        if let Some(emit) = self.status.tick(now_ms) {
            tracing::info!("stable status flipped to disconnected");
            self.publish_local(&emit.topic, emit.payload, emit.retain).await;
        }

        // Inside the backoff window no new actions are taken.
        if now_ms < self.fence_ms {
            return;
        }

        if self.rebuild_pending {
            self.rebuild_pending = false;
            self.full_rebuild(now_ms).await;
            return;
        }

        if !self.refresh_inflight {
            let due_soft = self.tokens.needs_soft_refresh(now_s);
            let due_hard = self.tokens.needs_hard_refresh(now_s);
            if (due_soft || due_hard) && self.refresh_gate.try_claim(now_s) {
                tracing::info!(
                    kind = if due_soft { "soft" } else { "hard" },
                    expiry_unix = self.tokens.expiry_unix(),
                    "token refresh due"
                );
                self.refresh_inflight = true;
                let request = self.tokens.begin_refresh();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let _ = events.send(BridgeEvent::RefreshDone(request.execute().await)).await;
                });
            }
        }

        match self.state {
            ConnState::BackoffWait => {
                tracing::info!("backoff fence elapsed; resuming upstream connect");
                self.state = ConnState::Connecting;
                self.last_attempt_ms = now_ms;
                self.upstream.resume();
            }
            ConnState::Disconnected => {
                // a previous rebuild failed; try again from scratch
                self.full_rebuild(now_ms).await;
            }
            ConnState::Connecting | ConnState::Connected => {}
        }

        // CONNECT watchdog: an attempt that never produced a CONNACK gets a
        // full client rebuild, never an in-place reconnect.
        let hang_ms = self.config.upstream.connect_hang_seconds * 1000;
        if self.last_attempt_ms != 0 && now_ms - self.last_attempt_ms > hang_ms {
            tracing::warn!(
                attempt_age_s = (now_ms - self.last_attempt_ms) / 1000,
                "CONNECT hung; rebuilding upstream session"
            );
            self.full_rebuild(now_ms).await;
        }
    }

    /// Tear the upstream session down and recreate it from scratch with the
    /// current identity token.
    async fn full_rebuild(&mut self, now_ms: i64) {
        if self.state == ConnState::Connected {
            self.status_transition(false).await;
        }
        self.upstream.abort();
        let generation = self.upstream.generation + 1;
        match UpstreamHandle::spawn(
            &self.config,
            self.tokens.identity_token(),
            self.events_tx.clone(),
            generation,
        ) {
            Ok(handle) => {
                tracing::info!(generation, "upstream session rebuilt");
                self.upstream = handle;
                self.state = ConnState::Connecting;
                self.last_attempt_ms = now_ms;
            }
            Err(err) => {
                tracing::error!("upstream session rebuild failed: {err:?}");
                self.state = ConnState::Disconnected;
                self.last_attempt_ms = 0;
                self.fence_ms = now_ms + REBUILD_FAILURE_FENCE_MS;
            }
        }
    }

    /// Translate one upstream message and publish every resulting tuple,
    /// independent of connection-state bookkeeping.
    async fn forward(&mut self, topic: &str, payload: &[u8]) {
        let raw = self.translator.raw(topic, payload);
        tracing::debug!(
            in_topic = %topic,
            out_topic = %raw.topic,
            bytes = payload.len(),
            "forwarding"
        );
        self.publish_local(&raw.topic, raw.payload, raw.retain).await;

        if self.translator.split_enabled() {
            match self.translator.split(topic, payload) {
                Ok(messages) => {
                    for msg in messages {
                        tracing::debug!(out_topic = %msg.topic, "forwarding split property");
                        self.publish_local(&msg.topic, msg.payload, msg.retain).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(in_topic = %topic, "split translation failed: {err}");
                }
            }
        }
    }

    async fn status_transition(&mut self, connected: bool) {
        let now_ms = self.clock.unix_millis();
        let emits = self.status.transition(connected, now_ms);
        for emit in emits {
            self.publish_local(&emit.topic, emit.payload, emit.retain).await;
        }
    }

    async fn publish_local(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        if let Err(err) = self
            .local_client
            .publish(topic, rumqttc::QoS::AtMostOnce, retain, payload)
            .await
        {
            tracing::warn!(%topic, "local publish failed: {err}");
        }
    }

    async fn shutdown(mut self) -> Result<()> {
        // Leave a clean retained state behind; the Last-Will only covers
        // ungraceful loss.
        self.status_transition(false).await;
        let _ = self.upstream.client.disconnect().await;
        let _ = self.local_client.disconnect().await;
        // give the event loops a moment to flush the DISCONNECT packets
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.upstream.abort();
        self.local_pump.abort();
        tracing::info!("bridge stopped");
        Ok(())
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() -> &'static str {
    let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}
