//! MQTT session construction and event pump tasks.
//!
//! The upstream session speaks MQTT v5 over TLS so CONNACK and DISCONNECT
//! reason codes are available to the backoff policy; the local session is a
//! plain v3.1.1 client with a Last-Will on the status topic. Each session is
//! driven by its own pump task that forwards events over the supervisor's
//! queue; upstream events carry a generation tag so a rebuilt session's
//! stragglers can be discarded.

use crate::bridge::backoff::{self, ReasonClass};
use crate::core::config::Config;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::{TlsConfiguration, Transport};
use rustls::{Certificate, ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const LOCAL_CLIENT_ID: &str = "cardata-local-forwarder";
const LOCAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 256;

/// Events delivered to the supervisor loop.
#[derive(Debug)]
pub enum BridgeEvent {
    Upstream { generation: u64, event: UpstreamEvent },
    Local(LocalEvent),
    RefreshDone(Result<crate::auth::CredentialSet, crate::auth::TokenError>),
}

#[derive(Debug)]
pub enum UpstreamEvent {
    ConnAckOk { session_present: bool },
    ConnAckErr { class: ReasonClass, detail: String },
    Message { topic: String, payload: Bytes },
    Disconnected { detail: String },
    TransportError { class: ReasonClass, detail: String },
}

#[derive(Debug)]
pub enum LocalEvent {
    Up,
    Down { detail: String },
}

/// The upstream session handle: client plus its pump task. Replaced
/// wholesale on rebuild; never mutated in place.
pub struct UpstreamHandle {
    pub client: rumqttc::v5::AsyncClient,
    pub generation: u64,
    resume_tx: mpsc::Sender<()>,
    pump: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Build a fresh session object and start its pump. rumqttc connects
    /// lazily on the first poll, so spawning is the connect attempt.
    pub fn spawn(
        config: &Config,
        identity_token: &str,
        events: mpsc::Sender<BridgeEvent>,
        generation: u64,
    ) -> Result<Self> {
        let mut options = rumqttc::v5::MqttOptions::new(
            config.client_id.clone(),
            config.upstream.host.clone(),
            config.upstream.port,
        );
        options.set_credentials(config.account_id.clone(), identity_token.to_string());
        options.set_keep_alive(KEEP_ALIVE);
        let tls = tls_config(&config.upstream.ca_bundle)?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(tls),
        )));

        let (client, eventloop) = rumqttc::v5::AsyncClient::new(options, CHANNEL_CAPACITY);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let pump = tokio::spawn(upstream_pump(eventloop, events, resume_rx, generation));
        Ok(Self {
            client,
            generation,
            resume_tx,
            pump,
        })
    }

    /// Allow the pump to poll again after a backoff window has elapsed.
    pub fn resume(&self) {
        let _ = self.resume_tx.try_send(());
    }

    pub fn abort(&self) {
        self.pump.abort();
    }
}

/// Poll the upstream event loop and forward what the supervisor cares
/// about. After a connection error the pump parks until the supervisor
/// signals that the backoff fence has elapsed; the next poll then issues a
/// fresh CONNECT on the same session object.
async fn upstream_pump(
    mut eventloop: rumqttc::v5::EventLoop,
    events: mpsc::Sender<BridgeEvent>,
    mut resume_rx: mpsc::Receiver<()>,
    generation: u64,
) {
    let send = |event: UpstreamEvent| {
        let events = events.clone();
        async move {
            events
                .send(BridgeEvent::Upstream { generation, event })
                .await
                .is_ok()
        }
    };
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::v5::Event::Incoming(Packet::ConnAck(ack))) => {
                let event = if ack.code == ConnectReturnCode::Success {
                    UpstreamEvent::ConnAckOk {
                        session_present: ack.session_present,
                    }
                } else {
                    UpstreamEvent::ConnAckErr {
                        class: backoff::classify_connect(ack.code),
                        detail: format!("{:?}", ack.code),
                    }
                };
                if !send(event).await {
                    return;
                }
            }
            Ok(rumqttc::v5::Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                let event = UpstreamEvent::Message {
                    topic,
                    payload: publish.payload,
                };
                if !send(event).await {
                    return;
                }
            }
            Ok(rumqttc::v5::Event::Incoming(Packet::Disconnect(disconnect))) => {
                let event = UpstreamEvent::Disconnected {
                    detail: format!("{:?}", disconnect.reason_code),
                };
                if !send(event).await {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => {
                let event = UpstreamEvent::TransportError {
                    class: classify_error(&err),
                    detail: err.to_string(),
                };
                if !send(event).await {
                    return;
                }
                // park until the supervisor clears the backoff fence
                if resume_rx.recv().await.is_none() {
                    return;
                }
            }
        }
    }
}

fn classify_error(err: &rumqttc::v5::ConnectionError) -> ReasonClass {
    match err {
        rumqttc::v5::ConnectionError::ConnectionRefused(code) => backoff::classify_connect(*code),
        _ => ReasonClass::Other,
    }
}

/// Start the local session and its pump. The local broker gets a simple
/// always-retry policy with a fixed short delay; publishes queue on the
/// client while the link is down.
pub fn spawn_local(
    config: &Config,
    status_topic: &str,
    events: mpsc::Sender<BridgeEvent>,
) -> (rumqttc::AsyncClient, JoinHandle<()>) {
    let mut options = rumqttc::MqttOptions::new(
        LOCAL_CLIENT_ID,
        config.local.host.clone(),
        config.local.port,
    );
    options.set_keep_alive(KEEP_ALIVE);
    options.set_last_will(rumqttc::LastWill::new(
        status_topic,
        br#"{"connected":false}"#.to_vec(),
        rumqttc::QoS::AtMostOnce,
        true,
    ));
    if let (Some(user), Some(pass)) = (&config.local.username, &config.local.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    let (client, eventloop) = rumqttc::AsyncClient::new(options, CHANNEL_CAPACITY);
    let pump = tokio::spawn(local_pump(eventloop, events));
    (client, pump)
}

async fn local_pump(mut eventloop: rumqttc::EventLoop, events: mpsc::Sender<BridgeEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                if events.send(BridgeEvent::Local(LocalEvent::Up)).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => {
                let event = LocalEvent::Down {
                    detail: err.to_string(),
                };
                if events.send(BridgeEvent::Local(event)).await.is_err() {
                    return;
                }
                tokio::time::sleep(LOCAL_RETRY_DELAY).await;
            }
        }
    }
}

/// TLS client configuration trusting the system CA bundle.
fn tls_config(ca_bundle: &Path) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    let reader = &mut BufReader::new(
        File::open(ca_bundle)
            .with_context(|| format!("open CA bundle: {}", ca_bundle.display()))?,
    );
    let der = rustls_pemfile::certs(reader).context("parse CA bundle")?;
    let certs: Vec<Certificate> = der.into_iter().map(Certificate).collect();
    let (added, _) = root_store.add_parsable_certificates(&certs);
    if added == 0 {
        bail!("no CA certificates loaded from {}", ca_bundle.display());
    }
    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_config_rejects_missing_bundle() {
        let err = tls_config(Path::new("/nonexistent/ca.crt")).unwrap_err();
        assert!(format!("{err:#}").contains("open CA bundle"));
    }

    #[test]
    fn tls_config_rejects_bundle_without_certs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();
        let err = tls_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("no CA certificates"));
    }
}
