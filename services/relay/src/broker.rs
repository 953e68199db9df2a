//! Optional MQTT broker channel.
//!
//! Runs independently of the primary protocol: it never gates local
//! dispatch, reconnects on its own schedule, and only attempts connections
//! while an IP network is up.  Packets are encoded/decoded with the
//! `mqtt-protocol` codec and driven over a plain TCP stream.
//!
//! Outbound documents publish on [`DATA_TOPIC`]; topics subscribed on
//! demand (per `MQTT_Subscription_Request` envelopes) fan their PUBLISH
//! payloads back into the dispatcher like any other transport.

use crate::dispatch::{Dispatcher, ReplyTo};
use crate::status::StatusAggregator;
use jr_protocol::Envelope;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::{
    ConnectPacket, PingreqPacket, PublishPacket, SubscribePacket, VariablePacket,
};
use mqtt::{Decodable, Encodable, QualityOfService, TopicFilter, TopicName};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Fixed topic for outbound documents.
pub const DATA_TOPIC: &str = "junctionrelay/data";

/// Retry cadence while the network is up but the client is disconnected.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEP_ALIVE_SECS: u16 = 30;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

/// Parse the `mqttBroker` preference: `host` or `host:port`.
/// Returns `None` for an empty setting (broker channel disabled).
pub fn parse_broker_target(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    match target.rfind(':') {
        Some(pos) => {
            let host = &target[..pos];
            let port = target[pos + 1..].parse().unwrap_or(DEFAULT_MQTT_PORT);
            if host.is_empty() {
                None
            } else {
                Some((host.to_owned(), port))
            }
        }
        None => Some((target.to_owned(), DEFAULT_MQTT_PORT)),
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum BrokerCommand {
    Subscribe(String),
    Publish(Envelope),
}

/// Cloneable producer side of the broker loop.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
    connected: Arc<AtomicBool>,
}

impl BrokerHandle {
    /// Request a topic subscription.  Remembered across reconnects.
    pub async fn subscribe(&self, topic: &str) {
        let _ = self
            .tx
            .send(BrokerCommand::Subscribe(topic.to_owned()))
            .await;
    }

    /// Publish a document on [`DATA_TOPIC`].  Dropped when disconnected.
    pub async fn publish(&self, doc: Envelope) {
        let _ = self.tx.send(BrokerCommand::Publish(doc)).await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct BrokerRx {
    pub(crate) rx: mpsc::Receiver<BrokerCommand>,
    pub(crate) connected: Arc<AtomicBool>,
}

pub fn broker_channel() -> (BrokerHandle, BrokerRx) {
    let (tx, rx) = mpsc::channel(32);
    let connected = Arc::new(AtomicBool::new(false));
    (
        BrokerHandle {
            tx,
            connected: connected.clone(),
        },
        BrokerRx { rx, connected },
    )
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("MQTT: {0}")]
    Protocol(String),
    #[error("broker rejected connection: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Drive the broker channel until shutdown.
///
/// Wait for the network, connect, replay the desired subscriptions, serve
/// commands and inbound packets; on any failure mark disconnected and retry
/// once per [`RECONNECT_INTERVAL`] while the network remains up.
pub async fn run_broker(
    cfg: BrokerConfig,
    mut chan: BrokerRx,
    dispatcher: Arc<Dispatcher>,
    status: Arc<StatusAggregator>,
    mut network_up: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut desired_topics: BTreeSet<String> = BTreeSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Idle while the network is down: keep absorbing subscribe intents,
        // drop publishes.
        if !*network_up.borrow() {
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = network_up.changed() => continue,
                cmd = chan.rx.recv() => {
                    match cmd {
                        Some(BrokerCommand::Subscribe(t)) => {
                            desired_topics.insert(t);
                        }
                        Some(BrokerCommand::Publish(_)) => {
                            debug!("network down, dropping publish");
                        }
                        None => break,
                    }
                    continue;
                }
            }
        }

        match connect(&cfg).await {
            Ok(stream) => {
                info!(host = %cfg.host, port = cfg.port, "broker connected");
                chan.connected.store(true, Ordering::SeqCst);
                status.update(|s| s.mqtt_connected = true);

                let result = run_session(
                    stream,
                    &mut chan.rx,
                    &mut desired_topics,
                    &dispatcher,
                    &mut network_up,
                    &mut shutdown,
                )
                .await;

                chan.connected.store(false, Ordering::SeqCst);
                status.update(|s| s.mqtt_connected = false);
                match result {
                    Ok(()) => debug!("broker session closed"),
                    Err(e) => warn!(error = %e, "broker session failed"),
                }
            }
            Err(e) => {
                debug!(error = %e, "broker connect failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

async fn connect(cfg: &BrokerConfig) -> Result<TcpStream, BrokerError> {
    let mut stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((cfg.host.as_str(), cfg.port)),
    )
    .await
    .map_err(|_| BrokerError::Protocol("connect timeout".to_owned()))??;

    let mut connect = ConnectPacket::new(cfg.client_id.clone());
    connect.set_clean_session(true);
    connect.set_keep_alive(KEEP_ALIVE_SECS);
    connect.set_user_name(cfg.username.clone());
    connect.set_password(cfg.password.clone());
    write_packet(&mut stream, &connect).await?;

    match read_packet(&mut stream).await? {
        VariablePacket::ConnackPacket(connack) => {
            if connack.connect_return_code() == ConnectReturnCode::ConnectionAccepted {
                Ok(stream)
            } else {
                Err(BrokerError::Rejected(format!(
                    "{:?}",
                    connack.connect_return_code()
                )))
            }
        }
        other => Err(BrokerError::Protocol(format!(
            "expected CONNACK, got {:?}",
            other
        ))),
    }
}

async fn run_session(
    mut stream: TcpStream,
    rx: &mut mpsc::Receiver<BrokerCommand>,
    desired_topics: &mut BTreeSet<String>,
    dispatcher: &Arc<Dispatcher>,
    network_up: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut packet_id: u16 = 0;

    // Replay subscriptions from previous sessions.
    for topic in desired_topics.iter() {
        packet_id = packet_id.wrapping_add(1);
        send_subscribe(&mut stream, topic, packet_id).await?;
    }

    let mut keepalive = tokio::time::interval(Duration::from_secs(u64::from(KEEP_ALIVE_SECS) / 2));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.reset();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = network_up.changed() => {
                if !*network_up.borrow() {
                    return Ok(());
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(BrokerCommand::Subscribe(topic)) => {
                        if desired_topics.insert(topic.clone()) {
                            packet_id = packet_id.wrapping_add(1);
                            send_subscribe(&mut stream, &topic, packet_id).await?;
                        }
                    }
                    Some(BrokerCommand::Publish(doc)) => {
                        let topic = TopicName::new(DATA_TOPIC)
                            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
                        let publish = PublishPacket::new(
                            topic,
                            QoSWithPacketIdentifier::Level0,
                            doc.to_bytes(),
                        );
                        write_packet(&mut stream, &publish).await?;
                    }
                    None => return Ok(()),
                }
            }
            packet = read_packet(&mut stream) => {
                match packet? {
                    VariablePacket::PublishPacket(publish) => {
                        debug!(topic = %publish.topic_name(), "broker message");
                        dispatcher
                            .ingest_bytes(publish.payload(), ReplyTo::Disconnected)
                            .await;
                    }
                    VariablePacket::SubackPacket(suback) => {
                        debug!(packet_id = suback.packet_identifier(), "suback");
                    }
                    VariablePacket::PingrespPacket(_) => {}
                    other => debug!(packet = ?other, "ignoring broker packet"),
                }
            }
            _ = keepalive.tick() => {
                write_packet(&mut stream, &PingreqPacket::new()).await?;
            }
        }
    }
}

async fn send_subscribe(
    stream: &mut TcpStream,
    topic: &str,
    packet_id: u16,
) -> Result<(), BrokerError> {
    match TopicFilter::new(topic.to_owned()) {
        Ok(filter) => {
            let subscribe =
                SubscribePacket::new(packet_id, vec![(filter, QualityOfService::Level0)]);
            write_packet(stream, &subscribe).await
        }
        Err(e) => {
            warn!(topic, error = %e, "invalid topic filter, skipping");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Packet I/O over an async stream
// ---------------------------------------------------------------------------

/// The codec decodes complete packets from a reader, so reassemble one
/// packet's bytes first: fixed header byte, remaining-length varint, body.
async fn read_packet<R>(stream: &mut R) -> Result<VariablePacket, BrokerError>
where
    R: AsyncReadExt + Unpin,
{
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let mut raw = vec![first[0]];

    let mut remaining: u32 = 0;
    let mut shift = 0;
    loop {
        let mut b = [0u8; 1];
        stream.read_exact(&mut b).await?;
        raw.push(b[0]);
        remaining |= u32::from(b[0] & 0x7F) << shift;
        if b[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(BrokerError::Protocol("remaining-length overflow".to_owned()));
        }
    }

    let body_start = raw.len();
    raw.resize(body_start + remaining as usize, 0);
    stream.read_exact(&mut raw[body_start..]).await?;

    VariablePacket::decode(&mut Cursor::new(raw)).map_err(|e| BrokerError::Protocol(e.to_string()))
}

async fn write_packet<W, P>(stream: &mut W, packet: &P) -> Result<(), BrokerError>
where
    W: AsyncWriteExt + Unpin,
    P: Encodable,
{
    let mut buf = Vec::new();
    packet
        .encode(&mut buf)
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    stream.write_all(&buf).await?;
    Ok(())
}
