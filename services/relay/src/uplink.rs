//! Backend WebSocket session.
//!
//! One client uplink to the backend: discover (when unconfigured), connect,
//! wait for `welcome`, register, then hold steady state — heartbeat every
//! 30 s, health every 60 s, immediate answers to `health-request` and
//! `espnow-status-request`, `pong` for a bare `ping`.
//!
//! Inbound frames the session does not consume are remote commands: they
//! fan into the dispatcher exactly as if they had arrived on a local
//! transport, with replies routed back over this session.
//!
//! # Reconnect policy
//! 5 s between attempts, 15 s per-attempt bound, and a 30 s backoff after
//! ten consecutive failures (then the counter resets).

use crate::dispatch::{Dispatcher, ReplyTo};
use crate::discovery;
use crate::espnow::EspNowManager;
use crate::identity::DeviceIdentity;
use crate::prefs::ConnectionMode;
use crate::status::StatusAggregator;
use crate::supervisor::LinkReport;
use futures_util::{SinkExt, StreamExt};
use jr_protocol::{
    DeviceRegistration, EspNowStatusData, EspNowStatusFrame, HealthFrame, HeartbeatFrame,
    UplinkFrame,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
pub const HEALTH_PERIOD: Duration = Duration::from_secs(60);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Session state & stats
// ---------------------------------------------------------------------------

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Welcomed = 3,
    Registered = 4,
    Closed = 5,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Welcomed => "welcomed",
            SessionState::Registered => "registered",
            SessionState::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> SessionState {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Open,
            3 => SessionState::Welcomed,
            4 => SessionState::Registered,
            5 => SessionState::Closed,
            _ => SessionState::Idle,
        }
    }
}

/// Shared session counters, read by health reports, status, and stats.
#[derive(Debug, Default)]
pub struct SessionStats {
    state: AtomicU8,
    reconnect_attempts: AtomicU32,
    welcome_received: AtomicBool,
    registered: AtomicBool,
    heartbeats_sent: AtomicU64,
    healths_sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatsSnapshot {
    pub state: &'static str,
    pub reconnect_attempts: u32,
    pub is_welcome_received: bool,
    pub is_registered: bool,
    pub heartbeats_sent: u64,
    pub healths_sent: u64,
}

impl SessionStats {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            state: self.state().as_str(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            is_welcome_received: self.welcome_received.load(Ordering::SeqCst),
            is_registered: self.registered.load(Ordering::SeqCst),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::SeqCst),
            healths_sent: self.healths_sent.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Config & context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Configured backend; `None` triggers subnet discovery.
    pub backend_ip: Option<Ipv4Addr>,
    /// Backend TCP port (preference `backendPort`, default 7180).
    pub port: u16,
}

/// Handles the session needs, fixed at construction.
pub struct UplinkContext {
    pub identity: Arc<DeviceIdentity>,
    pub dispatcher: Arc<Dispatcher>,
    pub espnow: Option<Arc<EspNowManager>>,
    pub status: Arc<StatusAggregator>,
    pub stats: Arc<SessionStats>,
    pub mode: ConnectionMode,
    pub link: watch::Receiver<LinkReport>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Outer loop: discovery + connect + retry policy
// ---------------------------------------------------------------------------

/// Run the uplink until shutdown.  Owns the reconnect policy.
pub async fn run_uplink(
    cfg: UplinkConfig,
    ctx: UplinkContext,
    mut network_up: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        // Hold in IDLE until an IP network exists.
        while !*network_up.borrow() {
            ctx.stats.set_state(SessionState::Idle);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'outer;
                    }
                }
                _ = network_up.changed() => {}
            }
        }

        // Pacing delay before every attempt.
        tokio::select! {
            _ = shutdown.changed() => continue,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }

        let backend = match cfg.backend_ip {
            Some(ip) => Some(ip),
            None => {
                let local = ctx.link.borrow().ip;
                match local {
                    Some(local) => discovery::discover_backend(local, cfg.port).await,
                    None => None,
                }
            }
        };
        let Some(backend) = backend else {
            debug!("no backend available yet");
            continue;
        };

        ctx.stats.set_state(SessionState::Connecting);
        ctx.stats.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let url = format!("ws://{}:{}/", backend, cfg.port);

        let connected =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url)).await;
        match connected {
            Ok(Ok((ws, _response))) => {
                consecutive_failures = 0;
                info!(backend = %backend, "uplink connected");
                ctx.status.update(|s| {
                    s.websocket_connected = true;
                    s.backend_server_ip = backend.to_string();
                });

                let result = run_session(ws, &ctx, &mut shutdown).await;

                ctx.stats.set_state(SessionState::Closed);
                ctx.stats.welcome_received.store(false, Ordering::SeqCst);
                ctx.stats.registered.store(false, Ordering::SeqCst);
                ctx.status.update(|s| s.websocket_connected = false);
                match result {
                    Ok(()) => info!("uplink session closed"),
                    Err(e) => warn!(error = %e, "uplink session failed"),
                }
            }
            Ok(Err(e)) => {
                consecutive_failures += 1;
                ctx.stats.set_state(SessionState::Closed);
                warn!(backend = %backend, error = %e, "uplink connect failed");
            }
            Err(_) => {
                consecutive_failures += 1;
                ctx.stats.set_state(SessionState::Closed);
                warn!(backend = %backend, "uplink connect timed out");
            }
        }

        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            info!(
                failures = consecutive_failures,
                "backing off after repeated connect failures"
            );
            tokio::select! {
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(FAILURE_BACKOFF) => {}
            }
            consecutive_failures = 0;
        }
    }

    ctx.stats.set_state(SessionState::Idle);
}

// ---------------------------------------------------------------------------
// Inner loop: one connected session
// ---------------------------------------------------------------------------

/// Drive one connected session to completion.  Generic over the stream so
/// tests can run it over an in-memory socket.
pub async fn run_session<S>(
    mut ws: S,
    ctx: &UplinkContext,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    ctx.stats.set_state(SessionState::Open);

    // Replies from the dispatcher for commands that arrived via this
    // session come back through this buffer.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(16);

    let mut heartbeat = steady_interval(HEARTBEAT_PERIOD);
    let mut health = steady_interval(HEALTH_PERIOD);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            msg = ws.next() => {
                match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(SessionError::Ws(e)),
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            ws.send(Message::Text("pong".into())).await?;
                            continue;
                        }
                        let value: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "unparseable uplink frame");
                                continue;
                            }
                        };
                        match serde_json::from_value::<UplinkFrame>(value.clone()) {
                            Ok(UplinkFrame::Welcome(_)) => {
                                ctx.stats.set_state(SessionState::Welcomed);
                                ctx.stats.welcome_received.store(true, Ordering::SeqCst);
                                info!("welcome received, registering");
                                let frame = registration_frame(ctx);
                                ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                            }
                            Ok(UplinkFrame::DeviceRegistrationAck(_)) => {
                                ctx.stats.set_state(SessionState::Registered);
                                ctx.stats.registered.store(true, Ordering::SeqCst);
                                info!("device registered");
                                // Steady timers restart at registration.
                                heartbeat = steady_interval(HEARTBEAT_PERIOD);
                                health = steady_interval(HEALTH_PERIOD);
                            }
                            Ok(UplinkFrame::HealthRequest(_)) => {
                                let frame = health_frame(ctx);
                                ctx.stats.healths_sent.fetch_add(1, Ordering::SeqCst);
                                ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                            }
                            Ok(UplinkFrame::EspNowStatusRequest(_)) => {
                                let frame = espnow_status_frame(ctx);
                                ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                            }
                            Ok(UplinkFrame::Error(e)) => {
                                warn!(
                                    code = e.code.as_deref().unwrap_or("-"),
                                    message = e.message.as_deref().unwrap_or("-"),
                                    "backend reported error"
                                );
                            }
                            Ok(UplinkFrame::HeartbeatAck(_))
                            | Ok(UplinkFrame::HealthAck(_))
                            | Ok(UplinkFrame::ConfigAck(_))
                            | Ok(UplinkFrame::EspNowStatusAck(_)) => {}
                            Ok(other) => {
                                debug!(frame = ?other, "ignoring unexpected session frame");
                            }
                            Err(_) => {
                                // Not a session frame: remote-command fan-in.
                                match jr_protocol::Envelope::from_value(value) {
                                    Ok(envelope) => {
                                        ctx.dispatcher
                                            .ingest(envelope, ReplyTo::Stream(reply_tx.clone()))
                                            .await;
                                    }
                                    Err(e) => warn!(error = %e, "discarding uplink document"),
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                }
            }
            reply = reply_rx.recv() => {
                if let Some(bytes) = reply {
                    match String::from_utf8(bytes) {
                        Ok(text) => ws.send(Message::Text(text.into())).await?,
                        Err(e) => warn!(error = %e, "dropping non-UTF8 reply"),
                    }
                }
            }
            _ = heartbeat.tick(), if ctx.stats.is_registered() => {
                let frame = heartbeat_frame(ctx);
                ctx.stats.heartbeats_sent.fetch_add(1, Ordering::SeqCst);
                ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
            }
            _ = health.tick(), if ctx.stats.is_registered() => {
                let frame = health_frame(ctx);
                ctx.stats.healths_sent.fetch_add(1, Ordering::SeqCst);
                ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
            }
        }
    }
}

/// An interval whose first tick fires one full period from now.
fn steady_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

// ---------------------------------------------------------------------------
// Outbound frame builders
// ---------------------------------------------------------------------------

fn registration_frame(ctx: &UplinkContext) -> UplinkFrame {
    let link = ctx.link.borrow().clone();
    UplinkFrame::DeviceRegistration(DeviceRegistration {
        timestamp: ctx.identity.timestamp(),
        device_mac: ctx.identity.mac_string(),
        data: ctx.identity.registration_data(ctx.mode, &link.ip_string()),
    })
}

fn heartbeat_frame(ctx: &UplinkContext) -> UplinkFrame {
    let link = ctx.link.borrow().clone();
    UplinkFrame::Heartbeat(HeartbeatFrame {
        timestamp: ctx.identity.timestamp(),
        device_mac: ctx.identity.mac_string(),
        data: ctx
            .identity
            .heartbeat_data(&link.connection_type, link.rssi),
    })
}

fn health_frame(ctx: &UplinkContext) -> UplinkFrame {
    let link = ctx.link.borrow().clone();
    let stats = ctx.stats.snapshot();
    UplinkFrame::Health(HealthFrame {
        timestamp: ctx.identity.timestamp(),
        device_mac: ctx.identity.mac_string(),
        data: ctx.identity.health_data(
            &link.connection_type,
            &link.ip_string(),
            link.rssi,
            stats.reconnect_attempts,
            stats.is_welcome_received,
            stats.is_registered,
        ),
    })
}

fn espnow_status_frame(ctx: &UplinkContext) -> UplinkFrame {
    let data = match &ctx.espnow {
        Some(manager) => manager.status_data(),
        None => EspNowStatusData {
            is_initialized: false,
            peer_count: 0,
            online_peers: Vec::new(),
            offline_peers: Vec::new(),
            degraded_peers: Vec::new(),
        },
    };
    UplinkFrame::EspNowStatus(EspNowStatusFrame {
        timestamp: ctx.identity.timestamp(),
        device_mac: ctx.identity.mac_string(),
        data,
    })
}
