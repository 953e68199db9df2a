//! Message classification and dispatch.
//!
//! Every complete frame payload lands here, whatever transport produced it.
//! The dispatcher applies the gateway forwarding rule first, then routes by
//! `type` into the bounded queues, the broker client, or the wipe path.
//!
//! The dispatcher is built with explicit handles at construction time;
//! transport callbacks reach it through `Arc`, never through globals.

use crate::broker::BrokerHandle;
use crate::espnow::{self, EspNowManager};
use crate::prefs::Prefs;
use crate::queues::DispatchQueue;
use crate::restart::{RestartHandle, RestartReason, WIPE_RESTART_DELAY};
use crate::workers::ConfigState;
use jr_protocol::{Envelope, MacAddr, msg_types};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Reply channel
// ---------------------------------------------------------------------------

/// Where a response document (currently only `wipe_preferences_response`)
/// should go: back to the originating transport.
#[derive(Debug, Clone)]
pub enum ReplyTo {
    /// No return channel (e.g. broker-delivered documents).
    Disconnected,
    /// A connected byte/WS transport's outbound buffer.
    Stream(mpsc::Sender<Vec<u8>>),
    /// A radio peer, addressed by MAC.
    Peer(MacAddr),
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DispatchStats {
    parse_errors: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
    subscriptions_requested: AtomicU64,
    wipes: AtomicU64,
    unknown_types: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStatsSnapshot {
    pub parse_errors: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub subscriptions_requested: u64,
    pub wipes: u64,
    pub unknown_types: u64,
}

impl DispatchStats {
    fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            subscriptions_requested: self.subscriptions_requested.load(Ordering::Relaxed),
            wipes: self.wipes.load(Ordering::Relaxed),
            unknown_types: self.unknown_types.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    sensor_queue: DispatchQueue,
    config_queue: DispatchQueue,
    config_state: Arc<ConfigState>,
    prefs: Arc<Mutex<Prefs>>,
    restart: RestartHandle,
    espnow: Option<Arc<EspNowManager>>,
    broker: Option<BrokerHandle>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        sensor_queue: DispatchQueue,
        config_queue: DispatchQueue,
        config_state: Arc<ConfigState>,
        prefs: Arc<Mutex<Prefs>>,
        restart: RestartHandle,
    ) -> Self {
        Dispatcher {
            sensor_queue,
            config_queue,
            config_state,
            prefs,
            restart,
            espnow: None,
            broker: None,
            stats: DispatchStats::default(),
        }
    }

    /// Attach the peer radio (enables gateway forwarding and peer replies).
    pub fn with_espnow(mut self, espnow: Arc<EspNowManager>) -> Self {
        self.espnow = Some(espnow);
        self
    }

    /// Attach the broker channel (enables subscription requests).
    pub fn with_broker(mut self, broker: BrokerHandle) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn stats_snapshot(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Parse a frame payload and dispatch it.  Parse failures are logged
    /// and dropped; nothing propagates to the transport.
    pub async fn ingest_bytes(&self, payload: &[u8], reply: ReplyTo) {
        match Envelope::from_slice(payload) {
            Ok(envelope) => self.ingest(envelope, reply).await,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = payload.len(), "discarding unparseable payload");
            }
        }
    }

    /// Dispatch a parsed envelope.
    pub async fn ingest(&self, mut envelope: Envelope, reply: ReplyTo) {
        // Gateway rule: an addressed document is forwarded over the radio
        // and never processed locally.  A failed forward drops it.
        if envelope.destination().is_some() {
            let dest = envelope
                .take_destination()
                .unwrap_or_default();
            match &self.espnow {
                Some(manager) => {
                    let bytes = envelope.to_bytes();
                    match espnow::forward_to_peer(manager, &dest, &bytes) {
                        Ok(()) => {
                            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                            debug!(dest = %dest, "forwarded to peer");
                        }
                        Err(e) => {
                            self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(dest = %dest, error = %e, "forward failed, dropping");
                        }
                    }
                }
                None => {
                    self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(dest = %dest, "peer radio not initialized, dropping addressed document");
                }
            }
            return;
        }

        match envelope.msg_type() {
            Some(msg_types::SENSOR) => {
                self.sensor_queue.push(envelope);
            }
            Some(msg_types::CONFIG) => {
                self.config_queue.push(envelope);
            }
            Some(msg_types::MQTT_SUBSCRIPTION_REQUEST) => {
                let topics: Vec<String> = envelope
                    .subscriptions()
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                match &self.broker {
                    Some(broker) => {
                        for topic in topics {
                            self.stats
                                .subscriptions_requested
                                .fetch_add(1, Ordering::Relaxed);
                            broker.subscribe(&topic).await;
                        }
                    }
                    None => warn!("subscription request but no broker configured"),
                }
            }
            Some(msg_types::WIPE_PREFERENCES) => {
                self.handle_wipe(&reply).await;
            }
            Some(other) => {
                self.stats.unknown_types.fetch_add(1, Ordering::Relaxed);
                debug!(msg_type = other, "ignoring unknown message type");
            }
            None => {
                self.stats.unknown_types.fetch_add(1, Ordering::Relaxed);
                debug!("ignoring untyped document");
            }
        }
    }

    /// Erase the preference store, reset config state, schedule the restart,
    /// and answer on the originating channel (best effort).
    async fn handle_wipe(&self, reply: &ReplyTo) {
        self.stats.wipes.fetch_add(1, Ordering::Relaxed);

        let result = self.prefs.lock().await.wipe();
        if let Err(e) = &result {
            warn!(error = %e, "preference wipe failed");
        }
        self.config_state.reset();
        self.restart
            .schedule(WIPE_RESTART_DELAY, RestartReason::PreferencesWiped);

        let response = match &result {
            Ok(()) => json!({ "type": msg_types::WIPE_PREFERENCES_RESPONSE, "success": true }),
            Err(e) => json!({
                "type": msg_types::WIPE_PREFERENCES_RESPONSE,
                "success": false,
                "error": e.to_string(),
            }),
        };
        self.send_reply(reply, &response).await;
    }

    async fn send_reply(&self, reply: &ReplyTo, doc: &serde_json::Value) {
        let bytes = serde_json::to_vec(doc).unwrap_or_default();
        match reply {
            ReplyTo::Disconnected => {}
            ReplyTo::Stream(tx) => {
                if tx.try_send(bytes).is_err() {
                    debug!("reply channel full or closed, response dropped");
                }
            }
            ReplyTo::Peer(mac) => match &self.espnow {
                Some(manager) => {
                    if let Err(e) = manager.send(*mac, &bytes) {
                        debug!(dest = %mac, error = %e, "peer reply failed");
                    }
                }
                None => debug!("peer reply requested but no radio"),
            },
        }
    }
}
