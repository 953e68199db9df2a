//! Peer radio manager.
//!
//! Keeps the bounded peer table, sends unicast/broadcast frames through the
//! radio driver seam, and feeds received payloads back through a frame
//! parser into the dispatcher — after parsing, the radio is just another
//! framed transport.
//!
//! All table mutations happen on the manager's own paths (RX task, sweep
//! task, admin calls); readers take snapshot copies.  Critical sections are
//! short and never held across an await.

use crate::dispatch::{Dispatcher, ReplyTo};
use crate::framing::FrameParser;
use jr_protocol::{EspNowStatusData, MacAddr};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Peer table bound.
pub const MAX_PEERS: usize = 20;

/// Idle time after which a peer is marked inactive.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Liveness sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Received-payload history bound.
pub const HISTORY_LIMIT: usize = 50;

/// Active peers at or below this signal strength count as degraded.
pub const DEGRADED_RSSI_DBM: i32 = -80;

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

/// The underlying short-range radio.  Hardware integration is out of scope;
/// the production driver and the in-memory test pair both implement this.
pub trait RadioDriver: Send + Sync {
    fn send(&self, dest: MacAddr, payload: &[u8]) -> Result<(), RadioError>;
}

#[derive(Debug, Error)]
#[error("radio driver: {0}")]
pub struct RadioError(pub String);

/// One frame delivered by the driver's receive path.
#[derive(Debug, Clone)]
pub struct RadioFrame {
    pub source: MacAddr,
    pub rssi: i32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Errors & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EspNowError {
    #[error(transparent)]
    InvalidMac(#[from] jr_protocol::MacParseError),
    #[error("peer table full ({MAX_PEERS} entries, none evictable)")]
    TableFull,
    #[error("unknown peer {0}")]
    UnknownPeer(MacAddr),
    #[error(transparent)]
    Driver(#[from] RadioError),
}

#[derive(Debug, Default)]
pub struct EspNowStats {
    sent: AtomicU64,
    send_errors: AtomicU64,
    received: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EspNowStatsSnapshot {
    pub sent: u64,
    pub send_errors: u64,
    pub received: u64,
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Peer {
    mac: MacAddr,
    name: String,
    last_seen: Instant,
    rssi: Option<i32>,
    active: bool,
}

/// Read-only peer view for the admin API and status frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub mac: String,
    pub name: String,
    pub last_seen_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct EspNowManager {
    driver: Arc<dyn RadioDriver>,
    peers: Mutex<Vec<Peer>>,
    history: Mutex<VecDeque<Vec<u8>>>,
    stats: EspNowStats,
}

impl EspNowManager {
    pub fn new(driver: Arc<dyn RadioDriver>) -> Arc<Self> {
        Arc::new(EspNowManager {
            driver,
            peers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            stats: EspNowStats::default(),
        })
    }

    // -- peer table ---------------------------------------------------------

    /// Add a peer by MAC string.  Idempotent for duplicates; a full table
    /// evicts the oldest inactive peer or rejects when every entry is live.
    pub fn add_peer(&self, mac: &str, name: &str) -> Result<MacAddr, EspNowError> {
        let mac: MacAddr = mac.parse()?;
        self.add_peer_mac(mac, name)?;
        Ok(mac)
    }

    fn add_peer_mac(&self, mac: MacAddr, name: &str) -> Result<(), EspNowError> {
        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        if let Some(existing) = peers.iter_mut().find(|p| p.mac == mac) {
            if !name.is_empty() {
                existing.name = name.to_owned();
            }
            return Ok(());
        }
        if peers.len() >= MAX_PEERS {
            let evict = peers
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.active)
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(i, _)| i);
            match evict {
                Some(i) => {
                    let evicted = peers.remove(i);
                    info!(mac = %evicted.mac, "evicting inactive peer for new entry");
                }
                None => return Err(EspNowError::TableFull),
            }
        }
        peers.push(Peer {
            mac,
            name: name.to_owned(),
            last_seen: Instant::now(),
            rssi: None,
            active: true,
        });
        Ok(())
    }

    /// Remove a peer; returns whether it existed.
    pub fn remove_peer(&self, mac: MacAddr) -> bool {
        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        let before = peers.len();
        peers.retain(|p| p.mac != mac);
        peers.len() != before
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer table lock poisoned").len()
    }

    pub fn peers_snapshot(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .iter()
            .map(|p| PeerSnapshot {
                mac: p.mac.to_string(),
                name: p.name.clone(),
                last_seen_ms: u64::try_from(now.duration_since(p.last_seen).as_millis())
                    .unwrap_or(u64::MAX),
                rssi: p.rssi,
                active: p.active,
            })
            .collect()
    }

    // -- sending ------------------------------------------------------------

    /// Unicast to a known peer.  The broadcast address is auto-added.
    /// Driver errors are counted and surfaced; there is no retry here.
    pub fn send(&self, dest: MacAddr, payload: &[u8]) -> Result<(), EspNowError> {
        if dest.is_broadcast() {
            self.add_peer_mac(dest, "broadcast")?;
        } else {
            let known = self
                .peers
                .lock()
                .expect("peer table lock poisoned")
                .iter()
                .any(|p| p.mac == dest);
            if !known {
                return Err(EspNowError::UnknownPeer(dest));
            }
        }

        match self.driver.send(dest, payload) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                let mut peers = self.peers.lock().expect("peer table lock poisoned");
                if let Some(peer) = peers.iter_mut().find(|p| p.mac == dest) {
                    peer.last_seen = Instant::now();
                }
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    pub fn broadcast(&self, payload: &[u8]) -> Result<(), EspNowError> {
        self.send(MacAddr::BROADCAST, payload)
    }

    // -- receiving ----------------------------------------------------------

    /// Record an inbound frame: refresh the sender's table entry and append
    /// the payload to the bounded history.
    fn note_frame(&self, frame: &RadioFrame) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        {
            let mut peers = self.peers.lock().expect("peer table lock poisoned");
            if let Some(peer) = peers.iter_mut().find(|p| p.mac == frame.source) {
                peer.last_seen = Instant::now();
                peer.rssi = Some(frame.rssi);
                peer.active = true;
            } else {
                drop(peers);
                // A full table with no evictable entry keeps the frame but
                // not the sender.
                if let Err(e) = self.add_peer_mac(frame.source, "") {
                    debug!(mac = %frame.source, error = %e, "cannot track sender");
                } else if let Some(peer) = self
                    .peers
                    .lock()
                    .expect("peer table lock poisoned")
                    .iter_mut()
                    .find(|p| p.mac == frame.source)
                {
                    peer.rssi = Some(frame.rssi);
                }
            }
        }

        let mut history = self.history.lock().expect("history lock poisoned");
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(frame.payload.clone());
    }

    pub fn history_snapshot(&self) -> Vec<Vec<u8>> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    // -- liveness -----------------------------------------------------------

    /// One liveness pass: peers idle past [`PEER_TIMEOUT`] go inactive.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        for peer in peers.iter_mut() {
            if peer.active && now.duration_since(peer.last_seen) > PEER_TIMEOUT {
                debug!(mac = %peer.mac, "peer went inactive");
                peer.active = false;
            }
        }
    }

    // -- reporting ----------------------------------------------------------

    pub fn stats_snapshot(&self) -> EspNowStatsSnapshot {
        EspNowStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
        }
    }

    /// The peer summary sent in `espnow-status` frames.
    pub fn status_data(&self) -> EspNowStatusData {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        let mut online = Vec::new();
        let mut offline = Vec::new();
        let mut degraded = Vec::new();
        for p in peers.iter() {
            let mac = p.mac.to_string();
            if !p.active {
                offline.push(mac);
            } else if p.rssi.is_some_and(|r| r <= DEGRADED_RSSI_DBM) {
                degraded.push(mac);
            } else {
                online.push(mac);
            }
        }
        EspNowStatusData {
            is_initialized: true,
            peer_count: u32::try_from(peers.len()).unwrap_or(u32::MAX),
            online_peers: online,
            offline_peers: offline,
            degraded_peers: degraded,
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Drain the driver's RX bus: track the sender, then run the payload through
/// this transport's own frame parser into the dispatcher.  Replies for
/// radio-origin commands unicast back to the sender.
pub async fn run_rx(
    manager: Arc<EspNowManager>,
    mut rx: mpsc::Receiver<RadioFrame>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut parser = FrameParser::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                manager.note_frame(&frame);
                for payload in parser.push_chunk(&frame.payload) {
                    dispatcher
                        .ingest_bytes(&payload, ReplyTo::Peer(frame.source))
                        .await;
                }
            }
        }
    }
}

/// Periodic liveness sweep until shutdown.
pub async fn run_liveness_sweep(manager: Arc<EspNowManager>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => manager.sweep(),
        }
    }
}

/// Parse-and-send helper for gateway forwards; driver errors are logged by
/// the caller's policy (drop, no retry).
pub fn forward_to_peer(
    manager: &EspNowManager,
    dest: &str,
    payload: &[u8],
) -> Result<(), EspNowError> {
    let mac: MacAddr = dest.parse()?;
    if mac.is_broadcast() {
        manager.broadcast(payload)
    } else {
        manager.send(mac, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeDriver {
        sent: StdMutex<Vec<(MacAddr, Vec<u8>)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RadioDriver for FakeDriver {
        fn send(&self, dest: MacAddr, payload: &[u8]) -> Result<(), RadioError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RadioError("tx queue full".into()));
            }
            self.sent.lock().unwrap().push((dest, payload.to_vec()));
            Ok(())
        }
    }

    fn manager() -> (Arc<EspNowManager>, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::default());
        (EspNowManager::new(driver.clone()), driver)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    #[tokio::test]
    async fn add_is_idempotent_and_rejects_bad_macs() {
        let (mgr, _) = manager();
        mgr.add_peer("AA:BB:CC:DD:EE:01", "desk").unwrap();
        mgr.add_peer("AA:BB:CC:DD:EE:01", "desk").unwrap();
        assert_eq!(mgr.peer_count(), 1);
        assert!(matches!(
            mgr.add_peer("not-a-mac", ""),
            Err(EspNowError::InvalidMac(_))
        ));
    }

    #[tokio::test]
    async fn full_table_rejects_when_all_peers_live() {
        let (mgr, _) = manager();
        for i in 0..MAX_PEERS as u8 {
            mgr.add_peer(&mac(i).to_string(), "").unwrap();
        }
        assert!(matches!(
            mgr.add_peer("11:22:33:44:55:66", ""),
            Err(EspNowError::TableFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_evicts_oldest_inactive_peer() {
        let (mgr, _) = manager();
        for i in 0..MAX_PEERS as u8 {
            mgr.add_peer(&mac(i).to_string(), "").unwrap();
        }
        // Let two peers go stale; peer 0 is the older of the two.
        tokio::time::advance(PEER_TIMEOUT + Duration::from_secs(1)).await;
        mgr.sweep();
        // Everyone is stale now; refresh all but 0 and 1 by sending.
        for i in 2..MAX_PEERS as u8 {
            mgr.send(mac(i), b"x").unwrap();
        }
        mgr.note_frame(&RadioFrame {
            source: mac(1),
            rssi: -40,
            payload: vec![],
        });

        // Table is full; peer 0 has the oldest last-seen among the
        // inactive entries, so it is the one evicted.
        mgr.add_peer("11:22:33:44:55:66", "new").unwrap();
        assert_eq!(mgr.peer_count(), MAX_PEERS);
        let snapshot = mgr.peers_snapshot();
        assert!(!snapshot.iter().any(|p| p.mac == mac(0).to_string()));
        assert!(snapshot.iter().any(|p| p.mac == "11:22:33:44:55:66"));
    }

    #[tokio::test]
    async fn unicast_requires_known_peer_broadcast_auto_adds() {
        let (mgr, driver) = manager();
        assert!(matches!(
            mgr.send(mac(9), b"hi"),
            Err(EspNowError::UnknownPeer(_))
        ));

        mgr.broadcast(b"to-everyone").unwrap();
        assert_eq!(mgr.peer_count(), 1);
        let sent = driver.sent.lock().unwrap();
        assert_eq!(sent[0].0, MacAddr::BROADCAST);
        assert_eq!(sent[0].1, b"to-everyone");
    }

    #[tokio::test]
    async fn driver_errors_count_and_surface_without_retry() {
        let (mgr, driver) = manager();
        mgr.add_peer(&mac(1).to_string(), "").unwrap();
        driver.fail.store(true, Ordering::SeqCst);
        assert!(matches!(mgr.send(mac(1), b"x"), Err(EspNowError::Driver(_))));
        assert_eq!(mgr.stats_snapshot().send_errors, 1);
        assert_eq!(mgr.stats_snapshot().sent, 0);
        assert!(driver.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_marks_idle_peers_inactive_but_keeps_them() {
        let (mgr, _) = manager();
        mgr.add_peer(&mac(1).to_string(), "kiosk").unwrap();
        tokio::time::advance(PEER_TIMEOUT + Duration::from_secs(1)).await;
        mgr.sweep();

        let snapshot = mgr.peers_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].active);

        // A received frame brings the peer back.
        mgr.note_frame(&RadioFrame {
            source: mac(1),
            rssi: -50,
            payload: vec![],
        });
        assert!(mgr.peers_snapshot()[0].active);
    }

    #[tokio::test]
    async fn status_buckets_online_offline_degraded() {
        let (mgr, _) = manager();
        for (i, rssi) in [(1u8, -40), (2, -90)] {
            mgr.note_frame(&RadioFrame {
                source: mac(i),
                rssi,
                payload: vec![],
            });
        }
        mgr.add_peer(&mac(3).to_string(), "").unwrap();

        // Force peer 3 inactive directly through a sweep after idling.
        {
            let mut peers = mgr.peers.lock().unwrap();
            peers.iter_mut().find(|p| p.mac == mac(3)).unwrap().active = false;
        }

        let status = mgr.status_data();
        assert!(status.is_initialized);
        assert_eq!(status.peer_count, 3);
        assert_eq!(status.online_peers, vec![mac(1).to_string()]);
        assert_eq!(status.degraded_peers, vec![mac(2).to_string()]);
        assert_eq!(status.offline_peers, vec![mac(3).to_string()]);
    }

    #[tokio::test]
    async fn history_is_bounded_to_last_fifty() {
        let (mgr, _) = manager();
        for n in 0..(HISTORY_LIMIT + 10) {
            mgr.note_frame(&RadioFrame {
                source: mac(1),
                rssi: -40,
                payload: vec![n as u8],
            });
        }
        let history = mgr.history_snapshot();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0], vec![10u8]);
    }
}
