//! Connection status aggregation.
//!
//! The aggregator coalesces the state of the network supervisor, uplink
//! session, peer radio, and broker client into one snapshot.  Components
//! write through `update`; a change recomputes the snapshot under a short
//! lock and pushes it by value to the single registered subscriber.

use serde::Serialize;
use std::sync::Mutex;

/// The aggregated connection snapshot served by `/api/connection/status`
/// and pushed to the UI subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub espnow_active: bool,
    pub wifi_connected: bool,
    pub mqtt_connected: bool,
    pub ethernet_connected: bool,
    pub websocket_connected: bool,
    pub ip_address: String,
    pub mac_address: String,
    pub network_type: String,
    pub backend_server_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethernet_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethernet_mac: Option<String>,
}

type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
pub struct StatusAggregator {
    status: Mutex<ConnectionStatus>,
    subscriber: Mutex<Option<StatusCallback>>,
}

impl StatusAggregator {
    pub fn new(mac_address: String) -> Self {
        let aggregator = StatusAggregator::default();
        aggregator
            .status
            .lock()
            .expect("status lock poisoned")
            .mac_address = mac_address;
        aggregator
    }

    /// Current snapshot, by value.
    pub fn snapshot(&self) -> ConnectionStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Register the single status subscriber, replacing any previous one.
    pub fn subscribe(&self, callback: impl Fn(ConnectionStatus) + Send + Sync + 'static) {
        *self.subscriber.lock().expect("subscriber lock poisoned") = Some(Box::new(callback));
    }

    /// Apply a mutation; when it changes the snapshot, notify the
    /// subscriber with the fresh value.  The status lock is released before
    /// the callback runs, so callbacks may call `snapshot`.
    pub fn update(&self, apply: impl FnOnce(&mut ConnectionStatus)) {
        let changed = {
            let mut status = self.status.lock().expect("status lock poisoned");
            let before = status.clone();
            apply(&mut status);
            if *status == before {
                None
            } else {
                Some(status.clone())
            }
        };

        if let Some(fresh) = changed {
            let subscriber = self.subscriber.lock().expect("subscriber lock poisoned");
            if let Some(callback) = subscriber.as_ref() {
                callback(fresh);
            }
        }
    }
}
