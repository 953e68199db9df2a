//! Local admin HTTP surface.
//!
//! Routes:
//!   GET  /api/device/capabilities   - capability document
//!   GET  /api/device/info           - device identity
//!   GET  /api/device/preferences    - current settings
//!   POST /api/device/set-preferences- persist settings, restart if needed
//!   POST /api/device/wipe-preferences - erase all, restart
//!   GET  /api/connection/status     - aggregated connection snapshot
//!   GET  /api/system/stats          - queues, memory, dispatch, session
//!   GET  /api/system/statslite      - compact poller variant
//!   GET  /api/gateway/status        - gateway readiness
//!   GET|POST|DELETE /api/espnow/peers - peer table CRUD
//!   GET  /api/espnow/status         - peer summary
//!   GET  /api/espnow/stats          - radio counters
//!   POST /api/ota/firmware          - staged firmware upload, then reboot
//!   GET  /api/health/heartbeat      - liveness probe (backend discovery target)
//!
//! No authentication; the surface is device-local.

use crate::broker::BrokerHandle;
use crate::dispatch::Dispatcher;
use crate::espnow::EspNowManager;
use crate::identity::{DeviceIdentity, FIRMWARE_VERSION, LIBRARY_NAME};
use crate::prefs::{DeviceSettings, Prefs, keys};
use crate::queues::QueueStats;
use crate::restart::{
    PREFS_RESTART_DELAY, RestartHandle, RestartReason, WIPE_RESTART_DELAY,
};
use crate::status::StatusAggregator;
use crate::supervisor::{MDNS_SERVICE, PrimaryProtocol};
use crate::uplink::SessionStats;
use crate::workers::ConfigState;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub prefs: Arc<Mutex<Prefs>>,
    pub identity: Arc<DeviceIdentity>,
    pub status: Arc<StatusAggregator>,
    pub dispatcher: Arc<Dispatcher>,
    pub sensor_stats: Arc<QueueStats>,
    pub config_stats: Arc<QueueStats>,
    pub config_state: Arc<ConfigState>,
    pub session_stats: Arc<SessionStats>,
    pub espnow: Option<Arc<EspNowManager>>,
    pub broker: Option<BrokerHandle>,
    pub restart: RestartHandle,
    pub primary: PrimaryProtocol,
    pub data_dir: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/device/capabilities", get(device_capabilities))
        .route("/api/device/info", get(device_info))
        .route("/api/device/preferences", get(device_preferences))
        .route("/api/device/set-preferences", post(set_preferences))
        .route("/api/device/wipe-preferences", post(wipe_preferences))
        .route("/api/connection/status", get(connection_status))
        .route("/api/system/stats", get(system_stats))
        .route("/api/system/statslite", get(system_statslite))
        .route("/api/gateway/status", get(gateway_status))
        .route(
            "/api/espnow/peers",
            get(espnow_peers).post(espnow_add_peer).delete(espnow_remove_peer),
        )
        .route("/api/espnow/status", get(espnow_status))
        .route("/api/espnow/stats", get(espnow_stats))
        .route("/api/ota/firmware", post(ota_firmware))
        .route("/api/health/heartbeat", get(health_heartbeat))
        .with_state(state)
}

/// Serve the admin API until shutdown flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

async fn device_capabilities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "capabilities": state.identity.capabilities(),
        "primaryProtocol": state.primary,
        "espnowInitialized": state.espnow.is_some(),
        "mqttConfigured": state.broker.is_some(),
    }))
}

async fn device_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let facts = state.identity.facts();
    Json(json!({
        "deviceName": facts.device_name,
        "deviceModel": facts.device_model,
        "firmwareVersion": FIRMWARE_VERSION,
        "library": LIBRARY_NAME,
        "chipModel": facts.chip_model,
        "chipRevision": facts.chip_revision,
        "cpuFreqMHz": facts.cpu_freq_mhz,
        "flashSize": facts.flash_size,
        "mac": state.identity.mac_string(),
        "uptimeMs": state.identity.uptime_ms(),
    }))
}

async fn device_preferences(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let prefs = state.prefs.lock().await;
    match prefs.load() {
        Ok(settings) => Json(serde_json::to_value(settings).unwrap_or_default()).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Body of `POST /api/device/set-preferences`.  All fields optional; only
/// supplied ones are persisted.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPreferencesBody {
    pub conn_mode: Option<String>,
    #[serde(rename = "wifiSSID")]
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub mqtt_broker: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub backend_port: Option<i64>,
    pub rotation: Option<i64>,
    pub swap_blue_green: Option<bool>,
    #[serde(rename = "externalNeoPixelsData1")]
    pub neo_pin1: Option<i64>,
    #[serde(rename = "externalNeoPixelsData2")]
    pub neo_pin2: Option<i64>,
    pub restart: Option<bool>,
}

/// Restart is demanded by mode/credential/pin changes, not cosmetic ones.
fn restart_needed(current: &DeviceSettings, body: &SetPreferencesBody) -> bool {
    if body.restart == Some(true) {
        return true;
    }
    let mode_changed = body
        .conn_mode
        .as_ref()
        .is_some_and(|m| *m != current.conn_mode.as_str());
    let ssid_changed = body
        .wifi_ssid
        .as_ref()
        .is_some_and(|s| *s != current.wifi_ssid);
    let pass_changed = body
        .wifi_password
        .as_ref()
        .is_some_and(|p| *p != current.wifi_password);
    let pins_changed = body.neo_pin1.is_some_and(|p| p != current.neo_pin1)
        || body.neo_pin2.is_some_and(|p| p != current.neo_pin2);
    mode_changed || ssid_changed || pass_changed || pins_changed
}

async fn set_preferences(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetPreferencesBody>,
) -> impl IntoResponse {
    let prefs = state.prefs.lock().await;
    let current = match prefs.load() {
        Ok(settings) => settings,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let needs_restart = restart_needed(&current, &body);

    let result = (|| {
        if let Some(v) = &body.conn_mode {
            prefs.put_string(keys::CONN_MODE, v)?;
        }
        if let Some(v) = &body.wifi_ssid {
            prefs.put_string(keys::SSID, v)?;
        }
        if let Some(v) = &body.wifi_password {
            prefs.put_string(keys::PASS, v)?;
        }
        if let Some(v) = &body.mqtt_broker {
            prefs.put_string(keys::MQTT_BROKER, v)?;
        }
        if let Some(v) = &body.mqtt_username {
            prefs.put_string(keys::MQTT_USERNAME, v)?;
        }
        if let Some(v) = &body.mqtt_password {
            prefs.put_string(keys::MQTT_PASSWORD, v)?;
        }
        if let Some(v) = body.backend_port {
            prefs.put_int(keys::BACKEND_PORT, v)?;
        }
        if let Some(v) = body.rotation {
            prefs.put_int(keys::ROTATION, v)?;
        }
        if let Some(v) = body.swap_blue_green {
            prefs.put_bool(keys::SWAP_BLUE_GREEN, v)?;
        }
        if let Some(v) = body.neo_pin1 {
            prefs.put_int(keys::NEO_PIN1, v)?;
        }
        if let Some(v) = body.neo_pin2 {
            prefs.put_int(keys::NEO_PIN2, v)?;
        }
        Ok::<(), crate::prefs::PrefsError>(())
    })();

    match result {
        Ok(()) => {
            if needs_restart {
                info!("preference change demands restart");
                state
                    .restart
                    .schedule(PREFS_RESTART_DELAY, RestartReason::PreferencesChanged);
            }
            Json(json!({ "success": true, "restartNeeded": needs_restart })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "set-preferences failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn wipe_preferences(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.prefs.lock().await.wipe();
    state.config_state.reset();
    // Restart happens even when the erase failed.
    state
        .restart
        .schedule(WIPE_RESTART_DELAY, RestartReason::PreferencesWiped);
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => {
            warn!(error = %e, "wipe failed, restarting anyway");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Status & stats
// ---------------------------------------------------------------------------

async fn connection_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::to_value(state.status.snapshot()).unwrap_or_default())
}

async fn system_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let memory = state.identity.memory();
    let espnow = state.espnow.as_ref().map(|e| e.stats_snapshot());
    Json(json!({
        "uptimeMs": state.identity.uptime_ms(),
        "memory": {
            "freeHeap": memory.free_heap,
            "heapSize": memory.heap_size,
            "maxAllocHeap": memory.max_alloc_heap,
        },
        "queues": {
            "sensor": state.sensor_stats.snapshot(),
            "config": state.config_stats.snapshot(),
        },
        "dispatch": state.dispatcher.stats_snapshot(),
        "config": state.config_state.snapshot(),
        "session": state.session_stats.snapshot(),
        "espnow": espnow,
        "broker": {
            "configured": state.broker.is_some(),
            "connected": state.broker.as_ref().is_some_and(BrokerHandle::is_connected),
        },
    }))
}

async fn system_statslite(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.status.snapshot();
    Json(json!({
        "uptimeMs": state.identity.uptime_ms(),
        "freeHeap": state.identity.memory().free_heap,
        "sensorQueueDepth": state.sensor_stats.snapshot().depth,
        "configQueueDepth": state.config_stats.snapshot().depth,
        "websocketConnected": snapshot.websocket_connected,
        "mqttConnected": snapshot.mqtt_connected,
        "hasReceivedConfig": state.config_state.snapshot().has_received_config,
    }))
}

async fn gateway_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway_active =
        state.primary == PrimaryProtocol::Gateway && state.espnow.is_some();
    Json(json!({
        "gatewayActive": gateway_active,
        "primaryProtocol": state.primary,
        "ethernetConnected": state.status.snapshot().ethernet_connected,
        "peerCount": state.espnow.as_ref().map_or(0, |e| e.peer_count()),
    }))
}

// ---------------------------------------------------------------------------
// Peer radio
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PeerBody {
    pub mac: String,
    #[serde(default)]
    pub name: String,
}

async fn espnow_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.espnow {
        Some(espnow) => Json(serde_json::to_value(espnow.peers_snapshot()).unwrap_or_default())
            .into_response(),
        None => espnow_unavailable(),
    }
}

async fn espnow_add_peer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PeerBody>,
) -> impl IntoResponse {
    match &state.espnow {
        Some(espnow) => match espnow.add_peer(&body.mac, &body.name) {
            Ok(mac) => Json(json!({ "success": true, "mac": mac.to_string() })).into_response(),
            Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        None => espnow_unavailable(),
    }
}

async fn espnow_remove_peer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PeerBody>,
) -> impl IntoResponse {
    match &state.espnow {
        Some(espnow) => match body.mac.parse::<jr_protocol::MacAddr>() {
            Ok(mac) => {
                let removed = espnow.remove_peer(mac);
                Json(json!({ "success": removed })).into_response()
            }
            Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        None => espnow_unavailable(),
    }
}

async fn espnow_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.espnow {
        Some(espnow) => {
            Json(serde_json::to_value(espnow.status_data()).unwrap_or_default()).into_response()
        }
        None => espnow_unavailable(),
    }
}

async fn espnow_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.espnow {
        Some(espnow) => {
            Json(serde_json::to_value(espnow.stats_snapshot()).unwrap_or_default()).into_response()
        }
        None => espnow_unavailable(),
    }
}

fn espnow_unavailable() -> axum::response::Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "peer radio not initialized")
}

// ---------------------------------------------------------------------------
// OTA & liveness
// ---------------------------------------------------------------------------

async fn ota_firmware(State(state): State<Arc<AppState>>, body: Body) -> impl IntoResponse {
    let staging_dir = state.data_dir.join("ota");
    if let Err(e) = tokio::fs::create_dir_all(&staging_dir).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    let staged_path = staging_dir.join("firmware.bin");
    let mut file = match tokio::fs::File::create(&staged_path).await {
        Ok(file) => file,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        hasher.update(&chunk);
        total += chunk.len() as u64;
        if let Err(e) = file.write_all(&chunk).await {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    }
    if let Err(e) = file.flush().await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let digest = format!("{:x}", hasher.finalize());
    info!(bytes = total, sha256 = %digest, "firmware staged, rebooting");
    state
        .restart
        .schedule(PREFS_RESTART_DELAY, RestartReason::FirmwareUpdated);
    Json(json!({ "success": true, "bytes": total, "sha256": digest })).into_response()
}

async fn health_heartbeat(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "service": MDNS_SERVICE,
        "uptimeMs": state.identity.uptime_ms(),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::ConnectionMode;

    fn settings() -> DeviceSettings {
        DeviceSettings {
            conn_mode: ConnectionMode::Wifi,
            wifi_ssid: "floor2".to_owned(),
            wifi_password: "hunter2".to_owned(),
            mqtt_broker: String::new(),
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            backend_port: 7180,
            rotation: 0,
            swap_blue_green: false,
            neo_pin1: -1,
            neo_pin2: -1,
        }
    }

    #[test]
    fn cosmetic_changes_do_not_demand_restart() {
        let body = SetPreferencesBody {
            rotation: Some(180),
            swap_blue_green: Some(true),
            mqtt_broker: Some("broker.local".to_owned()),
            backend_port: Some(9000),
            ..Default::default()
        };
        assert!(!restart_needed(&settings(), &body));
    }

    #[test]
    fn mode_credential_and_pin_changes_demand_restart() {
        let base = settings();
        for body in [
            SetPreferencesBody {
                conn_mode: Some("ethernet".to_owned()),
                ..Default::default()
            },
            SetPreferencesBody {
                wifi_ssid: Some("floor3".to_owned()),
                ..Default::default()
            },
            SetPreferencesBody {
                wifi_password: Some("changed".to_owned()),
                ..Default::default()
            },
            SetPreferencesBody {
                neo_pin1: Some(5),
                ..Default::default()
            },
            SetPreferencesBody {
                restart: Some(true),
                ..Default::default()
            },
        ] {
            assert!(restart_needed(&base, &body), "body: {:?}", body);
        }
    }

    #[test]
    fn unchanged_values_do_not_demand_restart() {
        let body = SetPreferencesBody {
            conn_mode: Some("wifi".to_owned()),
            wifi_ssid: Some("floor2".to_owned()),
            ..Default::default()
        };
        assert!(!restart_needed(&settings(), &body));
    }

    #[test]
    fn set_preferences_body_accepts_wire_field_names() {
        let body: SetPreferencesBody = serde_json::from_str(
            r#"{
                "connMode": "gateway",
                "wifiSSID": "net",
                "wifiPassword": "pw",
                "externalNeoPixelsData1": 12,
                "backendPort": 7200
            }"#,
        )
        .unwrap();
        assert_eq!(body.conn_mode.as_deref(), Some("gateway"));
        assert_eq!(body.wifi_ssid.as_deref(), Some("net"));
        assert_eq!(body.neo_pin1, Some(12));
        assert_eq!(body.backend_port, Some(7200));
    }
}
