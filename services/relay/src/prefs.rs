//! Persistent device preferences.
//!
//! A keyed string/int/bool store backed by SQLite in the node's data
//! directory.  Read at init and snapshot-read afterwards; all mutations are
//! scoped to the admin handler task (and the wipe path).  Typed getters
//! apply the documented defaults, and an invalid stored backend port is
//! replaced by the default on load.

use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BACKEND_PORT: u16 = 7180;

const SCHEMA_SQL: &str =
    "CREATE TABLE IF NOT EXISTS prefs (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

/// Preference keys.  These are the wire names used by
/// `POST /api/device/set-preferences` and the on-flash store alike.
pub mod keys {
    pub const CONN_MODE: &str = "connMode";
    pub const SSID: &str = "ssid";
    pub const PASS: &str = "pass";
    pub const MQTT_BROKER: &str = "mqttBroker";
    pub const MQTT_USERNAME: &str = "mqttUsername";
    pub const MQTT_PASSWORD: &str = "mqttPassword";
    pub const BACKEND_PORT: &str = "backendPort";
    pub const ROTATION: &str = "rotation";
    pub const SWAP_BLUE_GREEN: &str = "swapBlueGreen";
    pub const NEO_PIN1: &str = "neoPin1";
    pub const NEO_PIN2: &str = "neoPin2";
}

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

pub type PrefsResult<T> = Result<T, PrefsError>;

// ---------------------------------------------------------------------------
// Connection mode
// ---------------------------------------------------------------------------

/// The persisted transport selection.  `Unset` is first boot: the node shows
/// the configuration portal instead of starting a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Unset,
    Wifi,
    Ethernet,
    EspNow,
    Gateway,
}

impl ConnectionMode {
    pub fn parse(s: &str) -> ConnectionMode {
        match s {
            "wifi" => ConnectionMode::Wifi,
            "ethernet" => ConnectionMode::Ethernet,
            "espnow" => ConnectionMode::EspNow,
            "gateway" => ConnectionMode::Gateway,
            _ => ConnectionMode::Unset,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Unset => "",
            ConnectionMode::Wifi => "wifi",
            ConnectionMode::Ethernet => "ethernet",
            ConnectionMode::EspNow => "espnow",
            ConnectionMode::Gateway => "gateway",
        }
    }

    /// Modes that bridge the peer radio.
    pub fn uses_radio(self) -> bool {
        matches!(self, ConnectionMode::EspNow | ConnectionMode::Gateway)
    }

    /// Modes that bring up IP networking.
    pub fn uses_ip(self) -> bool {
        matches!(
            self,
            ConnectionMode::Wifi | ConnectionMode::Ethernet | ConnectionMode::Gateway
        )
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Settings snapshot
// ---------------------------------------------------------------------------

/// All preferences, loaded as one consistent view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    pub conn_mode: ConnectionMode,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_broker: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub backend_port: u16,
    pub rotation: i64,
    pub swap_blue_green: bool,
    pub neo_pin1: i64,
    pub neo_pin2: i64,
}

impl DeviceSettings {
    pub fn has_wifi_credentials(&self) -> bool {
        !self.wifi_ssid.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Prefs {
    conn: Connection,
}

impl Prefs {
    pub fn open(path: &Path) -> PrefsResult<Self> {
        let conn = Connection::open(path)?;
        let prefs = Self { conn };
        prefs.apply_schema()?;
        Ok(prefs)
    }

    pub fn open_in_memory() -> PrefsResult<Self> {
        let conn = Connection::open_in_memory()?;
        let prefs = Self { conn };
        prefs.apply_schema()?;
        Ok(prefs)
    }

    fn apply_schema(&self) -> PrefsResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -- typed getters ------------------------------------------------------

    pub fn get_string(&self, key: &str, default: &str) -> PrefsResult<String> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM prefs WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
        match rows.next().transpose()? {
            Some(v) => Ok(v),
            None => Ok(default.to_owned()),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> PrefsResult<i64> {
        let raw = self.get_string(key, "")?;
        Ok(raw.parse().unwrap_or(default))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> PrefsResult<bool> {
        let raw = self.get_string(key, "")?;
        match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Ok(default),
        }
    }

    // -- typed setters ------------------------------------------------------

    pub fn put_string(&self, key: &str, value: &str) -> PrefsResult<()> {
        self.conn.execute(
            "INSERT INTO prefs (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn put_int(&self, key: &str, value: i64) -> PrefsResult<()> {
        self.put_string(key, &value.to_string())
    }

    pub fn put_bool(&self, key: &str, value: bool) -> PrefsResult<()> {
        self.put_string(key, if value { "true" } else { "false" })
    }

    /// Erase every stored preference.
    pub fn wipe(&self) -> PrefsResult<()> {
        self.conn.execute_batch("DELETE FROM prefs")?;
        Ok(())
    }

    // -- snapshot -----------------------------------------------------------

    /// Load all settings with defaults applied.  A stored backend port
    /// outside `1..=65535` is replaced by [`DEFAULT_BACKEND_PORT`].
    pub fn load(&self) -> PrefsResult<DeviceSettings> {
        let raw_port = self.get_int(keys::BACKEND_PORT, i64::from(DEFAULT_BACKEND_PORT))?;
        let backend_port = if (1..=65535).contains(&raw_port) {
            raw_port as u16
        } else {
            DEFAULT_BACKEND_PORT
        };

        Ok(DeviceSettings {
            conn_mode: ConnectionMode::parse(&self.get_string(keys::CONN_MODE, "")?),
            wifi_ssid: self.get_string(keys::SSID, "")?,
            wifi_password: self.get_string(keys::PASS, "")?,
            mqtt_broker: self.get_string(keys::MQTT_BROKER, "")?,
            mqtt_username: self.get_string(keys::MQTT_USERNAME, "")?,
            mqtt_password: self.get_string(keys::MQTT_PASSWORD, "")?,
            backend_port,
            rotation: self.get_int(keys::ROTATION, 0)?,
            swap_blue_green: self.get_bool(keys::SWAP_BLUE_GREEN, false)?,
            neo_pin1: self.get_int(keys::NEO_PIN1, -1)?,
            neo_pin2: self.get_int(keys::NEO_PIN2, -1)?,
        })
    }
}
