// jr-protocol: JunctionRelay wire types and serialization.
//
// All uplink session frames use a top-level `type` field for discriminated
// deserialization.  General data envelopes (config/sensor documents) stay
// schemaless: renderer-specific payload fields must pass through the core
// untouched, so they are carried as an owned JSON document with typed
// accessors for the few fields the core routes on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// MacAddr
// ---------------------------------------------------------------------------

/// A 6-byte radio/peer MAC address.
///
/// Parses and formats as `XX:XX:XX:XX:XX:XX` (upper-case hex on output,
/// either case accepted on input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(MacParseError(s.to_owned()));
            }
            if part.len() != 2 {
                return Err(MacParseError(s.to_owned()));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_owned()))?;
            count += 1;
        }
        if count != 6 {
            return Err(MacParseError(s.to_owned()));
        }
        Ok(MacAddr(octets))
    }
}

/// Error returned when a MAC string is not `XX:XX:XX:XX:XX:XX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacParseError(pub String);

impl fmt::Display for MacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address '{}'", self.0)
    }
}

impl std::error::Error for MacParseError {}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Envelope type tags
// ---------------------------------------------------------------------------

/// The `type` values the dispatcher routes on.  Uplink-internal frame types
/// are covered by [`UplinkFrame`] instead.
pub mod msg_types {
    pub const CONFIG: &str = "config";
    pub const SENSOR: &str = "sensor";
    pub const MQTT_SUBSCRIPTION_REQUEST: &str = "MQTT_Subscription_Request";
    pub const WIPE_PREFERENCES: &str = "wipe_preferences";
    pub const WIPE_PREFERENCES_RESPONSE: &str = "wipe_preferences_response";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A parsed inbound document: a JSON object carrying a `type` tag, optional
/// routing fields, and free-form renderer payload.
///
/// Cloning is a deep copy of the document — this is the one copy an envelope
/// pays when crossing a dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Parse an envelope from raw payload bytes.
    ///
    /// Rejects valid JSON that is not an object: a bare array or scalar has
    /// no `type` field and cannot be routed.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(EnvelopeError::Json)?;
        match value {
            Value::Object(map) => Ok(Envelope(map)),
            other => Err(EnvelopeError::NotAnObject(value_kind(&other))),
        }
    }

    /// Wrap an already-parsed JSON object.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Object(map) => Ok(Envelope(map)),
            other => Err(EnvelopeError::NotAnObject(value_kind(&other))),
        }
    }

    /// An empty `{}` document — the fallback config routed when the renderer
    /// rejects a real one.
    pub fn empty() -> Self {
        Envelope(Map::new())
    }

    /// The `type` tag, when present and a string.
    pub fn msg_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The `destination` MAC string, when present and non-empty.
    pub fn destination(&self) -> Option<&str> {
        match self.0.get("destination").and_then(Value::as_str) {
            Some("") | None => None,
            Some(mac) => Some(mac),
        }
    }

    /// Remove the `destination` field, returning the removed value if it was
    /// a non-empty string.  Used before a gateway forward so the addressed
    /// peer does not try to forward the document again.
    pub fn take_destination(&mut self) -> Option<String> {
        match self.0.remove("destination") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// The `screenId` field, when present and a string.
    pub fn screen_id(&self) -> Option<&str> {
        self.0.get("screenId").and_then(Value::as_str)
    }

    /// The `subscriptions` array entries that are strings, in order.
    /// Empty when the field is absent or not an array.
    pub fn subscriptions(&self) -> Vec<&str> {
        self.0
            .get("subscriptions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Access an arbitrary payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Serialize back to compact JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_vec(&Value::Object(self.0.clone())).unwrap_or_default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Errors from envelope parsing.
#[derive(Debug)]
pub enum EnvelopeError {
    Json(serde_json::Error),
    NotAnObject(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Json(e) => write!(f, "JSON parse: {}", e),
            EnvelopeError::NotAnObject(kind) => {
                write!(f, "envelope must be a JSON object, got {}", kind)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

// ---------------------------------------------------------------------------
// Uplink frame payloads (device -> backend)
// ---------------------------------------------------------------------------

/// Identity block sent in `device-registration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    pub device_name: String,
    pub firmware_version: String,
    pub device_model: String,
    pub connection_mode: String,
    pub ip_address: String,
    pub chip_model: String,
    pub chip_revision: u16,
    #[serde(rename = "cpuFreqMHz")]
    pub cpu_freq_mhz: u32,
    pub flash_size: u64,
    pub library: String,
    pub capabilities: Vec<String>,
    pub supported_protocols: Vec<String>,
}

/// Periodic liveness block sent in `heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub uptime_ms: u64,
    pub free_heap: u64,
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i32>,
}

/// Full health report sent in `health` (periodic and on `health-request`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub free_heap: u64,
    pub heap_size: u64,
    pub max_alloc_heap: u64,
    pub uptime_ms: u64,
    #[serde(rename = "cpuFreqMHz")]
    pub cpu_freq_mhz: u32,
    pub connection_type: String,
    pub ip_address: String,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i32>,
    pub chip_model: String,
    pub chip_revision: u16,
    pub flash_size: u64,
    pub firmware_version: String,
    pub reconnect_attempts: u32,
    pub is_welcome_received: bool,
    pub is_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
}

/// Peer-radio summary sent in `espnow-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspNowStatusData {
    pub is_initialized: bool,
    pub peer_count: u32,
    pub online_peers: Vec<String>,
    pub offline_peers: Vec<String>,
    pub degraded_peers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Uplink frames
// ---------------------------------------------------------------------------

/// An outbound frame body: `timestamp` + `deviceMac` + typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub timestamp: String,
    pub device_mac: String,
    pub data: RegistrationData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFrame {
    pub timestamp: String,
    pub device_mac: String,
    pub data: HeartbeatData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthFrame {
    pub timestamp: String,
    pub device_mac: String,
    pub data: HealthData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspNowStatusFrame {
    pub timestamp: String,
    pub device_mac: String,
    pub data: EspNowStatusData,
}

/// Backend greeting; payload fields are advisory and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {}

/// Registration acknowledgement; `status` is advisory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistrationAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAck {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAck {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EspNowStatusRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EspNowStatusAck {}

/// Backend-reported error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// All uplink session frame kinds, tagged by the `type` field.
///
/// ```json
/// { "type": "device-registration", "timestamp": "...", "deviceMac": "...", "data": { ... } }
/// ```
///
/// Inbound text that fails to deserialize as an `UplinkFrame` is not an
/// error: it is a general envelope (remote command fan-in) and is handed to
/// the dispatcher instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UplinkFrame {
    #[serde(rename = "welcome")]
    Welcome(Welcome),
    #[serde(rename = "device-registration")]
    DeviceRegistration(DeviceRegistration),
    #[serde(rename = "device-registration-ack")]
    DeviceRegistrationAck(DeviceRegistrationAck),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatFrame),
    #[serde(rename = "heartbeat-ack")]
    HeartbeatAck(HeartbeatAck),
    #[serde(rename = "health")]
    Health(HealthFrame),
    #[serde(rename = "health-ack")]
    HealthAck(HealthAck),
    #[serde(rename = "health-request")]
    HealthRequest(HealthRequest),
    #[serde(rename = "config-ack")]
    ConfigAck(ConfigAck),
    #[serde(rename = "espnow-status-request")]
    EspNowStatusRequest(EspNowStatusRequest),
    #[serde(rename = "espnow-status")]
    EspNowStatus(EspNowStatusFrame),
    #[serde(rename = "espnow-status-ack")]
    EspNowStatusAck(EspNowStatusAck),
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_both_cases_and_formats_upper() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
        let same: MacAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(mac, same);
    }

    #[test]
    fn mac_rejects_malformed_strings() {
        for bad in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FF:00", "GG:BB:CC:DD:EE:FF", "AABBCCDDEEFF", "A:BB:CC:DD:EE:FF"] {
            assert!(bad.parse::<MacAddr>().is_err(), "should reject '{}'", bad);
        }
    }

    #[test]
    fn broadcast_is_all_ones() {
        assert_eq!(MacAddr::BROADCAST.to_string(), "FF:FF:FF:FF:FF:FF");
        assert!(MacAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn envelope_routing_accessors() {
        let mut env = Envelope::from_slice(
            br#"{"type":"config","screenId":"0x3C","destination":"AA:BB:CC:DD:EE:FF","brightness":7}"#,
        )
        .unwrap();
        assert_eq!(env.msg_type(), Some("config"));
        assert_eq!(env.screen_id(), Some("0x3C"));
        assert_eq!(env.destination(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(env.get("brightness"), Some(&serde_json::json!(7)));

        let taken = env.take_destination().unwrap();
        assert_eq!(taken, "AA:BB:CC:DD:EE:FF");
        assert_eq!(env.destination(), None);
        // Payload fields survive the removal.
        assert_eq!(env.get("brightness"), Some(&serde_json::json!(7)));
    }

    #[test]
    fn empty_destination_is_not_a_forward_candidate() {
        let mut env = Envelope::from_slice(br#"{"type":"sensor","destination":""}"#).unwrap();
        assert_eq!(env.destination(), None);
        assert_eq!(env.take_destination(), None);
    }

    #[test]
    fn envelope_rejects_non_objects() {
        assert!(Envelope::from_slice(b"[1,2,3]").is_err());
        assert!(Envelope::from_slice(b"42").is_err());
        assert!(Envelope::from_slice(b"not json").is_err());
    }

    #[test]
    fn subscriptions_keeps_order_and_skips_non_strings() {
        let env =
            Envelope::from_slice(br#"{"type":"MQTT_Subscription_Request","subscriptions":["a/b",3,"c/d"]}"#)
                .unwrap();
        assert_eq!(env.subscriptions(), vec!["a/b", "c/d"]);
    }

    #[test]
    fn uplink_frame_discriminates_on_type() {
        let frame: UplinkFrame = serde_json::from_str(r#"{"type":"welcome","server":"jr"}"#).unwrap();
        assert!(matches!(frame, UplinkFrame::Welcome(_)));

        let frame: UplinkFrame =
            serde_json::from_str(r#"{"type":"device-registration-ack","status":"ok"}"#).unwrap();
        match frame {
            UplinkFrame::DeviceRegistrationAck(ack) => assert_eq!(ack.status.as_deref(), Some("ok")),
            other => panic!("expected ack, got {:?}", other),
        }

        // Unknown tag is a deserialize error — callers fall back to Envelope.
        assert!(serde_json::from_str::<UplinkFrame>(r#"{"type":"sensor","v":1}"#).is_err());
    }

    #[test]
    fn heartbeat_serializes_camel_case_wire_names() {
        let frame = UplinkFrame::Heartbeat(HeartbeatFrame {
            timestamp: "2026-08-01T00:00:00Z".to_owned(),
            device_mac: "AA:BB:CC:DD:EE:FF".to_owned(),
            data: HeartbeatData {
                uptime_ms: 1234,
                free_heap: 98_304,
                connection_type: "wifi".to_owned(),
                wifi_rssi: Some(-61),
            },
        });
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["deviceMac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["data"]["uptimeMs"], 1234);
        assert_eq!(json["data"]["freeHeap"], 98_304);
        assert_eq!(json["data"]["wifiRssi"], -61);
    }

    #[test]
    fn registration_uses_the_mhz_wire_casing() {
        let data = RegistrationData {
            device_name: "Desk Node".to_owned(),
            firmware_version: "1.0.0".to_owned(),
            device_model: "JunctionRelay Relay".to_owned(),
            connection_mode: "wifi".to_owned(),
            ip_address: "192.168.1.40".to_owned(),
            chip_model: "ESP32-S3".to_owned(),
            chip_revision: 1,
            cpu_freq_mhz: 240,
            flash_size: 16 * 1024 * 1024,
            library: "junction-relay-rs 1.0.0".to_owned(),
            capabilities: vec![],
            supported_protocols: vec![],
        };
        let json = serde_json::to_value(&data).unwrap();
        // The frequency field is `cpuFreqMHz`, not camelCase `cpuFreqMhz`.
        assert_eq!(json["cpuFreqMHz"], 240);
        assert!(json.get("cpuFreqMhz").is_none());
    }

    #[test]
    fn optional_health_fields_are_omitted_when_absent() {
        let data = HealthData {
            free_heap: 1,
            heap_size: 2,
            max_alloc_heap: 3,
            uptime_ms: 4,
            cpu_freq_mhz: 240,
            connection_type: "ethernet".to_owned(),
            ip_address: "192.168.1.50".to_owned(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_owned(),
            wifi_rssi: None,
            chip_model: "ESP32-S3".to_owned(),
            chip_revision: 1,
            flash_size: 8 * 1024 * 1024,
            firmware_version: "1.0.0".to_owned(),
            reconnect_attempts: 0,
            is_welcome_received: true,
            is_registered: true,
            battery_percent: None,
            battery_voltage: None,
            temperature_c: None,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("wifiRssi").is_none());
        assert!(json.get("batteryPercent").is_none());
        assert_eq!(json["isWelcomeReceived"], true);
        assert_eq!(json["cpuFreqMHz"], 240);
        assert!(json.get("cpuFreqMhz").is_none());
    }
}
