//! Device identity and liveness figures.
//!
//! One `DeviceIdentity` is built at boot and shared read-only.  It owns the
//! static facts (names, chip data, MAC) and the process clock, and builds
//! the payload blocks for registration, heartbeat, and health frames.

use chrono::{SecondsFormat, Utc};
use jr_protocol::{HealthData, HeartbeatData, MacAddr, RegistrationData};
use crate::prefs::ConnectionMode;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LIBRARY_NAME: &str = "junction-relay-rs";

/// Static facts about the hardware this node runs on.
#[derive(Debug, Clone)]
pub struct DeviceFacts {
    pub device_name: String,
    pub device_model: String,
    pub chip_model: String,
    pub chip_revision: u16,
    pub cpu_freq_mhz: u32,
    pub flash_size: u64,
    pub heap_size: u64,
}

impl Default for DeviceFacts {
    fn default() -> Self {
        DeviceFacts {
            device_name: "JunctionRelay Node".to_owned(),
            device_model: "JunctionRelay Relay".to_owned(),
            chip_model: std::env::consts::ARCH.to_owned(),
            chip_revision: 1,
            cpu_freq_mhz: 240,
            flash_size: 16 * 1024 * 1024,
            heap_size: 256 * 1024 * 1024,
        }
    }
}

/// Heap figures for liveness reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFigures {
    pub heap_size: u64,
    pub free_heap: u64,
    pub max_alloc_heap: u64,
}

pub struct DeviceIdentity {
    facts: DeviceFacts,
    mac: MacAddr,
    started: std::time::Instant,
}

impl DeviceIdentity {
    pub fn new(facts: DeviceFacts, mac: MacAddr) -> Self {
        DeviceIdentity {
            facts,
            mac,
            started: std::time::Instant::now(),
        }
    }

    pub fn facts(&self) -> &DeviceFacts {
        &self.facts
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn mac_string(&self) -> String {
        self.mac.to_string()
    }

    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Millisecond-precision UTC timestamp for outbound frames.
    pub fn timestamp(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Current heap figures: the configured budget against the process's
    /// resident size, so the reported numbers stay live and bounded.
    pub fn memory(&self) -> MemoryFigures {
        let used = process_resident_bytes()
            .unwrap_or(0)
            .min(self.facts.heap_size);
        let free = self.facts.heap_size - used;
        MemoryFigures {
            heap_size: self.facts.heap_size,
            free_heap: free,
            max_alloc_heap: free,
        }
    }

    pub fn capabilities(&self) -> Vec<String> {
        ["display", "sensor-routing", "espnow", "mqtt", "gateway", "ota"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    }

    // -- frame payload builders ---------------------------------------------

    pub fn registration_data(&self, mode: ConnectionMode, ip: &str) -> RegistrationData {
        RegistrationData {
            device_name: self.facts.device_name.clone(),
            firmware_version: FIRMWARE_VERSION.to_owned(),
            device_model: self.facts.device_model.clone(),
            connection_mode: mode.as_str().to_owned(),
            ip_address: ip.to_owned(),
            chip_model: self.facts.chip_model.clone(),
            chip_revision: self.facts.chip_revision,
            cpu_freq_mhz: self.facts.cpu_freq_mhz,
            flash_size: self.facts.flash_size,
            library: format!("{} {}", LIBRARY_NAME, FIRMWARE_VERSION),
            capabilities: self.capabilities(),
            supported_protocols: supported_protocols(mode),
        }
    }

    pub fn heartbeat_data(
        &self,
        connection_type: &str,
        wifi_rssi: Option<i32>,
    ) -> HeartbeatData {
        HeartbeatData {
            uptime_ms: self.uptime_ms(),
            free_heap: self.memory().free_heap,
            connection_type: connection_type.to_owned(),
            wifi_rssi,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn health_data(
        &self,
        connection_type: &str,
        ip: &str,
        wifi_rssi: Option<i32>,
        reconnect_attempts: u32,
        is_welcome_received: bool,
        is_registered: bool,
    ) -> HealthData {
        let memory = self.memory();
        HealthData {
            free_heap: memory.free_heap,
            heap_size: memory.heap_size,
            max_alloc_heap: memory.max_alloc_heap,
            uptime_ms: self.uptime_ms(),
            cpu_freq_mhz: self.facts.cpu_freq_mhz,
            connection_type: connection_type.to_owned(),
            ip_address: ip.to_owned(),
            mac_address: self.mac_string(),
            wifi_rssi,
            chip_model: self.facts.chip_model.clone(),
            chip_revision: self.facts.chip_revision,
            flash_size: self.facts.flash_size,
            firmware_version: FIRMWARE_VERSION.to_owned(),
            reconnect_attempts,
            is_welcome_received,
            is_registered,
            battery_percent: None,
            battery_voltage: None,
            temperature_c: None,
        }
    }
}

/// Uplink protocols this node can speak given its connection mode.
pub fn supported_protocols(mode: ConnectionMode) -> Vec<String> {
    let names: &[&str] = match mode {
        ConnectionMode::EspNow => &["espnow"],
        ConnectionMode::Gateway => &["websocket", "http", "mqtt", "espnow"],
        _ => &["websocket", "http", "mqtt"],
    };
    names.iter().map(|s| (*s).to_owned()).collect()
}

fn process_resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}
