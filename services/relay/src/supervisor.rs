//! Network supervision.
//!
//! Resolves the boot plan from the persisted connection mode, owns the link
//! drivers, and runs the change monitor that debounces link state, emits
//! `(network, connected)` events, maintains the any-network-up signal the
//! uplink and broker wait on, and drives the mDNS advertiser seam.
//!
//! WiFi/ethernet hardware control and the mDNS responder itself are
//! peripheral integrations; the supervisor only talks to their traits.

use crate::prefs::{ConnectionMode, DeviceSettings};
use crate::status::StatusAggregator;
use jr_protocol::MacAddr;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Link poll / debounce cadence.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// mDNS service advertised whenever any network is up.
pub const MDNS_SERVICE: &str = "junctionrelay";
pub const MDNS_PORT: u16 = 80;

// Boot-loop heuristic bounds.
pub const BOOT_LOOP_WINDOW: Duration = Duration::from_secs(30);
pub const BOOT_LOOP_SPACING: Duration = Duration::from_secs(10);
pub const BOOT_LOOP_MAX_REENTRIES: usize = 2;

// ---------------------------------------------------------------------------
// Kinds, events, protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Wifi,
    Ethernet,
}

impl NetworkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkKind::Wifi => "wifi",
            NetworkKind::Ethernet => "ethernet",
        }
    }
}

/// Emitted on every debounced link transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEvent {
    pub kind: NetworkKind,
    pub connected: bool,
}

/// The node's main uplink transport, derived from the connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrimaryProtocol {
    #[serde(rename = "WEBSOCKET_HTTP")]
    WebsocketHttp,
    #[serde(rename = "ESPNOW")]
    EspNow,
    #[serde(rename = "GATEWAY")]
    Gateway,
}

impl PrimaryProtocol {
    pub fn derive(mode: ConnectionMode) -> PrimaryProtocol {
        match mode {
            ConnectionMode::EspNow => PrimaryProtocol::EspNow,
            ConnectionMode::Gateway => PrimaryProtocol::Gateway,
            _ => PrimaryProtocol::WebsocketHttp,
        }
    }
}

// ---------------------------------------------------------------------------
// Boot plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalReason {
    FirstBoot,
    MissingCredentials,
    BootLoop,
}

/// What `main` starts, decided once at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlan {
    /// Show the configuration portal; no network bring-up.
    CaptivePortal { reason: PortalReason },
    Network {
        primary: PrimaryProtocol,
        wifi_primary: bool,
        /// WiFi connects only while ethernet is down.
        wifi_backup: bool,
        ethernet: bool,
        radio: bool,
        /// mDNS advertisement and the admin HTTP server.
        ip_services: bool,
    },
}

/// Guards against crash-looping into network bring-up: more than
/// [`BOOT_LOOP_MAX_REENTRIES`] re-entries inside the first 30 s of uptime,
/// each under 10 s apart, forces the portal instead.
pub struct BootLoopGuard {
    started: Instant,
    entries: Vec<Instant>,
}

impl BootLoopGuard {
    pub fn new() -> Self {
        BootLoopGuard {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Record an init entry; returns true when the heuristic trips.
    pub fn register_entry(&mut self) -> bool {
        self.entries.push(Instant::now());
        let rapid_reentries = self
            .entries
            .windows(2)
            .filter(|pair| {
                pair[1].duration_since(self.started) <= BOOT_LOOP_WINDOW
                    && pair[1].duration_since(pair[0]) < BOOT_LOOP_SPACING
            })
            .count();
        rapid_reentries > BOOT_LOOP_MAX_REENTRIES
    }
}

impl Default for BootLoopGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve what to start from the persisted mode.
pub fn plan_boot(settings: &DeviceSettings, guard: &mut BootLoopGuard) -> BootPlan {
    if guard.register_entry() {
        warn!("boot-loop heuristic tripped, forcing captive portal");
        return BootPlan::CaptivePortal {
            reason: PortalReason::BootLoop,
        };
    }

    let creds = settings.has_wifi_credentials();
    match settings.conn_mode {
        ConnectionMode::Unset => BootPlan::CaptivePortal {
            reason: PortalReason::FirstBoot,
        },
        ConnectionMode::Wifi => {
            if creds {
                BootPlan::Network {
                    primary: PrimaryProtocol::WebsocketHttp,
                    wifi_primary: true,
                    wifi_backup: false,
                    ethernet: false,
                    radio: false,
                    ip_services: true,
                }
            } else {
                BootPlan::CaptivePortal {
                    reason: PortalReason::MissingCredentials,
                }
            }
        }
        ConnectionMode::Ethernet => BootPlan::Network {
            primary: PrimaryProtocol::WebsocketHttp,
            wifi_primary: false,
            wifi_backup: creds,
            ethernet: true,
            radio: false,
            ip_services: true,
        },
        ConnectionMode::EspNow => BootPlan::Network {
            primary: PrimaryProtocol::EspNow,
            wifi_primary: false,
            wifi_backup: false,
            ethernet: false,
            radio: true,
            ip_services: false,
        },
        ConnectionMode::Gateway => BootPlan::Network {
            primary: PrimaryProtocol::Gateway,
            wifi_primary: false,
            wifi_backup: creds,
            ethernet: true,
            radio: true,
            ip_services: true,
        },
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// A physical IP link (WiFi station or wired).  Bring-up is asynchronous in
/// hardware; the monitor polls `is_up`.
pub trait LinkDriver: Send + Sync {
    fn kind(&self) -> NetworkKind;
    fn bring_up(&self);
    fn bring_down(&self);
    fn is_up(&self) -> bool;
    fn ip(&self) -> Option<Ipv4Addr>;
    fn mac(&self) -> Option<MacAddr>;
    fn rssi(&self) -> Option<i32> {
        None
    }
}

/// The mDNS responder seam.
pub trait Advertiser: Send + Sync {
    fn publish(&self, service: &str, port: u16);
    fn withdraw(&self);
}

/// What the active link looks like right now; consumed by the uplink session
/// for its liveness reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub connection_type: String,
    pub ip: Option<Ipv4Addr>,
    pub rssi: Option<i32>,
}

impl LinkReport {
    pub fn ip_string(&self) -> String {
        self.ip.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct NetworkSupervisor {
    wifi: Option<Arc<dyn LinkDriver>>,
    ethernet: Option<Arc<dyn LinkDriver>>,
    wifi_is_backup: bool,
    advertiser: Option<Arc<dyn Advertiser>>,
    status: Arc<StatusAggregator>,
    events_tx: broadcast::Sender<NetworkEvent>,
    network_up_tx: watch::Sender<bool>,
    link_report_tx: watch::Sender<LinkReport>,
}

impl NetworkSupervisor {
    pub fn new(status: Arc<StatusAggregator>) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        let (network_up_tx, _) = watch::channel(false);
        let (link_report_tx, _) = watch::channel(LinkReport::default());
        NetworkSupervisor {
            wifi: None,
            ethernet: None,
            wifi_is_backup: false,
            advertiser: None,
            status,
            events_tx,
            network_up_tx,
            link_report_tx,
        }
    }

    pub fn with_wifi(mut self, driver: Arc<dyn LinkDriver>, backup: bool) -> Self {
        self.wifi = Some(driver);
        self.wifi_is_backup = backup;
        self
    }

    pub fn with_ethernet(mut self, driver: Arc<dyn LinkDriver>) -> Self {
        self.ethernet = Some(driver);
        self
    }

    pub fn with_advertiser(mut self, advertiser: Arc<dyn Advertiser>) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events_tx.subscribe()
    }

    /// True while any IP network is connected.
    pub fn network_up(&self) -> watch::Receiver<bool> {
        self.network_up_tx.subscribe()
    }

    pub fn link_report(&self) -> watch::Receiver<LinkReport> {
        self.link_report_tx.subscribe()
    }

    /// Bring up the primary links and run the 2-second change monitor until
    /// shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Some(ethernet) = &self.ethernet {
            ethernet.bring_up();
        }
        if let Some(wifi) = &self.wifi {
            if !self.wifi_is_backup {
                wifi.bring_up();
            }
        }

        let mut prev_wifi = false;
        let mut prev_ethernet = false;
        let mut prev_any = false;

        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once(&mut prev_wifi, &mut prev_ethernet, &mut prev_any);
                }
            }
        }
    }

    fn poll_once(&self, prev_wifi: &mut bool, prev_ethernet: &mut bool, prev_any: &mut bool) {
        let ethernet_up = self.ethernet.as_ref().is_some_and(|e| e.is_up());

        // Backup rule: WiFi runs only while ethernet is down, and drops as
        // soon as ethernet returns.
        if let Some(wifi) = &self.wifi {
            if self.wifi_is_backup {
                if ethernet_up && wifi.is_up() {
                    info!("ethernet restored, releasing backup wifi");
                    wifi.bring_down();
                } else if !ethernet_up && !wifi.is_up() {
                    info!("ethernet down, engaging backup wifi");
                    wifi.bring_up();
                }
            }
        }

        let wifi_up = self.wifi.as_ref().is_some_and(|w| w.is_up());

        if wifi_up != *prev_wifi {
            *prev_wifi = wifi_up;
            debug!(connected = wifi_up, "wifi changed");
            let _ = self.events_tx.send(NetworkEvent {
                kind: NetworkKind::Wifi,
                connected: wifi_up,
            });
        }
        if ethernet_up != *prev_ethernet {
            *prev_ethernet = ethernet_up;
            debug!(connected = ethernet_up, "ethernet changed");
            let _ = self.events_tx.send(NetworkEvent {
                kind: NetworkKind::Ethernet,
                connected: ethernet_up,
            });
        }

        // Ethernet wins when both are up.
        let (active_kind, active_link): (&str, Option<&Arc<dyn LinkDriver>>) = if ethernet_up {
            ("ethernet", self.ethernet.as_ref())
        } else if wifi_up {
            ("wifi", self.wifi.as_ref())
        } else {
            ("none", None)
        };
        let active_ip = active_link.and_then(|l| l.ip());
        let rssi = if active_kind == "wifi" {
            self.wifi.as_ref().and_then(|w| w.rssi())
        } else {
            None
        };

        self.link_report_tx.send_if_modified(|report| {
            let fresh = LinkReport {
                connection_type: active_kind.to_owned(),
                ip: active_ip,
                rssi,
            };
            if *report == fresh {
                false
            } else {
                *report = fresh;
                true
            }
        });

        let ethernet_ip = self
            .ethernet
            .as_ref()
            .filter(|_| ethernet_up)
            .and_then(|e| e.ip())
            .map(|ip| ip.to_string());
        let ethernet_mac = self
            .ethernet
            .as_ref()
            .and_then(|e| e.mac())
            .map(|m| m.to_string());
        self.status.update(|s| {
            s.wifi_connected = wifi_up;
            s.ethernet_connected = ethernet_up;
            s.network_type = active_kind.to_owned();
            s.ip_address = active_ip.map(|ip| ip.to_string()).unwrap_or_default();
            s.ethernet_ip = ethernet_ip.clone();
            s.ethernet_mac = ethernet_mac.clone();
        });

        let any_up = ethernet_up || wifi_up;
        if any_up != *prev_any {
            *prev_any = any_up;
            let _ = self.network_up_tx.send(any_up);
            if let Some(advertiser) = &self.advertiser {
                if any_up {
                    info!(service = MDNS_SERVICE, "publishing mDNS advertisement");
                    advertiser.publish(MDNS_SERVICE, MDNS_PORT);
                } else {
                    info!("all networks down, withdrawing mDNS advertisement");
                    advertiser.withdraw();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn settings(mode: ConnectionMode, ssid: &str) -> DeviceSettings {
        DeviceSettings {
            conn_mode: mode,
            wifi_ssid: ssid.to_owned(),
            wifi_password: String::new(),
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

    struct FakeLink {
        kind: NetworkKind,
        up: AtomicBool,
        addr: Ipv4Addr,
    }

    impl FakeLink {
        fn new(kind: NetworkKind, addr: Ipv4Addr) -> Arc<Self> {
            Arc::new(FakeLink {
                kind,
                up: AtomicBool::new(false),
                addr,
            })
        }

        fn force_down(&self) {
            self.up.store(false, Ordering::SeqCst);
        }
    }

    impl LinkDriver for FakeLink {
        fn kind(&self) -> NetworkKind {
            self.kind
        }
        fn bring_up(&self) {
            self.up.store(true, Ordering::SeqCst);
        }
        fn bring_down(&self) {
            self.up.store(false, Ordering::SeqCst);
        }
        fn is_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        fn ip(&self) -> Option<Ipv4Addr> {
            self.is_up().then_some(self.addr)
        }
        fn mac(&self) -> Option<MacAddr> {
            Some(MacAddr([2, 0, 0, 0, 0, self.addr.octets()[3]]))
        }
    }

    #[derive(Default)]
    struct CountingAdvertiser {
        published: AtomicUsize,
        withdrawn: AtomicUsize,
    }

    impl Advertiser for CountingAdvertiser {
        fn publish(&self, _service: &str, _port: u16) {
            self.published.fetch_add(1, Ordering::SeqCst);
        }
        fn withdraw(&self) {
            self.withdrawn.fetch_add(1, Ordering::SeqCst);
        }
    }

    // -- boot plan ----------------------------------------------------------

    #[test]
    fn unset_mode_goes_to_portal() {
        let mut guard = BootLoopGuard::new();
        let plan = plan_boot(&settings(ConnectionMode::Unset, ""), &mut guard);
        assert_eq!(
            plan,
            BootPlan::CaptivePortal {
                reason: PortalReason::FirstBoot
            }
        );
    }

    #[test]
    fn wifi_mode_without_credentials_goes_to_portal() {
        let mut guard = BootLoopGuard::new();
        let plan = plan_boot(&settings(ConnectionMode::Wifi, ""), &mut guard);
        assert_eq!(
            plan,
            BootPlan::CaptivePortal {
                reason: PortalReason::MissingCredentials
            }
        );
    }

    #[test]
    fn ethernet_mode_with_credentials_gets_wifi_backup() {
        let mut guard = BootLoopGuard::new();
        match plan_boot(&settings(ConnectionMode::Ethernet, "mynet"), &mut guard) {
            BootPlan::Network {
                primary,
                wifi_backup,
                ethernet,
                radio,
                ..
            } => {
                assert_eq!(primary, PrimaryProtocol::WebsocketHttp);
                assert!(wifi_backup);
                assert!(ethernet);
                assert!(!radio);
            }
            other => panic!("expected network plan, got {:?}", other),
        }
    }

    #[test]
    fn espnow_mode_skips_ip_services() {
        let mut guard = BootLoopGuard::new();
        match plan_boot(&settings(ConnectionMode::EspNow, ""), &mut guard) {
            BootPlan::Network {
                primary,
                radio,
                ip_services,
                ethernet,
                ..
            } => {
                assert_eq!(primary, PrimaryProtocol::EspNow);
                assert!(radio);
                assert!(!ip_services);
                assert!(!ethernet);
            }
            other => panic!("expected network plan, got {:?}", other),
        }
    }

    #[test]
    fn gateway_mode_bridges_ethernet_and_radio() {
        let mut guard = BootLoopGuard::new();
        match plan_boot(&settings(ConnectionMode::Gateway, "mynet"), &mut guard) {
            BootPlan::Network {
                primary,
                ethernet,
                radio,
                wifi_backup,
                ..
            } => {
                assert_eq!(primary, PrimaryProtocol::Gateway);
                assert!(ethernet);
                assert!(radio);
                assert!(wifi_backup);
            }
            other => panic!("expected network plan, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_reentries_trip_the_boot_loop_guard() {
        let mut guard = BootLoopGuard::new();
        let settings = settings(ConnectionMode::Wifi, "mynet");

        // First entry and two rapid re-entries: still allowed.
        for _ in 0..3 {
            assert!(matches!(
                plan_boot(&settings, &mut guard),
                BootPlan::Network { .. }
            ));
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        // Third rapid re-entry trips it.
        assert_eq!(
            plan_boot(&settings, &mut guard),
            BootPlan::CaptivePortal {
                reason: PortalReason::BootLoop
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reentries_do_not_trip_the_guard() {
        let mut guard = BootLoopGuard::new();
        let settings = settings(ConnectionMode::Wifi, "mynet");
        for _ in 0..4 {
            assert!(matches!(
                plan_boot(&settings, &mut guard),
                BootPlan::Network { .. }
            ));
            tokio::time::advance(Duration::from_secs(11)).await;
        }
    }

    // -- monitor ------------------------------------------------------------

    async fn tick() {
        tokio::time::advance(MONITOR_INTERVAL + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn backup_wifi_runs_only_while_ethernet_is_down() {
        let status = Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:FF".into()));
        let ethernet = FakeLink::new(NetworkKind::Ethernet, Ipv4Addr::new(192, 168, 1, 50));
        let wifi = FakeLink::new(NetworkKind::Wifi, Ipv4Addr::new(192, 168, 1, 51));

        let supervisor = NetworkSupervisor::new(status.clone())
            .with_ethernet(ethernet.clone())
            .with_wifi(wifi.clone(), true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        // Ethernet comes up at bring_up; wifi must stay down.
        tick().await;
        assert!(ethernet.is_up());
        assert!(!wifi.is_up());

        // Ethernet loss engages the backup within one monitor interval.
        ethernet.force_down();
        tick().await;
        tick().await;
        assert!(wifi.is_up());

        // Ethernet return releases the backup.
        ethernet.bring_up();
        tick().await;
        tick().await;
        assert!(!wifi.is_up());

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_active_network_and_advertises_on_edges() {
        let status = Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:FF".into()));
        let ethernet = FakeLink::new(NetworkKind::Ethernet, Ipv4Addr::new(10, 0, 0, 9));
        let advertiser = Arc::new(CountingAdvertiser::default());

        let supervisor = NetworkSupervisor::new(status.clone())
            .with_ethernet(ethernet.clone())
            .with_advertiser(advertiser.clone());
        let mut network_up = supervisor.network_up();
        let mut report = supervisor.link_report();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        tick().await;
        assert!(*network_up.borrow_and_update());
        assert_eq!(report.borrow_and_update().connection_type, "ethernet");
        assert_eq!(advertiser.published.load(Ordering::SeqCst), 1);
        let snapshot = status.snapshot();
        assert!(snapshot.ethernet_connected);
        assert_eq!(snapshot.ip_address, "10.0.0.9");
        assert_eq!(snapshot.ethernet_ip.as_deref(), Some("10.0.0.9"));

        ethernet.force_down();
        tick().await;
        assert!(!*network_up.borrow_and_update());
        assert_eq!(report.borrow_and_update().connection_type, "none");
        assert_eq!(advertiser.withdrawn.load(Ordering::SeqCst), 1);

        ethernet.bring_up();
        tick().await;
        assert_eq!(advertiser.published.load(Ordering::SeqCst), 2);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }
}
