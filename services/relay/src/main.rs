// relay: JunctionRelay node binary.
//
// Boot order: preferences, identity, boot plan, then the task set the plan
// calls for (supervisor, radio, workers, ingress, uplink, broker, admin).
// The process exits when a scheduled restart fires; the service supervisor
// respawns it, which is this platform's reboot.

use clap::Parser;
use relay::admin_http::{self, AppState};
use relay::broker::{self, BrokerConfig, BrokerRx};
use relay::dispatch::Dispatcher;
use relay::espnow::{self, EspNowManager, RadioFrame};
use relay::identity::{DeviceFacts, DeviceIdentity};
use relay::ingress::IngressServer;
use relay::platform::{HostLink, LogAdvertiser, LogRenderer, UdpRadio};
use relay::prefs::Prefs;
use relay::queues::{CONFIG_QUEUE_CAPACITY, SENSOR_QUEUE_CAPACITY, dispatch_queue};
use relay::restart::restart_channel;
use relay::status::StatusAggregator;
use relay::supervisor::{
    BootLoopGuard, BootPlan, NetworkKind, NetworkSupervisor, PrimaryProtocol, plan_boot,
};
use relay::uplink::{SessionStats, UplinkConfig, UplinkContext};
use relay::workers::{ConfigState, run_config_worker, run_sensor_worker};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "JunctionRelay node")]
struct Args {
    /// Data directory for preferences and staged firmware.
    #[arg(long, default_value = "/var/lib/junctionrelay")]
    data_dir: PathBuf,

    /// Admin HTTP bind address.
    #[arg(long, default_value = "0.0.0.0:80")]
    admin_bind: String,

    /// Framed-transport ingress bind address.
    #[arg(long, default_value = "0.0.0.0:5555")]
    ingress_bind: String,

    /// LAN radio UDP port.
    #[arg(long, default_value_t = relay::platform::RADIO_UDP_PORT)]
    radio_port: u16,

    /// Skip backend discovery and use this address.
    #[arg(long)]
    backend_ip: Option<Ipv4Addr>,

    /// Override the advertised device name.
    #[arg(long)]
    device_name: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        eprintln!("FATAL: cannot create data dir: {}", e);
        std::process::exit(1);
    }
    let prefs = match Prefs::open(&args.data_dir.join("prefs.sqlite3")) {
        Ok(prefs) => prefs,
        Err(e) => {
            eprintln!("FATAL: failed to open preference store: {}", e);
            std::process::exit(1);
        }
    };
    let settings = match prefs.load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("FATAL: failed to load preferences: {}", e);
            std::process::exit(1);
        }
    };
    info!(mode = %settings.conn_mode, backend_port = settings.backend_port, "preferences loaded");

    let mut facts = DeviceFacts::default();
    if let Some(name) = &args.device_name {
        facts.device_name = name.clone();
    }
    let mac = relay::platform::host_mac();
    let identity = Arc::new(DeviceIdentity::new(facts, mac));
    let status = Arc::new(StatusAggregator::new(mac.to_string()));
    let prefs = Arc::new(Mutex::new(prefs));

    let (restart, mut restart_rx) = restart_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut guard = BootLoopGuard::new();
    let plan = plan_boot(&settings, &mut guard);

    // Queues, workers, dispatcher: local dispatch runs under every plan.
    let (sensor_queue, sensor_consumer) = dispatch_queue("sensor", SENSOR_QUEUE_CAPACITY);
    let (config_queue, config_consumer) = dispatch_queue("config", CONFIG_QUEUE_CAPACITY);
    let sensor_stats = sensor_queue.stats();
    let config_stats = config_queue.stats();
    let config_state = Arc::new(ConfigState::default());
    let session_stats = Arc::new(SessionStats::default());

    let renderer = Arc::new(LogRenderer);
    tokio::spawn(run_sensor_worker(sensor_consumer, renderer.clone()));
    tokio::spawn(run_config_worker(
        config_consumer,
        renderer,
        config_state.clone(),
    ));

    let mut dispatcher = Dispatcher::new(
        sensor_queue,
        config_queue,
        config_state.clone(),
        prefs.clone(),
        restart.clone(),
    );

    // Plan-dependent parts.  Receiver halves are held locally until the
    // dispatcher is final, then their tasks start.
    let mut espnow: Option<Arc<EspNowManager>> = None;
    let mut radio_rx: Option<mpsc::Receiver<RadioFrame>> = None;
    let mut broker_handle = None;
    let mut broker_rx: Option<BrokerRx> = None;
    let mut primary = PrimaryProtocol::WebsocketHttp;
    let mut ip_services = true;
    let mut ingress_enabled = false;
    let mut supervisor: Option<NetworkSupervisor> = None;
    let mut network_up = None;
    let mut link_report = None;

    match plan {
        BootPlan::CaptivePortal { reason } => {
            // The portal itself is an external collaborator; keep the admin
            // surface reachable for provisioning and wait for a restart.
            warn!(reason = ?reason, "captive portal required, network startup halted");
        }
        BootPlan::Network {
            primary: plan_primary,
            wifi_primary,
            wifi_backup,
            ethernet,
            radio,
            ip_services: plan_ip_services,
        } => {
            info!(primary = ?plan_primary, "network plan resolved");
            primary = plan_primary;
            ip_services = plan_ip_services;
            ingress_enabled = plan_ip_services;

            if radio {
                match UdpRadio::spawn(mac, args.radio_port).await {
                    Ok((driver, rx)) => {
                        let manager = EspNowManager::new(driver);
                        dispatcher = dispatcher.with_espnow(manager.clone());
                        status.update(|s| s.espnow_active = true);
                        tokio::spawn(espnow::run_liveness_sweep(
                            manager.clone(),
                            shutdown_rx.clone(),
                        ));
                        espnow = Some(manager);
                        radio_rx = Some(rx);
                    }
                    Err(e) => warn!(error = %e, "radio bring-up failed, continuing without"),
                }
            }

            if ip_services && broker::parse_broker_target(&settings.mqtt_broker).is_some() {
                let (handle, rx) = broker::broker_channel();
                dispatcher = dispatcher.with_broker(handle.clone());
                broker_handle = Some(handle);
                broker_rx = Some(rx);
            }

            if ethernet || wifi_primary || wifi_backup {
                let mut sup = NetworkSupervisor::new(status.clone());
                if ethernet {
                    sup = sup.with_ethernet(HostLink::new(NetworkKind::Ethernet));
                }
                if wifi_primary || wifi_backup {
                    sup = sup.with_wifi(HostLink::new(NetworkKind::Wifi), wifi_backup);
                }
                if ip_services {
                    sup = sup.with_advertiser(Arc::new(LogAdvertiser));
                }
                network_up = Some(sup.network_up());
                link_report = Some(sup.link_report());
                supervisor = Some(sup);
            }
        }
    }

    let dispatcher = Arc::new(dispatcher);

    if let Some(sup) = supervisor {
        tokio::spawn(sup.run(shutdown_rx.clone()));
    }
    if let (Some(manager), Some(rx)) = (espnow.clone(), radio_rx) {
        tokio::spawn(espnow::run_rx(
            manager,
            rx,
            dispatcher.clone(),
            shutdown_rx.clone(),
        ));
    }
    if let (Some(rx), Some(up)) = (broker_rx, network_up.clone()) {
        if let Some((host, port)) = broker::parse_broker_target(&settings.mqtt_broker) {
            let cfg = BrokerConfig {
                host,
                port,
                username: non_empty(&settings.mqtt_username),
                password: non_empty(&settings.mqtt_password),
                client_id: format!("junctionrelay-{}", mac),
            };
            tokio::spawn(broker::run_broker(
                cfg,
                rx,
                dispatcher.clone(),
                status.clone(),
                up,
                shutdown_rx.clone(),
            ));
        }
    }

    if ingress_enabled {
        match IngressServer::bind(&args.ingress_bind).await {
            Ok(server) => {
                tokio::spawn(server.run(dispatcher.clone(), shutdown_rx.clone()));
            }
            Err(e) => warn!(error = %e, "ingress bind failed"),
        }
    }

    if ip_services {
        if let (Some(up), Some(link)) = (network_up, link_report) {
            let ctx = UplinkContext {
                identity: identity.clone(),
                dispatcher: dispatcher.clone(),
                espnow: espnow.clone(),
                status: status.clone(),
                stats: session_stats.clone(),
                mode: settings.conn_mode,
                link,
            };
            tokio::spawn(relay::uplink::run_uplink(
                UplinkConfig {
                    backend_ip: args.backend_ip,
                    port: settings.backend_port,
                },
                ctx,
                up,
                shutdown_rx.clone(),
            ));
        }

        match tokio::net::TcpListener::bind(&args.admin_bind).await {
            Ok(listener) => {
                info!(addr = %args.admin_bind, "admin API listening");
                let state = Arc::new(AppState {
                    prefs,
                    identity,
                    status,
                    dispatcher,
                    sensor_stats,
                    config_stats,
                    config_state,
                    session_stats,
                    espnow,
                    broker: broker_handle,
                    restart,
                    primary,
                    data_dir: args.data_dir.clone(),
                });
                tokio::spawn(admin_http::serve(listener, state, shutdown_rx.clone()));
            }
            Err(e) => warn!(error = %e, "admin bind failed"),
        }
    }

    // Run until a restart fires or the operator interrupts.
    tokio::select! {
        reason = restart_rx.recv() => {
            if let Some(reason) = reason {
                info!(reason = reason.as_str(), "restarting");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    let _ = shutdown_tx.send(true);
    // Give tasks a moment to observe shutdown before the process ends.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_owned()) }
}
