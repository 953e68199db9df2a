//! Reconnect policy bounds, on the paused clock against a dead backend:
//! attempts are paced 5 s apart, and ten consecutive failures buy a 30 s
//! quiescent gap before the counter resets.

use relay::dispatch::Dispatcher;
use relay::identity::{DeviceFacts, DeviceIdentity};
use relay::prefs::{ConnectionMode, Prefs};
use relay::queues::{CONFIG_QUEUE_CAPACITY, SENSOR_QUEUE_CAPACITY, dispatch_queue};
use relay::restart::restart_channel;
use relay::status::StatusAggregator;
use relay::supervisor::LinkReport;
use relay::uplink::{SessionStats, UplinkConfig, UplinkContext, run_uplink};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

async fn dead_backend_port() -> u16 {
    // Bind then drop: connections to this port are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn context() -> (UplinkContext, Arc<SessionStats>, watch::Sender<LinkReport>) {
    let (sensor_queue, _sensor_rx) = dispatch_queue("sensor", SENSOR_QUEUE_CAPACITY);
    let (config_queue, _config_rx) = dispatch_queue("config", CONFIG_QUEUE_CAPACITY);
    let (restart, _restart_rx) = restart_channel();
    let dispatcher = Arc::new(Dispatcher::new(
        sensor_queue,
        config_queue,
        Arc::new(relay::workers::ConfigState::default()),
        Arc::new(tokio::sync::Mutex::new(Prefs::open_in_memory().unwrap())),
        restart,
    ));
    let stats = Arc::new(SessionStats::default());
    let (link_tx, link) = watch::channel(LinkReport {
        connection_type: "ethernet".to_owned(),
        ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
        rssi: None,
    });
    let ctx = UplinkContext {
        identity: Arc::new(DeviceIdentity::new(
            DeviceFacts::default(),
            "AA:BB:CC:DD:EE:03".parse().unwrap(),
        )),
        dispatcher,
        espnow: None,
        status: Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:03".into())),
        stats: stats.clone(),
        mode: ConnectionMode::Ethernet,
        link,
    };
    (ctx, stats, link_tx)
}

async fn wait_for_attempts(stats: &SessionStats, n: u32) {
    while stats.reconnect_attempts() < n {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn attempts_are_paced_and_backoff_follows_ten_failures() {
    let port = dead_backend_port().await;
    let (ctx, stats, _link_tx) = context();
    let (network_tx, network_rx) = watch::channel(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cfg = UplinkConfig {
        backend_ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
        port,
    };
    let task = tokio::spawn(run_uplink(cfg, ctx, network_rx, shutdown_rx));

    let t0 = Instant::now();
    wait_for_attempts(&stats, 10).await;
    let at_ten = t0.elapsed();
    // Ten attempts, each preceded by the 5 s pacing delay: no faster than
    // ~50 s, so no 60 s window can hold more than twelve attempts.
    assert!(
        at_ten >= Duration::from_secs(45),
        "ten attempts in only {:?}",
        at_ten
    );

    wait_for_attempts(&stats, 11).await;
    let at_eleven = t0.elapsed();
    // The eleventh attempt sits behind the 30 s backoff.
    assert!(
        at_eleven - at_ten >= Duration::from_secs(30),
        "no quiescent gap: attempt 11 after {:?}",
        at_eleven - at_ten
    );

    let _ = shutdown_tx.send(true);
    let _ = network_tx.send(false);
    let _ = task.await;
}

#[tokio::test(start_paused = true)]
async fn no_attempts_while_network_is_down() {
    let port = dead_backend_port().await;
    let (ctx, stats, _link_tx) = context();
    let (network_tx, network_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cfg = UplinkConfig {
        backend_ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
        port,
    };
    let task = tokio::spawn(run_uplink(cfg, ctx, network_rx, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(stats.reconnect_attempts(), 0);

    // Network arrival wakes the loop.
    let _ = network_tx.send(true);
    wait_for_attempts(&stats, 1).await;

    let _ = shutdown_tx.send(true);
    let _ = task.await;
}
