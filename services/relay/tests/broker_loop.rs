//! Broker channel behavior against a scripted MQTT broker: connect and
//! CONNACK, subscription replay, publishing on the data topic, inbound
//! fan-in, and the once-per-second reconnect.

use jr_protocol::Envelope;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::{ConnackPacket, PublishPacket, SubackPacket, VariablePacket};
use mqtt::{Decodable, Encodable, TopicName};
use relay::broker::{self, BrokerConfig, DATA_TOPIC};
use relay::dispatch::Dispatcher;
use relay::prefs::Prefs;
use relay::queues::{CONFIG_QUEUE_CAPACITY, QueueConsumer, SENSOR_QUEUE_CAPACITY, dispatch_queue};
use relay::restart::restart_channel;
use relay::status::StatusAggregator;
use relay::workers::ConfigState;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

#[derive(Debug)]
enum ServerEvent {
    Connected { client_id: String },
    Subscribed { topic: String },
    Published { topic: String, payload: Vec<u8> },
    Dropped,
}

/// A scripted broker on a std listener; `drop_after_connack` closes each
/// connection right after the handshake to exercise reconnects.
fn scripted_broker(
    drop_after_connack: bool,
) -> (u16, std_mpsc::Receiver<ServerEvent>, std_mpsc::Sender<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, events_rx) = std_mpsc::channel();
    let (outbound_tx, outbound_rx) = std_mpsc::channel::<(String, Vec<u8>)>();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let connect = match VariablePacket::decode(&mut stream) {
                Ok(VariablePacket::ConnectPacket(c)) => c,
                _ => continue,
            };
            let _ = events_tx.send(ServerEvent::Connected {
                client_id: connect.client_identifier().to_owned(),
            });
            let connack = ConnackPacket::new(false, ConnectReturnCode::ConnectionAccepted);
            connack.encode(&mut stream).unwrap();

            if drop_after_connack {
                drop(stream);
                let _ = events_tx.send(ServerEvent::Dropped);
                continue;
            }

            // Flush anything the test wants delivered, then serve packets.
            loop {
                while let Ok((topic, payload)) = outbound_rx.try_recv() {
                    let publish = PublishPacket::new(
                        TopicName::new(topic).unwrap(),
                        QoSWithPacketIdentifier::Level0,
                        payload,
                    );
                    publish.encode(&mut stream).unwrap();
                }
                match VariablePacket::decode(&mut stream) {
                    Ok(VariablePacket::SubscribePacket(subscribe)) => {
                        for (filter, _qos) in subscribe.subscribes() {
                            let _ = events_tx.send(ServerEvent::Subscribed {
                                topic: filter.to_string(),
                            });
                        }
                        let suback = SubackPacket::new(
                            subscribe.packet_identifier(),
                            vec![SubscribeReturnCode::MaximumQoSLevel0],
                        );
                        suback.encode(&mut stream).unwrap();
                    }
                    Ok(VariablePacket::PublishPacket(publish)) => {
                        let _ = events_tx.send(ServerEvent::Published {
                            topic: publish.topic_name().to_owned(),
                            payload: publish.payload().to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(_) => {
                        let _ = events_tx.send(ServerEvent::Dropped);
                        break;
                    }
                }
            }
        }
    });

    (port, events_rx, outbound_tx)
}

fn node(port: u16) -> (Arc<Dispatcher>, QueueConsumer, BrokerConfig) {
    let (sensor_queue, sensor_rx) = dispatch_queue("sensor", SENSOR_QUEUE_CAPACITY);
    let (config_queue, _config_rx) = dispatch_queue("config", CONFIG_QUEUE_CAPACITY);
    let (restart, _restart_rx) = restart_channel();
    let dispatcher = Arc::new(Dispatcher::new(
        sensor_queue,
        config_queue,
        Arc::new(ConfigState::default()),
        Arc::new(tokio::sync::Mutex::new(Prefs::open_in_memory().unwrap())),
        restart,
    ));
    let cfg = BrokerConfig {
        host: "127.0.0.1".to_owned(),
        port,
        username: None,
        password: None,
        client_id: "junctionrelay-test".to_owned(),
    };
    (dispatcher, sensor_rx, cfg)
}

async fn next_event(events: &std_mpsc::Receiver<ServerEvent>) -> ServerEvent {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        match events.try_recv() {
            Ok(event) => return event,
            Err(_) => {
                assert!(std::time::Instant::now() < deadline, "no broker event");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

#[tokio::test]
async fn broker_subscribes_publishes_and_fans_inbound_into_dispatch() {
    let (port, events, outbound) = scripted_broker(false);
    let (dispatcher, mut sensor_rx, cfg) = node(port);
    let status = Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:20".into()));

    let (handle, broker_rx) = broker::broker_channel();
    let (_network_tx, network_rx) = watch::channel(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(broker::run_broker(
        cfg,
        broker_rx,
        dispatcher.clone(),
        status.clone(),
        network_rx,
        shutdown_rx,
    ));

    match next_event(&events).await {
        ServerEvent::Connected { client_id } => assert_eq!(client_id, "junctionrelay-test"),
        other => panic!("expected connect, got {:?}", other),
    }

    handle.subscribe("sensors/kiosk").await;
    match next_event(&events).await {
        ServerEvent::Subscribed { topic } => assert_eq!(topic, "sensors/kiosk"),
        other => panic!("expected subscribe, got {:?}", other),
    }

    handle
        .publish(Envelope::from_slice(br#"{"type":"sensor","v":3}"#).unwrap())
        .await;
    match next_event(&events).await {
        ServerEvent::Published { topic, payload } => {
            assert_eq!(topic, DATA_TOPIC);
            let doc = Envelope::from_slice(&payload).unwrap();
            assert_eq!(doc.get("v"), Some(&serde_json::json!(3)));
        }
        other => panic!("expected publish, got {:?}", other),
    }

    // Inbound PUBLISH on a subscribed topic reaches the sensor queue.
    outbound
        .send((
            "sensors/kiosk".to_owned(),
            br#"{"type":"sensor","v":11}"#.to_vec(),
        ))
        .unwrap();
    // Nudge the server loop past its blocking decode.
    handle
        .publish(Envelope::from_slice(br#"{"type":"sensor","v":0}"#).unwrap())
        .await;

    let doc = timeout(Duration::from_secs(5), sensor_rx.pop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.get("v"), Some(&serde_json::json!(11)));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn broker_retries_about_once_per_second_while_network_up() {
    let (port, events, _outbound) = scripted_broker(true);
    let (dispatcher, _sensor_rx, cfg) = node(port);
    let status = Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:21".into()));

    let (_handle, broker_rx) = broker::broker_channel();
    let (_network_tx, network_rx) = watch::channel(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(broker::run_broker(
        cfg,
        broker_rx,
        dispatcher,
        status,
        network_rx,
        shutdown_rx,
    ));

    let started = std::time::Instant::now();
    let mut connects = 0;
    while connects < 3 {
        if matches!(next_event(&events).await, ServerEvent::Connected { .. }) {
            connects += 1;
        }
    }
    let elapsed = started.elapsed();
    // Three connects, two reconnect delays: roughly two seconds, never
    // instantaneous tight-looping.
    assert!(elapsed >= std::time::Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < std::time::Duration::from_secs(10), "{:?}", elapsed);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn broker_does_not_connect_while_network_down() {
    let (port, events, _outbound) = scripted_broker(false);
    let (dispatcher, _sensor_rx, cfg) = node(port);
    let status = Arc::new(StatusAggregator::new("AA:BB:CC:DD:EE:22".into()));

    let (_handle, broker_rx) = broker::broker_channel();
    let (network_tx, network_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(broker::run_broker(
        cfg,
        broker_rx,
        dispatcher,
        status,
        network_rx,
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(events.try_recv().is_err(), "connected with network down");

    let _ = network_tx.send(true);
    match next_event(&events).await {
        ServerEvent::Connected { .. } => {}
        other => panic!("expected connect after network up, got {:?}", other),
    }

    let _ = shutdown_tx.send(true);
}
