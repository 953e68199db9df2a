// mock_backend: A scripted backend WebSocket server for uplink testing.
//
// Greets each connection with `welcome`, acks registrations, heartbeats and
// health reports, records every inbound frame, and lets tests inject
// arbitrary frames toward connected clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock backend for integration testing.
///
/// Binds to port 0 (random) and exposes the bound address; each test spins
/// up its own isolated instance.
///
/// # Protocol behavior
///
/// - On connect, immediately sends `{"type":"welcome"}`.
/// - `device-registration` → recorded, answered with
///   `device-registration-ack`.
/// - `heartbeat` / `health` / `espnow-status` → recorded, answered with the
///   matching `-ack` frame.
/// - Any other text (including non-JSON, e.g. `pong`) is recorded verbatim.
/// - Frames passed to [`MockBackend::inject`] are sent to every connected
///   client.
/// Control messages fanned out to every live connection handler.
#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Close,
}

pub struct MockBackend {
    addr: SocketAddr,
    recorded: Arc<Mutex<Vec<Value>>>,
    frames_rx: Option<mpsc::UnboundedReceiver<Value>>,
    inject_tx: broadcast::Sender<Outbound>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    /// Start the mock backend on a random port.
    pub async fn start() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let recorded = Arc::new(Mutex::new(Vec::new()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inject_tx, _) = broadcast::channel(32);

        let task = {
            let recorded = recorded.clone();
            let inject_tx = inject_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _peer)) = listener.accept().await else {
                        break;
                    };
                    let recorded = recorded.clone();
                    let frames_tx = frames_tx.clone();
                    let inject_rx = inject_tx.subscribe();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, recorded, frames_tx, inject_rx)
                            .await;
                    });
                }
            })
        };

        Ok(MockBackend {
            addr,
            recorded,
            frames_rx: Some(frames_rx),
            inject_tx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of this backend.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Everything recorded so far, in arrival order.  Unparseable text is
    /// recorded as a JSON string.
    pub fn recorded(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().clone()
    }

    /// Take the live frame stream.  Each recorded frame is also delivered
    /// here, so tests can await instead of polling.  Callable once.
    pub fn take_frames(&mut self) -> mpsc::UnboundedReceiver<Value> {
        self.frames_rx.take().expect("frames stream already taken")
    }

    /// Send a raw text frame to every connected client.
    pub fn inject(&self, frame: &str) {
        let _ = self.inject_tx.send(Outbound::Text(frame.to_owned()));
    }

    /// Close every live connection with a WebSocket close frame.
    pub fn close_connections(&self) {
        let _ = self.inject_tx.send(Outbound::Close);
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        recorded: Arc<Mutex<Vec<Value>>>,
        frames_tx: mpsc::UnboundedSender<Value>,
        mut inject_rx: broadcast::Receiver<Outbound>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut ws = tokio_tungstenite::accept_async(stream).await?;

        // The backend initiates the session.
        ws.send(Message::Text(r#"{"type":"welcome"}"#.into()))
            .await?;

        loop {
            tokio::select! {
                injected = inject_rx.recv() => {
                    match injected {
                        Ok(Outbound::Text(frame)) => ws.send(Message::Text(frame.into())).await?,
                        Ok(Outbound::Close) => {
                            let _ = ws.send(Message::Close(None)).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                msg = ws.next() => {
                    let msg = match msg {
                        None => break,
                        Some(msg) => msg?,
                    };
                    let text = match msg {
                        Message::Text(t) => t,
                        Message::Close(_) => break,
                        Message::Ping(data) => {
                            ws.send(Message::Pong(data)).await?;
                            continue;
                        }
                        _ => continue,
                    };

                    let value: Value = serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text.to_string()));
                    recorded.lock().unwrap().push(value.clone());
                    let _ = frames_tx.send(value.clone());

                    let ack = match value.get("type").and_then(Value::as_str) {
                        Some("device-registration") => Some(r#"{"type":"device-registration-ack","status":"ok"}"#),
                        Some("heartbeat") => Some(r#"{"type":"heartbeat-ack"}"#),
                        Some("health") => Some(r#"{"type":"health-ack"}"#),
                        Some("espnow-status") => Some(r#"{"type":"espnow-status-ack"}"#),
                        _ => None,
                    };
                    if let Some(ack) = ack {
                        ws.send(Message::Text(ack.into())).await?;
                    }
                }
            }
        }

        Ok(())
    }
}
