//! Wired framed-byte ingress.
//!
//! A TCP listener for the framed transport: orchestrators and cabled
//! controllers push length-prefixed (or bare-JSON) frames here.  Each
//! accepted connection gets its own frame parser and a write-back half so
//! response documents return on the same socket, length-prefixed.

use crate::dispatch::{Dispatcher, ReplyTo};
use crate::framing::{FrameParser, encode_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct IngressServer {
    listener: TcpListener,
}

impl IngressServer {
    pub async fn bind(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "ingress listening");
        Ok(IngressServer { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Accept loop; one task per connection, until shutdown.
    pub async fn run(self, dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "ingress connection");
                            let dispatcher = dispatcher.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(serve_connection(stream, dispatcher, shutdown));
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Response documents queue here; the writer task frames them back out.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(8);
    let writer_task = tokio::spawn(async move {
        while let Some(doc) = reply_rx.recv().await {
            if writer.write_all(&encode_frame(&doc)).await.is_err() {
                break;
            }
        }
    });

    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for payload in parser.push_chunk(&buf[..n]) {
                            dispatcher
                                .ingest_bytes(&payload, ReplyTo::Stream(reply_tx.clone()))
                                .await;
                        }
                    }
                }
            }
        }
    }

    drop(reply_tx);
    let _ = writer_task.await;
}
