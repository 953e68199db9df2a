// framed_client: A TCP client speaking the node's framed transport.
//
// Writes documents with the 8-digit zero-padded length prefix (or raw,
// prefix-less) and reads prefixed response frames back.  Used to drive the
// ingress listener in integration tests.

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct FramedClient {
    stream: TcpStream,
}

impl FramedClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self, std::io::Error> {
        Ok(FramedClient {
            stream: TcpStream::connect(addr).await?,
        })
    }

    /// Send a document with the length prefix.
    pub async fn send_framed(&mut self, doc: &str) -> Result<(), std::io::Error> {
        let framed = format!("{:08}{}", doc.len(), doc);
        self.stream.write_all(framed.as_bytes()).await
    }

    /// Send raw bytes exactly as given (e.g. a bare-JSON chunk, or a frame
    /// split across writes).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.stream.write_all(bytes).await
    }

    /// Read one length-prefixed response frame and parse it as JSON.
    pub async fn recv_framed(&mut self) -> Result<Value, std::io::Error> {
        let mut prefix = [0u8; 8];
        self.stream.read_exact(&mut prefix).await?;
        let text = std::str::from_utf8(&prefix)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len: usize = text
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        serde_json::from_slice(&payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
