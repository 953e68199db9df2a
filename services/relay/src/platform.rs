//! Host-platform seam implementations.
//!
//! On device hardware the link drivers, radio, mDNS responder, and renderer
//! are peripheral integrations.  This module provides the host-side stand-ins
//! the binary wires in: the host IP stack as a link, a LAN-broadcast radio
//! analogue, a logging advertiser, and a logging renderer.

use crate::espnow::{RadioDriver, RadioError, RadioFrame};
use crate::supervisor::{Advertiser, LinkDriver, NetworkKind};
use crate::workers::{Renderer, RendererError, ScreenDescriptor};
use jr_protocol::{Envelope, MacAddr};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// The host's outbound IPv4 address, via the connected-UDP-socket trick
/// (no packet is sent).
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.168.255.254:9").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

/// A stable locally-administered MAC derived from the hostname.
pub fn host_mac() -> MacAddr {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "junctionrelay".to_owned());
    let digest = Sha256::digest(hostname.as_bytes());
    MacAddr([0x02, digest[0], digest[1], digest[2], digest[3], digest[4]])
}

// ---------------------------------------------------------------------------
// Link driver
// ---------------------------------------------------------------------------

/// The host IP stack presented as one link.  `bring_up`/`bring_down` gate an
/// enabled flag; `is_up` additionally requires a routable local address.
pub struct HostLink {
    kind: NetworkKind,
    enabled: AtomicBool,
}

impl HostLink {
    pub fn new(kind: NetworkKind) -> Arc<Self> {
        Arc::new(HostLink {
            kind,
            enabled: AtomicBool::new(false),
        })
    }
}

impl LinkDriver for HostLink {
    fn kind(&self) -> NetworkKind {
        self.kind
    }

    fn bring_up(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn bring_down(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn is_up(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && local_ipv4().is_some()
    }

    fn ip(&self) -> Option<Ipv4Addr> {
        if self.enabled.load(Ordering::SeqCst) {
            local_ipv4()
        } else {
            None
        }
    }

    fn mac(&self) -> Option<MacAddr> {
        Some(host_mac())
    }
}

// ---------------------------------------------------------------------------
// Advertiser
// ---------------------------------------------------------------------------

/// Stands in for the mDNS responder peripheral; records intent in the log.
#[derive(Default)]
pub struct LogAdvertiser;

impl Advertiser for LogAdvertiser {
    fn publish(&self, service: &str, port: u16) {
        info!(service, port, "advertising service");
    }

    fn withdraw(&self) {
        info!("withdrawing service advertisement");
    }
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

/// UDP port for the LAN-broadcast radio analogue.
pub const RADIO_UDP_PORT: u16 = 5568;

const RADIO_MAGIC: &[u8; 4] = b"JRNW";

/// Datagram shape: magic, source MAC, destination MAC, payload.
const RADIO_HEADER_LEN: usize = 4 + 6 + 6;

/// A connectionless LAN-broadcast stand-in for the short-range radio.
/// Unicast is emulated by destination filtering on the receive side.
pub struct UdpRadio {
    socket: Arc<tokio::net::UdpSocket>,
    local_mac: MacAddr,
    port: u16,
}

impl UdpRadio {
    /// Bind the radio socket and start its receive task.  Returns the
    /// driver and the RX bus for `espnow::run_rx`.
    pub async fn spawn(
        local_mac: MacAddr,
        port: u16,
    ) -> Result<(Arc<UdpRadio>, mpsc::Receiver<RadioFrame>), std::io::Error> {
        let socket = Arc::new(tokio::net::UdpSocket::bind(("0.0.0.0", port)).await?);
        socket.set_broadcast(true)?;

        let (tx, rx) = mpsc::channel(64);
        let rx_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((n, _peer)) = rx_socket.recv_from(&mut buf).await else {
                    break;
                };
                let Some(frame) = decode_datagram(&buf[..n], local_mac) else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("radio receive task stopped");
        });

        Ok((
            Arc::new(UdpRadio {
                socket,
                local_mac,
                port,
            }),
            rx,
        ))
    }
}

fn decode_datagram(datagram: &[u8], local_mac: MacAddr) -> Option<RadioFrame> {
    if datagram.len() < RADIO_HEADER_LEN || &datagram[..4] != RADIO_MAGIC {
        return None;
    }
    let mut source = [0u8; 6];
    source.copy_from_slice(&datagram[4..10]);
    let source = MacAddr(source);
    let mut dest = [0u8; 6];
    dest.copy_from_slice(&datagram[10..16]);
    let dest = MacAddr(dest);

    // Our own broadcasts come back; addressed traffic for others does not
    // concern us.
    if source == local_mac {
        return None;
    }
    if !dest.is_broadcast() && dest != local_mac {
        return None;
    }
    Some(RadioFrame {
        source,
        rssi: -50,
        payload: datagram[RADIO_HEADER_LEN..].to_vec(),
    })
}

impl RadioDriver for UdpRadio {
    fn send(&self, dest: MacAddr, payload: &[u8]) -> Result<(), RadioError> {
        let mut datagram = Vec::with_capacity(RADIO_HEADER_LEN + payload.len());
        datagram.extend_from_slice(RADIO_MAGIC);
        datagram.extend_from_slice(&self.local_mac.octets());
        datagram.extend_from_slice(&dest.octets());
        datagram.extend_from_slice(payload);

        let target = (Ipv4Addr::BROADCAST, self.port);
        match self.socket.try_send_to(&datagram, target.into()) {
            Ok(_) => Ok(()),
            Err(e) => Err(RadioError(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Default renderer until a display stack is attached: logs what it routes.
#[derive(Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn register_screen(&self, descriptor: &ScreenDescriptor) {
        info!(
            screen = %descriptor.screen_id,
            i2c = descriptor.i2c_address,
            "screen registered"
        );
    }

    fn route_config(&self, doc: &Envelope) -> Result<(), RendererError> {
        info!(screen = doc.screen_id().unwrap_or("-"), "config routed");
        Ok(())
    }

    fn route_sensor(&self, doc: &Envelope) -> Result<(), RendererError> {
        if doc.as_map().is_empty() {
            warn!("empty sensor document");
        }
        debug!(screen = doc.screen_id().unwrap_or("-"), "sensor routed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mac_is_stable_and_locally_administered() {
        let a = host_mac();
        let b = host_mac();
        assert_eq!(a, b);
        assert_eq!(a.octets()[0], 0x02);
    }

    #[test]
    fn datagram_round_trip_filters_self_and_others() {
        let me = MacAddr([0x02, 1, 2, 3, 4, 5]);
        let sender = MacAddr([0x02, 9, 9, 9, 9, 9]);
        let other = MacAddr([0x02, 7, 7, 7, 7, 7]);

        let mut datagram = Vec::new();
        datagram.extend_from_slice(RADIO_MAGIC);
        datagram.extend_from_slice(&sender.octets());
        datagram.extend_from_slice(&me.octets());
        datagram.extend_from_slice(b"payload");

        let frame = decode_datagram(&datagram, me).unwrap();
        assert_eq!(frame.source, sender);
        assert_eq!(frame.payload, b"payload");

        // Addressed to someone else: ignored.
        assert!(decode_datagram(&datagram, other).is_none());

        // Our own transmission echoed back: ignored.
        assert!(decode_datagram(&datagram, sender).is_none());

        // Truncated or wrong-magic datagrams are ignored.
        assert!(decode_datagram(&datagram[..10], me).is_none());
        let mut bad = datagram.clone();
        bad[0] = b'X';
        assert!(decode_datagram(&bad, me).is_none());
    }
}
