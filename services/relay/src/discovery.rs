//! Backend discovery.
//!
//! When no backend IP is configured, probe a fixed candidate set on the
//! active interface's /24: hosts `.2, .1, .100, .10, .22`, in that order.
//! A candidate is adopted when `GET /api/health/heartbeat` answers HTTP 200
//! or a body containing `"status":"OK"`.  Each probe is bounded by a
//! 2-second timeout, so a full miss costs about ten seconds.

use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Probe order within the local /24.
pub const PROBE_LAST_OCTETS: [u8; 5] = [2, 1, 100, 10, 22];

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub const HEARTBEAT_PATH: &str = "/api/health/heartbeat";

/// Expand the candidate list for `local_ip`'s subnet.
pub fn candidate_addrs(local_ip: Ipv4Addr, port: u16) -> Vec<(Ipv4Addr, u16)> {
    let [a, b, c, _] = local_ip.octets();
    PROBE_LAST_OCTETS
        .iter()
        .map(|&last| (Ipv4Addr::new(a, b, c, last), port))
        .collect()
}

/// Probe one candidate's heartbeat endpoint.
pub async fn probe(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{}{}", base_url, HEARTBEAT_PATH);
    match client.get(&url).send().await {
        Ok(response) => {
            if response.status().is_success() {
                return true;
            }
            match response.text().await {
                Ok(body) => body.contains(r#""status":"OK""#),
                Err(_) => false,
            }
        }
        Err(e) => {
            debug!(url, error = %e, "probe failed");
            false
        }
    }
}

/// Probe the candidate set and return the first backend that answers.
pub async fn discover_backend(local_ip: Ipv4Addr, port: u16) -> Option<Ipv4Addr> {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "cannot build probe client");
            return None;
        }
    };

    for (ip, port) in candidate_addrs(local_ip, port) {
        let base = format!("http://{}:{}", ip, port);
        debug!(candidate = %base, "probing backend candidate");
        if probe(&client, &base).await {
            info!(backend = %ip, "backend discovered");
            return Some(ip);
        }
    }
    warn!("no backend candidate answered");
    None
}
