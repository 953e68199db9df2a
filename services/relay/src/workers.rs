//! Dispatch workers.
//!
//! One worker per queue, each the queue's sole consumer.  Renderer calls are
//! run inside an isolation region: a failure or panic is translated into a
//! per-document outcome, so one bad document never takes the worker down.
//! The config worker additionally maintains the "config received" state that
//! gates advertising the node as ready for sensor updates.

use crate::queues::QueueConsumer;
use jr_protocol::Envelope;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Renderer seam
// ---------------------------------------------------------------------------

/// A logical display address.  I2C-addressed screens use the `0x<HH>` form;
/// anything else is a symbolic key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenDescriptor {
    pub screen_id: String,
    pub i2c_address: Option<u8>,
}

impl ScreenDescriptor {
    pub fn parse(screen_id: &str) -> Self {
        let i2c_address = screen_id
            .strip_prefix("0x")
            .or_else(|| screen_id.strip_prefix("0X"))
            .filter(|hex| hex.len() == 2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        ScreenDescriptor {
            screen_id: screen_id.to_owned(),
            i2c_address,
        }
    }
}

#[derive(Debug, Error)]
#[error("renderer: {0}")]
pub struct RendererError(pub String);

/// The display subsystem, specified only by this contract.
///
/// `route_sensor` must be quick (tens of milliseconds) — the worker calls it
/// inline and performs no network I/O of its own.
pub trait Renderer: Send + Sync {
    /// Idempotent addition of a display to the routing table.
    fn register_screen(&self, descriptor: &ScreenDescriptor);
    fn route_config(&self, doc: &Envelope) -> Result<(), RendererError>;
    fn route_sensor(&self, doc: &Envelope) -> Result<(), RendererError>;
}

// ---------------------------------------------------------------------------
// Config state
// ---------------------------------------------------------------------------

/// Shared flags the config worker maintains and stats/status read.
#[derive(Debug, Default)]
pub struct ConfigState {
    received: AtomicBool,
    count: AtomicU64,
    last_unix_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStateSnapshot {
    pub has_received_config: bool,
    pub config_count: u64,
    /// Unix millis of the last applied config; 0 when none yet.
    pub last_config_unix_ms: u64,
}

impl ConfigState {
    pub fn mark_received(&self) {
        self.received.store(true, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        self.last_unix_ms.store(now, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.received.store(false, Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
        self.last_unix_ms.store(0, Ordering::SeqCst);
    }

    pub fn has_received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConfigStateSnapshot {
        ConfigStateSnapshot {
            has_received_config: self.received.load(Ordering::SeqCst),
            config_count: self.count.load(Ordering::SeqCst),
            last_config_unix_ms: self.last_unix_ms.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Isolation region
// ---------------------------------------------------------------------------

/// Run a renderer call, translating `Err` and panics alike into a message.
fn guarded<F: FnOnce() -> Result<(), RendererError>>(f: F) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "renderer panicked".to_owned());
            Err(format!("panic: {}", msg))
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Sole consumer of the sensor queue.  Runs until the queue closes.
pub async fn run_sensor_worker(mut consumer: QueueConsumer, renderer: Arc<dyn Renderer>) {
    while let Some(doc) = consumer.pop().await {
        if let Err(e) = guarded(|| renderer.route_sensor(&doc)) {
            warn!(error = %e, "sensor route failed, continuing");
        }
    }
    debug!("sensor worker stopped");
}

/// Sole consumer of the config queue.  On success, flips the
/// config-received state; on failure, routes the empty fallback document.
pub async fn run_config_worker(
    mut consumer: QueueConsumer,
    renderer: Arc<dyn Renderer>,
    state: Arc<ConfigState>,
) {
    while let Some(doc) = consumer.pop().await {
        let outcome = guarded(|| {
            if let Some(screen_id) = doc.screen_id() {
                renderer.register_screen(&ScreenDescriptor::parse(screen_id));
            }
            renderer.route_config(&doc)
        });
        match outcome {
            Ok(()) => {
                state.mark_received();
                info!(count = state.snapshot().config_count, "config applied");
            }
            Err(e) => {
                warn!(error = %e, "config route failed, applying fallback");
                if let Err(e) = guarded(|| renderer.route_config(&Envelope::empty())) {
                    warn!(error = %e, "fallback config also failed");
                }
            }
        }
    }
    debug!("config worker stopped");
}
