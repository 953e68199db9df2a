//! Bounded dispatch queues.
//!
//! Two fixed-capacity queues hand parsed envelopes from the ingress tasks to
//! the dispatch workers.  Push never blocks: a full queue drops the document
//! and counts the drop.  Pop blocks the (single) consumer until an entry
//! arrives or every producer handle has been dropped.

use jr_protocol::Envelope;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Sensor documents are steady-state traffic and tolerate loss.
pub const SENSOR_QUEUE_CAPACITY: usize = 30;

/// Config documents are rare and heavyweight.
pub const CONFIG_QUEUE_CAPACITY: usize = 3;

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    Dropped,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of a queue, serialized into `/api/system/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsSnapshot {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub depth: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        let pushed = self.pushed.load(Ordering::Relaxed);
        let popped = self.popped.load(Ordering::Relaxed);
        QueueStatsSnapshot {
            pushed,
            popped,
            dropped: self.dropped.load(Ordering::Relaxed),
            depth: pushed.saturating_sub(popped),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue halves
// ---------------------------------------------------------------------------

/// Producer half.  Cloneable — frames arrive from several transports.
#[derive(Clone)]
pub struct DispatchQueue {
    name: &'static str,
    tx: mpsc::Sender<Envelope>,
    stats: Arc<QueueStats>,
}

/// Consumer half, owned by exactly one worker task.
pub struct QueueConsumer {
    rx: mpsc::Receiver<Envelope>,
    stats: Arc<QueueStats>,
}

/// Create a queue pair with the given fixed capacity.
pub fn dispatch_queue(name: &'static str, capacity: usize) -> (DispatchQueue, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        DispatchQueue {
            name,
            tx,
            stats: stats.clone(),
        },
        QueueConsumer { rx, stats },
    )
}

impl DispatchQueue {
    /// Try to enqueue a document.  A full (or shut-down) queue drops it; the
    /// envelope is released here and the drop is counted.
    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Pushed
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(queue = self.name, "queue full, dropping document");
                PushOutcome::Dropped
            }
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl QueueConsumer {
    /// Wait for the next document.  Resolves `None` once every producer has
    /// been dropped — the worker's shutdown signal.
    pub async fn pop(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(envelope)
    }
}
