//! Delayed device restart scheduling.
//!
//! Several operations (preference updates, wipe, firmware upload) must
//! answer their caller first and reboot afterwards.  A `RestartHandle` is
//! threaded to those call sites; the binary's main future completes when a
//! restart request lands, which on this platform means a process exit and
//! supervisor respawn.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Response-then-restart delay for preference changes.
pub const PREFS_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Response-then-restart delay for a preferences wipe.
pub const WIPE_RESTART_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    PreferencesChanged,
    PreferencesWiped,
    FirmwareUpdated,
    AdminRequested,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartReason::PreferencesChanged => "preferences-changed",
            RestartReason::PreferencesWiped => "preferences-wiped",
            RestartReason::FirmwareUpdated => "firmware-updated",
            RestartReason::AdminRequested => "admin-requested",
        }
    }
}

#[derive(Clone)]
pub struct RestartHandle {
    tx: mpsc::Sender<RestartReason>,
}

/// Create the restart channel; the receiver belongs to `main`.
pub fn restart_channel() -> (RestartHandle, mpsc::Receiver<RestartReason>) {
    let (tx, rx) = mpsc::channel(4);
    (RestartHandle { tx }, rx)
}

impl RestartHandle {
    /// Request a restart after `delay`.  Fire-and-forget: the caller's
    /// response path continues immediately.
    pub fn schedule(&self, delay: Duration, reason: RestartReason) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(reason = reason.as_str(), "restart firing");
            let _ = tx.send(reason).await;
        });
    }
}
