//! Outbound notifications.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use vidvault_protocol::ErrorKind;

/// Receives transfer outcomes. Calls are made while the scheduler holds
/// its lock, so implementations must not block.
pub trait Notifier: Send + Sync {
    fn on_progress(&self, key: &str, fraction: f32);
    fn on_completed(&self, key: &str, location: &Path);
    fn on_failed(&self, key: &str, error: &ErrorKind);
    fn on_insufficient_space(&self, key: &str);
}

/// A notification as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { key: String, fraction: f32 },
    Completed { key: String, location: PathBuf },
    Failed { key: String, error: ErrorKind },
    InsufficientSpace { key: String },
}

impl TransferEvent {
    pub fn key(&self) -> &str {
        match self {
            TransferEvent::Progress { key, .. }
            | TransferEvent::Completed { key, .. }
            | TransferEvent::Failed { key, .. }
            | TransferEvent::InsufficientSpace { key } => key,
        }
    }

    /// Returns `true` for events after which the transfer is no longer running.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress { .. })
    }
}

/// [`Notifier`] that forwards every notification over a channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TransferEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.rx.lock().unwrap().take()
    }

    fn send(&self, event: TransferEvent) {
        if self.tx.send(event).is_err() {
            debug!("notification dropped, receiver gone");
        }
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ChannelNotifier {
    fn on_progress(&self, key: &str, fraction: f32) {
        self.send(TransferEvent::Progress {
            key: key.to_string(),
            fraction,
        });
    }

    fn on_completed(&self, key: &str, location: &Path) {
        self.send(TransferEvent::Completed {
            key: key.to_string(),
            location: location.to_path_buf(),
        });
    }

    fn on_failed(&self, key: &str, error: &ErrorKind) {
        self.send(TransferEvent::Failed {
            key: key.to_string(),
            error: error.clone(),
        });
    }

    fn on_insufficient_space(&self, key: &str) {
        self.send(TransferEvent::InsufficientSpace {
            key: key.to_string(),
        });
    }
}
