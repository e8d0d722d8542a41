//! Lifecycle events delivered to the UI collaborator.
//!
//! Events go through a single unbounded channel, so a receiver observes them
//! in exactly the order the controller emitted them. Payloads are owned
//! snapshots.

use semver::Version;
use tokio::sync::mpsc;
use tracing::debug;

use crate::download::DownloadProgress;
use crate::error::{ErrorKind, UpdateError};
use crate::manifest::ManifestSummary;

/// An event emitted by the update controller.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    CheckingForUpdate,
    UpdateAvailable(ManifestSummary),
    UpdateNotAvailable { current: Version },
    DownloadProgress(DownloadProgress),
    UpdateDownloaded(ManifestSummary),
    Error { kind: ErrorKind, message: String },
}

impl UpdateEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::CheckingForUpdate => "checking-for-update",
            UpdateEvent::UpdateAvailable(_) => "update-available",
            UpdateEvent::UpdateNotAvailable { .. } => "update-not-available",
            UpdateEvent::DownloadProgress(_) => "download-progress",
            UpdateEvent::UpdateDownloaded(_) => "update-downloaded",
            UpdateEvent::Error { .. } => "error",
        }
    }

    pub fn error(err: &UpdateError) -> Self {
        UpdateEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<UpdateEvent>;

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A dropped receiver is not an error for the engine.
    pub fn emit(&self, event: UpdateEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "Event receiver dropped");
        }
    }
}
