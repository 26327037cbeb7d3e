//! The event bus — one typed broadcast channel per event kind.
//!
//! Subscribers own their receivers and run wherever they like; ordering
//! is preserved within a kind, never across kinds. Raising an event with
//! no subscribers is a no-op.

use tokio::sync::broadcast;

use nimbus_core::fileid::HashFile;

const CHANNEL_CAPACITY: usize = 64;

/// Engine-visible state of the synchronization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Idle, watching for changes.
    Monitoring,
    /// Operations are queued or dispatching.
    Pending,
    /// The remote refused new content for lack of space.
    RemoteDriveOverLimit,
    /// Both ends hold the same table.
    Synchronized,
    /// This instance is shutting down.
    LoggedOut,
}

/// Progress of one transfer direction.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub upload: bool,
    pub name_hash: HashFile,
    pub part: u32,
    pub total: u32,
    pub name: Option<String>,
    pub length: Option<u64>,
    pub completed: bool,
}

/// A file-level failure surfaced to the embedding application.
#[derive(Debug, Clone)]
pub struct FileError {
    pub path: Option<String>,
    /// Fatal errors stop the instance; everything else was recovered
    /// locally and is informational.
    pub fatal: bool,
    pub message: String,
}

pub struct EventBus {
    status: broadcast::Sender<SyncStatus>,
    progress: broadcast::Sender<TransferProgress>,
    errors: broadcast::Sender<FileError>,
    /// File names skipped because the platform's antivirus blocked them.
    antivirus: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            progress: broadcast::channel(CHANNEL_CAPACITY).0,
            errors: broadcast::channel(CHANNEL_CAPACITY).0,
            antivirus: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn raise_status(&self, status: SyncStatus) {
        tracing::debug!(?status, "status changed");
        let _ = self.status.send(status);
    }

    pub fn raise_progress(&self, progress: TransferProgress) {
        let _ = self.progress.send(progress);
    }

    pub fn raise_error(&self, error: FileError) {
        if error.fatal {
            tracing::error!(path = ?error.path, message = %error.message, "file error");
        } else {
            tracing::warn!(path = ?error.path, message = %error.message, "file error (recovered)");
        }
        let _ = self.errors.send(error);
    }

    pub fn raise_antivirus(&self, file_name: String) {
        tracing::warn!(file = %file_name, "file skipped by antivirus");
        let _ = self.antivirus.send(file_name);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<FileError> {
        self.errors.subscribe()
    }

    pub fn subscribe_antivirus(&self) -> broadcast::Receiver<String> {
        self.antivirus.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_status();

        bus.raise_status(SyncStatus::Pending);
        bus.raise_status(SyncStatus::Monitoring);

        assert_eq!(rx.recv().await.unwrap(), SyncStatus::Pending);
        assert_eq!(rx.recv().await.unwrap(), SyncStatus::Monitoring);
    }

    #[tokio::test]
    async fn raising_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.raise_status(SyncStatus::Pending);
        bus.raise_progress(TransferProgress {
            upload: true,
            name_hash: 1,
            part: 1,
            total: 2,
            name: None,
            length: None,
            completed: false,
        });
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_status();
        let mut b = bus.subscribe_status();

        bus.raise_status(SyncStatus::Synchronized);

        assert_eq!(a.recv().await.unwrap(), SyncStatus::Synchronized);
        assert_eq!(b.recv().await.unwrap(), SyncStatus::Synchronized);
    }
}
