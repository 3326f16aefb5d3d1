//! Progress event model shared by `BackupOrchestrator` and
//! `RestoreOrchestrator` (§4.6, §4.7).
//!
//! Events are pushed through a `crossbeam_channel::Sender` supplied by the
//! caller, so the core never depends on a UI or CLI crate to report
//! progress.

use crossbeam_channel::Sender;

use crate::error::Error;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started,
    FileEnqueued { path: String },
    FileCompleted { path: String, bytes: u64 },
    BytesTransferred { delta: u64, total: u64 },
    Finished { snapshot_id: i64 },
    Failed { reason: String },
    Cancelled,
}

/// A progress sink that silently drops events if the caller didn't wire
/// one up.
#[derive(Clone, Default)]
pub struct ProgressSink {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender: Some(sender) }
    }

    pub fn none() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn started(&self) {
        self.emit(ProgressEvent::Started);
    }

    pub fn file_enqueued(&self, path: impl Into<String>) {
        self.emit(ProgressEvent::FileEnqueued { path: path.into() });
    }

    pub fn file_completed(&self, path: impl Into<String>, bytes: u64) {
        self.emit(ProgressEvent::FileCompleted { path: path.into(), bytes });
    }

    pub fn bytes_transferred(&self, delta: u64, total: u64) {
        self.emit(ProgressEvent::BytesTransferred { delta, total });
    }

    pub fn finished(&self, snapshot_id: i64) {
        self.emit(ProgressEvent::Finished { snapshot_id });
    }

    pub fn failed(&self, error: &Error) {
        self.emit(ProgressEvent::Failed { reason: error.to_string() });
    }

    pub fn cancelled(&self) {
        self.emit(ProgressEvent::Cancelled);
    }
}

/// Cooperative cancellation token checked at file and chunk boundaries
/// (§4.6, §5). Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { flag: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
