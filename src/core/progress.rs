//! Progress reporting, typed change events, and cooperative cancellation.
//!
//! The engine never touches UI concerns: hosts register channel receivers
//! or implement [`ProgressSink`] and render however they like.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Phase of a batch apply, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPhase {
    Validating,
    CreatingDirectories,
    CreatingBackups,
    WritingFiles,
    RollingBack,
    Finalizing,
    Completed,
}

/// Immutable progress snapshot emitted after every phase transition and
/// completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub phase: BatchPhase,
    pub current_file: Option<PathBuf>,
    pub can_cancel: bool,
    pub cancellation_requested: bool,
    pub elapsed: Duration,
}

/// Receives progress snapshots. Implementations must tolerate being called
/// from whatever thread runs the batch.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &BatchProgress);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _progress: &BatchProgress) {}
}

/// Sink forwarding snapshots into an mpsc channel; send failures (host went
/// away) are ignored.
pub struct ChannelSink {
    tx: Sender<BatchProgress>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<BatchProgress>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn report(&self, progress: &BatchProgress) {
        let _ = self.tx.send(progress.clone());
    }
}

/// Typed notifications pushed after single-file mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    Applied { path: PathBuf, record_id: String },
    ConflictDetected { path: PathBuf },
    Undone { path: PathBuf, record_id: String },
}

/// Fan-out of [`ApplyEvent`]s to any number of subscribers. Disconnected
/// receivers are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    senders: Mutex<Vec<Sender<ApplyEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ApplyEvent> {
        let (tx, rx) = channel();
        self.senders.lock().expect("event bus lock").push(tx);
        rx
    }

    pub fn emit(&self, event: ApplyEvent) {
        let mut senders = self.senders.lock().expect("event bus lock");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Cooperative cancellation flag shared between host and engine. Checked
/// between operations, never mid-write; rollback ignores it entirely.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
