//! Debounced workspace watcher.
//!
//! Wraps `notify`'s recommended watcher and coalesces the raw event stream
//! into per-path batches: rapid create/modify bursts (editors, builds)
//! collapse into a single event per path per debounce window.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Coalesced filesystem change delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatchEvent {
    fn key(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
            WatchEvent::Renamed { to, .. } => to,
        }
    }
}

/// Recursive directory watcher producing debounced event batches.
///
/// Dropping the watcher stops both the OS watch and the debounce thread.
pub struct WorkspaceWatcher {
    _watcher: RecommendedWatcher,
    batches: Receiver<Vec<WatchEvent>>,
}

impl WorkspaceWatcher {
    pub fn new(root: &Path, debounce: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("create filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        let (batch_tx, batch_rx) = mpsc::channel();
        thread::spawn(move || debounce_loop(raw_rx, batch_tx, debounce));

        Ok(Self {
            _watcher: watcher,
            batches: batch_rx,
        })
    }

    /// Block until the next batch arrives (or the watcher is torn down).
    pub fn recv(&self) -> Option<Vec<WatchEvent>> {
        self.batches.recv().ok()
    }

    /// Non-blocking poll for a pending batch.
    pub fn try_recv(&self) -> Option<Vec<WatchEvent>> {
        self.batches.try_recv().ok()
    }
}

fn debounce_loop(
    raw: Receiver<notify::Result<notify::Event>>,
    out: mpsc::Sender<Vec<WatchEvent>>,
    window: Duration,
) {
    // Insertion order is preserved so hosts see changes roughly in the order
    // they happened.
    let mut pending: IndexMap<PathBuf, WatchEvent> = IndexMap::new();

    loop {
        let next = if pending.is_empty() {
            match raw.recv() {
                Ok(ev) => Some(ev),
                Err(_) => break,
            }
        } else {
            match raw.recv_timeout(window) {
                Ok(ev) => Some(ev),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match next {
            Some(Ok(event)) => {
                for ev in translate(event) {
                    merge(&mut pending, ev);
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "watcher error");
            }
            None => {
                // Quiet window elapsed; flush what we have.
                let batch: Vec<WatchEvent> = pending.drain(..).map(|(_, ev)| ev).collect();
                if !batch.is_empty() && out.send(batch).is_err() {
                    break;
                }
            }
        }
    }

    let batch: Vec<WatchEvent> = pending.drain(..).map(|(_, ev)| ev).collect();
    if !batch.is_empty() {
        let _ = out.send(batch);
    }
}

/// Map a raw notify event to zero or more typed events.
fn translate(event: notify::Event) -> Vec<WatchEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(WatchEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(WatchEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![WatchEvent::Renamed { from, to }],
                (Some(only), None) => vec![WatchEvent::Modified(only)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(_) => event.paths.into_iter().map(WatchEvent::Modified).collect(),
        _ => Vec::new(),
    }
}

/// Fold a new event into the pending map, last-wins with two exceptions:
/// a modify after a create stays a create, and a delete cancels a create
/// observed inside the same window.
fn merge(pending: &mut IndexMap<PathBuf, WatchEvent>, ev: WatchEvent) {
    let key = ev.key().to_path_buf();

    match (pending.get(&key), &ev) {
        (Some(WatchEvent::Created(_)), WatchEvent::Modified(p)) => {
            let created = WatchEvent::Created(p.clone());
            pending.insert(key, created);
        }
        (Some(WatchEvent::Created(_)), WatchEvent::Deleted(_)) => {
            pending.shift_remove(&key);
        }
        _ => {
            pending.insert(key, ev);
        }
    }
}
