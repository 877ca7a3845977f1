//! Per-path change history with bounded depth and an undo window.
//!
//! Every successful single-file mutation pushes a [`FileChangeRecord`] onto
//! the target path's stack. Stacks are pruned past a fixed depth and
//! records age out of undo eligibility once the configured window elapses.
//! Content ids (xxh64 over normalized text) recorded here are what conflict
//! detection compares against the live file.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Content ID for change detection (xxh64 hash)
pub type ContentId = String;

/// Shared normalizer for content comparisons: strips trailing spaces/tabs
/// and carriage returns per line so ending style never causes a mismatch.
pub fn normalize_for_id(s: &str) -> String {
    s.lines()
        .map(|l| l.trim_end_matches([' ', '\t', '\r']))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generate deterministic content ID using xxh64 with fixed seed
pub fn content_id(content: &str) -> ContentId {
    let normalized = normalize_for_id(content);
    let h = xxhash_rust::xxh64::xxh64(normalized.as_bytes(), 0);
    format!("{h:016x}")
}

/// What a recorded mutation did to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One applied change, as remembered for undo and conflict checks.
///
/// Invariant: `Created` records carry no backup path (there was nothing to
/// snapshot); every other kind needs one to be undoable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeRecord {
    pub id: String,
    /// Normalized absolute path of the mutated file.
    pub path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub kind: ChangeKind,
    pub hash_before: Option<ContentId>,
    pub hash_after: Option<ContentId>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub created_at: DateTime<Utc>,
    pub undone: bool,
}

impl FileChangeRecord {
    /// Whether this record can ever be undone: not already undone, and
    /// backed by a snapshot unless it created the file.
    pub fn undoable(&self) -> bool {
        if self.undone {
            return false;
        }
        match self.kind {
            ChangeKind::Created => true,
            ChangeKind::Modified | ChangeKind::Deleted => self.backup_path.is_some(),
        }
    }

    /// Whether the undo window is still open for this record.
    pub fn within_window(&self, window: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.to_std().map(|age| age <= window).unwrap_or(true)
    }
}

/// Generate a sortable, filesystem-safe record ID.
pub fn generate_record_id() -> String {
    let ts = Utc::now().format("%Y%m%dT%H%M%S%3f").to_string();
    let alphabet = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            let idx = rng.random_range(0..alphabet.len());
            alphabet[idx] as char
        })
        .collect();
    format!("chg_{ts}_{suffix}")
}

/// Concurrent per-path record stacks. A single coarse lock keeps
/// push-and-prune atomic; all reads hand out clones.
#[derive(Debug)]
pub struct ChangeHistory {
    entries: Mutex<HashMap<PathBuf, Vec<FileChangeRecord>>>,
    max_entries: usize,
    undo_window: Duration,
}

impl ChangeHistory {
    pub fn new(max_entries: usize, undo_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            undo_window,
        }
    }

    pub fn undo_window(&self) -> Duration {
        self.undo_window
    }

    /// Normalize a path into the canonical key used by the map. Falls back
    /// to the raw path when canonicalization fails (e.g. deleted files).
    pub fn normalize_key(path: &Path) -> PathBuf {
        if let Ok(p) = dunce::canonicalize(path) {
            return p;
        }
        // Deleted targets: canonicalize the parent and re-attach the name.
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
            && let Ok(parent) = dunce::canonicalize(parent)
        {
            return parent.join(name);
        }
        path.to_path_buf()
    }

    /// Record a mutation, pruning the oldest entries past the cap.
    pub fn push(&self, record: FileChangeRecord) {
        debug_assert!(
            record.kind != ChangeKind::Created || record.backup_path.is_none(),
            "created records never carry a backup path"
        );

        let key = Self::normalize_key(&record.path);
        let mut entries = self.entries.lock().expect("history lock poisoned");
        let stack = entries.entry(key).or_default();
        stack.push(record);
        if stack.len() > self.max_entries {
            let excess = stack.len() - self.max_entries;
            stack.drain(..excess);
        }
    }

    /// Most recent record for a path, regardless of undo state.
    pub fn latest(&self, path: &Path) -> Option<FileChangeRecord> {
        let key = Self::normalize_key(path);
        let entries = self.entries.lock().expect("history lock poisoned");
        entries.get(&key).and_then(|s| s.last().cloned())
    }

    /// Most recent record that is still a candidate for undo.
    pub fn latest_undoable(&self, path: &Path) -> Option<FileChangeRecord> {
        let key = Self::normalize_key(path);
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .get(&key)
            .and_then(|s| s.iter().rev().find(|r| !r.undone).cloned())
    }

    /// Locate a record by id, across all paths.
    pub fn find(&self, id: &str) -> Option<FileChangeRecord> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .values()
            .flat_map(|s| s.iter())
            .find(|r| r.id == id)
            .cloned()
    }

    /// Flag a record as undone. Returns false when the id is unknown.
    pub fn mark_undone(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        for stack in entries.values_mut() {
            if let Some(r) = stack.iter_mut().find(|r| r.id == id) {
                r.undone = true;
                return true;
            }
        }
        false
    }

    /// Records for a path, newest first.
    pub fn records_for(&self, path: &Path) -> Vec<FileChangeRecord> {
        let key = Self::normalize_key(path);
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .get(&key)
            .map(|s| s.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}
