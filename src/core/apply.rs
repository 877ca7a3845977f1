//! Single-file apply service.
//!
//! Applies one code block or prepared diff to one path: conflict check
//! against the last recorded content id, backup, atomic write, history
//! record, undo. Every mutating operation acquires the service's write lock
//! first, so file writes are strictly serialized, including writes issued
//! on behalf of batch applies.
//!
//! Platform IO faults never escape this layer: each operation returns an
//! [`ApplyOutcome`] carrying a [`FailureKind`] from the fixed taxonomy.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::backup::BackupStore;
use crate::core::diff::{CodeBlock, DiffError, DiffOptions, DiffResult, diff_for_block};
use crate::core::history::{ChangeHistory, ChangeKind, ContentId, FileChangeRecord, content_id, generate_record_id};
use crate::core::progress::{ApplyEvent, EventBus};
use crate::infra::config::{ApplyConfig, EngineConfig};
use crate::infra::fsx::Filesystem;
use crate::infra::io::{detect_line_ending, restyle_newlines};

/// Structured failure taxonomy. Everything an operation can go wrong with
/// maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureKind {
    #[error("validation failed")]
    ValidationFailed,
    #[error("on-disk content diverged from last known state")]
    Conflict,
    #[error("permission denied")]
    PermissionDenied,
    #[error("file locked")]
    FileLocked,
    #[error("disk full")]
    DiskFull,
    #[error("io error")]
    Io,
    #[error("cancelled")]
    Cancelled,
}

/// Map a raw IO error into the taxonomy at the single-operation boundary.
pub fn classify_io_error(err: &io::Error) -> FailureKind {
    use io::ErrorKind::*;
    match err.kind() {
        PermissionDenied => FailureKind::PermissionDenied,
        StorageFull | QuotaExceeded => FailureKind::DiskFull,
        ResourceBusy | WouldBlock => FailureKind::FileLocked,
        _ => FailureKind::Io,
    }
}

/// Terminal status of one single-file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    Applied,
    Conflict,
    Failed,
    Skipped,
}

/// Structured result of one single-file operation. Callers never have to
/// infer state from errors: failures arrive as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub path: PathBuf,
    pub status: ApplyStatus,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    /// Change record created by a successful mutation (or undone by a
    /// successful undo).
    pub record_id: Option<String>,
}

impl ApplyOutcome {
    pub fn applied(path: PathBuf, record_id: String) -> Self {
        Self {
            path,
            status: ApplyStatus::Applied,
            failure: None,
            message: None,
            record_id: Some(record_id),
        }
    }

    pub fn conflict(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            status: ApplyStatus::Conflict,
            failure: Some(FailureKind::Conflict),
            message: Some(message.into()),
            record_id: None,
        }
    }

    pub fn failed(path: PathBuf, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            path,
            status: ApplyStatus::Failed,
            failure: Some(kind),
            message: Some(message.into()),
            record_id: None,
        }
    }

    pub fn skipped(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            status: ApplyStatus::Skipped,
            failure: None,
            message: Some(message.into()),
            record_id: None,
        }
    }

    /// Applied without a history record; batch operations track their
    /// reversal through the rollback manager instead.
    pub fn applied_untracked(path: PathBuf) -> Self {
        Self {
            path,
            status: ApplyStatus::Applied,
            failure: None,
            message: None,
            record_id: None,
        }
    }

    /// Skipped because cancellation was observed before execution.
    pub fn cancelled(path: PathBuf) -> Self {
        Self {
            path,
            status: ApplyStatus::Skipped,
            failure: Some(FailureKind::Cancelled),
            message: Some("cancelled before execution".into()),
            record_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ApplyStatus::Applied
    }
}

/// Per-call knobs for single-file applies.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub check_conflicts: bool,
    pub allow_overwrite: bool,
    pub create_backup: bool,
    pub create_parent_dirs: bool,
    pub preserve_line_endings: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from(&ApplyConfig::default())
    }
}

impl From<&ApplyConfig> for ApplyOptions {
    fn from(cfg: &ApplyConfig) -> Self {
        Self {
            check_conflicts: cfg.check_conflicts,
            allow_overwrite: cfg.allow_overwrite,
            create_backup: cfg.create_backup,
            create_parent_dirs: cfg.create_parent_dirs,
            preserve_line_endings: cfg.preserve_line_endings,
        }
    }
}

/// Relationship between the live file and the last recorded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictState {
    /// On-disk content matches the last record.
    Clean,
    /// Someone changed the file since the engine last touched it.
    Diverged {
        expected: ContentId,
        actual: ContentId,
    },
    /// The engine has no record for this path.
    Untracked,
}

/// Applies assistant-proposed content to individual files.
pub struct ApplyService {
    fs: Arc<dyn Filesystem>,
    backups: Arc<dyn BackupStore>,
    history: ChangeHistory,
    /// Serializes every disk mutation this service performs. Owned by the
    /// instance so independent engines never contend.
    write_lock: Mutex<()>,
    events: EventBus,
}

impl ApplyService {
    pub fn new(fs: Arc<dyn Filesystem>, backups: Arc<dyn BackupStore>, config: &EngineConfig) -> Self {
        Self {
            fs,
            backups,
            history: ChangeHistory::new(
                config.history.max_entries,
                config.history.undo_window(),
            ),
            write_lock: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    /// Register for change notifications.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<ApplyEvent> {
        self.events.subscribe()
    }

    /// Acquire the write lock. The batch service holds this across each of
    /// its own mutations so all writes stay serialized engine-wide.
    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().expect("write lock poisoned")
    }

    pub(crate) fn filesystem(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    /// Diff a block against the workspace without touching disk state.
    pub fn preview_apply(
        &self,
        block: &CodeBlock,
        workspace_root: &Path,
        diff_opts: &DiffOptions,
    ) -> Result<DiffResult, DiffError> {
        diff_for_block(block, workspace_root, self.fs.as_ref(), diff_opts)
    }

    /// Resolve a code block into a diff and apply it.
    pub fn apply_code_block(
        &self,
        block: &CodeBlock,
        workspace_root: &Path,
        opts: &ApplyOptions,
        diff_opts: &DiffOptions,
    ) -> ApplyOutcome {
        let diff = match diff_for_block(block, workspace_root, self.fs.as_ref(), diff_opts) {
            Ok(d) => d,
            Err(DiffError::Io(e)) => {
                return ApplyOutcome::failed(
                    block.target_path.clone(),
                    classify_io_error(&e),
                    e.to_string(),
                );
            }
            Err(e) => {
                return ApplyOutcome::failed(
                    block.target_path.clone(),
                    FailureKind::ValidationFailed,
                    e.to_string(),
                );
            }
        };
        self.apply_diff(&diff, workspace_root, opts)
    }

    /// Apply the proposed side of a prepared diff.
    pub fn apply_diff(
        &self,
        diff: &DiffResult,
        workspace_root: &Path,
        opts: &ApplyOptions,
    ) -> ApplyOutcome {
        let abs = workspace_root.join(&diff.path);

        if diff.is_binary {
            return ApplyOutcome::failed(
                abs,
                FailureKind::ValidationFailed,
                "binary content cannot be applied",
            );
        }
        if !diff.has_changes() && !diff.is_delete_file {
            return ApplyOutcome::skipped(abs, "no changes");
        }

        let _guard = self.write_guard();
        self.apply_locked(&abs, diff, opts)
    }

    /// The apply algorithm proper; caller holds the write lock.
    fn apply_locked(&self, abs: &Path, diff: &DiffResult, opts: &ApplyOptions) -> ApplyOutcome {
        let exists = self.fs.exists(abs);

        // 1) Conflict check: current on-disk content id vs the last record.
        let mut raw_current = None;
        if exists {
            match self.fs.read_to_string(abs) {
                Ok(content) => raw_current = Some(content),
                Err(e) => {
                    return ApplyOutcome::failed(
                        abs.to_path_buf(),
                        classify_io_error(&e),
                        format!("read {}: {e}", abs.display()),
                    );
                }
            }
        }

        if exists && opts.check_conflicts && !opts.allow_overwrite {
            if let Some(last) = self.history.latest(abs) {
                let actual = content_id(raw_current.as_deref().unwrap_or_default());
                if last.hash_after.as_deref() != Some(actual.as_str()) {
                    tracing::warn!(path = %abs.display(), "conflict: on-disk content diverged");
                    self.events.emit(ApplyEvent::ConflictDetected {
                        path: abs.to_path_buf(),
                    });
                    return ApplyOutcome::conflict(
                        abs.to_path_buf(),
                        "on-disk content changed since last recorded apply",
                    );
                }
            }
        }

        // 2) Backup before mutation when requested and possible.
        let mut backup_path = None;
        if opts.create_backup && exists {
            match self.backups.create_backup(abs) {
                Ok(p) => backup_path = Some(p),
                Err(e) => {
                    let kind = e
                        .downcast_ref::<io::Error>()
                        .map(classify_io_error)
                        .unwrap_or(FailureKind::Io);
                    return ApplyOutcome::failed(
                        abs.to_path_buf(),
                        kind,
                        format!("backup failed: {e:#}"),
                    );
                }
            }
        }

        // Deletions take a different tail: remove instead of write.
        if diff.is_delete_file {
            if !exists {
                return ApplyOutcome::skipped(abs.to_path_buf(), "already absent");
            }
            if let Err(e) = self.fs.remove_file(abs) {
                return ApplyOutcome::failed(
                    abs.to_path_buf(),
                    classify_io_error(&e),
                    format!("delete {}: {e}", abs.display()),
                );
            }
            return self.finish_mutation(abs, diff, ChangeKind::Deleted, backup_path, raw_current);
        }

        // 3) Resolve the bytes to write, matching the pre-existing
        //    line-ending style when configured.
        let content_to_write = match (&raw_current, opts.preserve_line_endings) {
            (Some(raw), true) => {
                let (ending, final_nl) = detect_line_ending(raw);
                restyle_newlines(&diff.proposed, ending, final_nl)
            }
            _ => diff.proposed.clone(),
        };

        // 4) Parent directories on demand.
        if opts.create_parent_dirs
            && let Some(parent) = abs.parent()
            && !self.fs.exists(parent)
            && let Err(e) = self.fs.create_dir_all(parent)
        {
            return ApplyOutcome::failed(
                abs.to_path_buf(),
                classify_io_error(&e),
                format!("create parent dirs for {}: {e}", abs.display()),
            );
        }

        // 5) Write.
        if let Err(e) = self.fs.write(abs, &content_to_write) {
            return ApplyOutcome::failed(
                abs.to_path_buf(),
                classify_io_error(&e),
                format!("write {}: {e}", abs.display()),
            );
        }

        let kind = if exists {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        self.finish_mutation(abs, diff, kind, backup_path, raw_current)
    }

    /// Record the mutation in history and notify subscribers.
    fn finish_mutation(
        &self,
        abs: &Path,
        diff: &DiffResult,
        kind: ChangeKind,
        backup_path: Option<PathBuf>,
        raw_before: Option<String>,
    ) -> ApplyOutcome {
        let record = FileChangeRecord {
            id: generate_record_id(),
            path: ChangeHistory::normalize_key(abs),
            // Created files have no prior content to snapshot.
            backup_path: if kind == ChangeKind::Created {
                None
            } else {
                backup_path
            },
            kind,
            hash_before: raw_before.as_deref().map(content_id),
            hash_after: if kind == ChangeKind::Deleted {
                None
            } else {
                Some(content_id(&diff.proposed))
            },
            lines_added: diff.stats.added,
            lines_removed: diff.stats.removed,
            created_at: chrono::Utc::now(),
            undone: false,
        };
        let record_id = record.id.clone();
        self.history.push(record);

        tracing::info!(path = %abs.display(), ?kind, record = %record_id, "change applied");
        self.events.emit(ApplyEvent::Applied {
            path: abs.to_path_buf(),
            record_id: record_id.clone(),
        });

        ApplyOutcome::applied(abs.to_path_buf(), record_id)
    }

    /// Compare the live file against the last recorded content id.
    pub fn check_for_conflicts(&self, path: &Path) -> ConflictState {
        let Some(last) = self.history.latest(path) else {
            return ConflictState::Untracked;
        };

        let actual = match self.fs.read_to_string(path) {
            Ok(content) => content_id(&content),
            // Missing file against a Deleted record is clean; anything else
            // diverged.
            Err(_) => {
                return if last.kind == ChangeKind::Deleted {
                    ConflictState::Clean
                } else {
                    ConflictState::Diverged {
                        expected: last.hash_after.clone().unwrap_or_default(),
                        actual: String::new(),
                    }
                };
            }
        };

        match &last.hash_after {
            Some(expected) if *expected == actual => ConflictState::Clean,
            Some(expected) => ConflictState::Diverged {
                expected: expected.clone(),
                actual,
            },
            None => ConflictState::Diverged {
                expected: String::new(),
                actual,
            },
        }
    }

    /// Undo the most recent not-yet-undone change for a path.
    pub fn undo_last_change(&self, path: &Path) -> ApplyOutcome {
        let Some(record) = self.history.latest_undoable(path) else {
            return ApplyOutcome::failed(
                path.to_path_buf(),
                FailureKind::ValidationFailed,
                "no undoable change recorded for path",
            );
        };
        let _guard = self.write_guard();
        self.undo_record(record)
    }

    /// Undo a specific change by record id.
    pub fn undo_change(&self, id: &str) -> ApplyOutcome {
        let Some(record) = self.history.find(id) else {
            return ApplyOutcome::failed(
                PathBuf::new(),
                FailureKind::ValidationFailed,
                format!("unknown change record: {id}"),
            );
        };
        let _guard = self.write_guard();
        self.undo_record(record)
    }

    fn undo_record(&self, record: FileChangeRecord) -> ApplyOutcome {
        let path = record.path.clone();

        if record.undone {
            return ApplyOutcome::failed(
                path,
                FailureKind::ValidationFailed,
                "change already undone",
            );
        }
        if !record.within_window(self.history.undo_window()) {
            return ApplyOutcome::failed(
                path,
                FailureKind::ValidationFailed,
                "undo window elapsed",
            );
        }
        if !record.undoable() {
            return ApplyOutcome::failed(
                path,
                FailureKind::ValidationFailed,
                "change has no backup to restore",
            );
        }

        match record.kind {
            ChangeKind::Created => {
                if self.fs.exists(&path)
                    && let Err(e) = self.fs.remove_file(&path)
                {
                    return ApplyOutcome::failed(
                        path.clone(),
                        classify_io_error(&e),
                        format!("undo create: {e}"),
                    );
                }
            }
            ChangeKind::Modified | ChangeKind::Deleted => {
                let Some(backup) = record.backup_path.as_ref() else {
                    return ApplyOutcome::failed(
                        path,
                        FailureKind::ValidationFailed,
                        "change has no backup to restore",
                    );
                };
                match self.backups.restore_backup(backup, &path) {
                    Ok(true) => {}
                    Ok(false) => {
                        return ApplyOutcome::failed(
                            path.clone(),
                            FailureKind::ValidationFailed,
                            "backup no longer available",
                        );
                    }
                    Err(e) => {
                        let kind = e
                            .downcast_ref::<io::Error>()
                            .map(classify_io_error)
                            .unwrap_or(FailureKind::Io);
                        return ApplyOutcome::failed(
                            path.clone(),
                            kind,
                            format!("restore failed: {e:#}"),
                        );
                    }
                }
            }
        }

        self.history.mark_undone(&record.id);
        tracing::info!(path = %path.display(), record = %record.id, "change undone");
        self.events.emit(ApplyEvent::Undone {
            path: path.clone(),
            record_id: record.id.clone(),
        });

        ApplyOutcome {
            path,
            status: ApplyStatus::Applied,
            failure: None,
            message: Some("undone".into()),
            record_id: Some(record.id),
        }
    }

    /// Change records for a path, newest first.
    pub fn change_history(&self, path: &Path) -> Vec<FileChangeRecord> {
        self.history.records_for(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backup::SessionBackups;
    use crate::infra::fsx::LocalFs;
    use std::fs;
    use tempfile::TempDir;

    fn service(ws: &Path) -> ApplyService {
        let config = EngineConfig::default();
        ApplyService::new(
            Arc::new(LocalFs),
            Arc::new(SessionBackups::begin(ws, &config.backup_dir, "apply").unwrap()),
            &config,
        )
    }

    fn block(path: &str, content: &str) -> CodeBlock {
        CodeBlock {
            id: None,
            target_path: PathBuf::from(path),
            content: content.into(),
            complete_file: true,
            line_range: None,
        }
    }

    #[test]
    fn creates_missing_file_with_parents() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());

        let outcome = svc.apply_code_block(
            &block("src/deep/new.rs", "fn f() {}\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/deep/new.rs")).unwrap(),
            "fn f() {}\n"
        );

        let records = svc.change_history(&tmp.path().join("src/deep/new.rs"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Created);
        assert!(records[0].backup_path.is_none());
    }

    #[test]
    fn detects_external_divergence_as_conflict() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        let target = tmp.path().join("f.txt");

        let first = svc.apply_code_block(
            &block("f.txt", "engine v1\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert!(first.is_success());

        // Someone else edits the file.
        fs::write(&target, "external edit\n").unwrap();

        assert!(matches!(
            svc.check_for_conflicts(&target),
            ConflictState::Diverged { .. }
        ));

        let second = svc.apply_code_block(
            &block("f.txt", "engine v2\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert_eq!(second.status, ApplyStatus::Conflict);
        // File untouched by the refused apply.
        assert_eq!(fs::read_to_string(&target).unwrap(), "external edit\n");

        // Explicit overwrite permission bypasses the check.
        let forced = svc.apply_code_block(
            &block("f.txt", "engine v2\n"),
            tmp.path(),
            &ApplyOptions {
                allow_overwrite: true,
                ..ApplyOptions::default()
            },
            &DiffOptions::default(),
        );
        assert!(forced.is_success());
    }

    #[test]
    fn preserves_crlf_style_on_rewrite() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        let target = tmp.path().join("w.txt");
        fs::write(&target, "a\r\nb\r\n").unwrap();

        let outcome = svc.apply_code_block(
            &block("w.txt", "a\nB\n"),
            tmp.path(),
            &ApplyOptions {
                check_conflicts: false,
                ..ApplyOptions::default()
            },
            &DiffOptions::default(),
        );
        assert!(outcome.is_success());
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\r\nB\r\n");
    }

    #[test]
    fn undo_restores_previous_content() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        let target = tmp.path().join("u.txt");
        fs::write(&target, "original\n").unwrap();

        let outcome = svc.apply_code_block(
            &block("u.txt", "replaced\n"),
            tmp.path(),
            &ApplyOptions {
                check_conflicts: false,
                ..ApplyOptions::default()
            },
            &DiffOptions::default(),
        );
        assert!(outcome.is_success());
        assert_eq!(fs::read_to_string(&target).unwrap(), "replaced\n");

        let undo = svc.undo_last_change(&target);
        assert!(undo.is_success(), "{undo:?}");
        assert_eq!(fs::read_to_string(&target).unwrap(), "original\n");

        // A second undo finds nothing left to undo.
        let again = svc.undo_last_change(&target);
        assert_eq!(again.status, ApplyStatus::Failed);
    }

    #[test]
    fn undo_of_created_file_deletes_it() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());

        let outcome = svc.apply_code_block(
            &block("made.txt", "x\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        let undo = svc.undo_change(outcome.record_id.as_deref().unwrap());
        assert!(undo.is_success());
        assert!(!tmp.path().join("made.txt").exists());
    }

    #[test]
    fn undo_fails_outside_window() {
        let tmp = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.history.undo_window_secs = 0;
        let svc = ApplyService::new(
            Arc::new(LocalFs),
            Arc::new(SessionBackups::begin(tmp.path(), &config.backup_dir, "apply").unwrap()),
            &config,
        );

        let outcome = svc.apply_code_block(
            &block("t.txt", "x\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert!(outcome.is_success());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let undo = svc.undo_last_change(&tmp.path().join("t.txt"));
        assert_eq!(undo.status, ApplyStatus::Failed);
        assert!(undo.message.unwrap().contains("window"));
    }

    #[test]
    fn identical_content_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        fs::write(tmp.path().join("same.txt"), "abc\n").unwrap();

        let outcome = svc.apply_code_block(
            &block("same.txt", "abc\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert_eq!(outcome.status, ApplyStatus::Skipped);
    }

    #[test]
    fn concurrent_applies_never_interleave() {
        let tmp = TempDir::new().unwrap();
        let svc = Arc::new(service(tmp.path()));
        let target = tmp.path().join("race.txt");
        fs::write(&target, "seed\n").unwrap();

        let content_a: String = (0..200).map(|i| format!("alpha {i}\n")).collect();
        let content_b: String = (0..200).map(|i| format!("beta {i}\n")).collect();

        let opts = ApplyOptions {
            check_conflicts: false,
            ..ApplyOptions::default()
        };

        let handles: Vec<_> = [content_a.clone(), content_b.clone()]
            .into_iter()
            .map(|content| {
                let svc = Arc::clone(&svc);
                let root = tmp.path().to_path_buf();
                let opts = opts.clone();
                std::thread::spawn(move || {
                    svc.apply_code_block(
                        &CodeBlock {
                            id: None,
                            target_path: PathBuf::from("race.txt"),
                            content,
                            complete_file: true,
                            line_range: None,
                        },
                        &root,
                        &opts,
                        &DiffOptions::default(),
                    )
                })
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap().is_success());
        }

        // Whatever won, the file is one complete proposal, never a splice.
        let final_content = fs::read_to_string(&target).unwrap();
        assert!(final_content == content_a || final_content == content_b);
    }

    #[test]
    fn events_fire_on_apply_and_conflict() {
        let tmp = TempDir::new().unwrap();
        let svc = service(tmp.path());
        let events = svc.subscribe();

        svc.apply_code_block(
            &block("e.txt", "v1\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            ApplyEvent::Applied { .. }
        ));

        fs::write(tmp.path().join("e.txt"), "external\n").unwrap();
        svc.apply_code_block(
            &block("e.txt", "v2\n"),
            tmp.path(),
            &ApplyOptions::default(),
            &DiffOptions::default(),
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            ApplyEvent::ConflictDetected { .. }
        ));
    }
}
