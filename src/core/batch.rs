//! Batch proposal service.
//!
//! Orchestrates an ordered set of file operations against a workspace:
//! validation, directory creation (parents before children), backups,
//! ordered writes, and finalize-or-rollback. One mutable context per batch
//! tracks the phase state machine
//! `Validating -> CreatingDirectories -> CreatingBackups -> WritingFiles ->
//! {RollingBack | Finalizing} -> Completed` and owns the rollback manager,
//! so a failed or cancelled batch always lands back in the pre-apply state
//! (or reports that compensation was incomplete).

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::apply::{ApplyOutcome, ApplyService, ApplyStatus, FailureKind, classify_io_error};
use crate::core::backup::BackupStore;
use crate::core::progress::{BatchPhase, BatchProgress, CancelToken, ProgressSink};
use crate::core::rollback::RollbackManager;
use crate::infra::config::BatchConfig;
use crate::infra::fsx::Filesystem;

/// Characters never allowed in workspace-relative target paths.
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Longest accepted workspace-relative path, in characters.
const MAX_PATH_LEN: usize = 255;

/// What a single proposed operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Modify,
    Delete,
    Rename,
    Move,
    CreateDirectory,
}

/// One proposed file operation. Produced by the host; the engine only reads
/// it (and honors the `selected` flag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    pub kind: OperationKind,
    /// Workspace-relative target.
    pub path: PathBuf,
    /// New content for Create/Modify.
    pub content: Option<String>,
    /// Destination for Rename/Move.
    pub new_path: Option<PathBuf>,
    /// Explicit application order within the batch.
    pub order: u32,
    /// Only selected operations are applied.
    pub selected: bool,
}

/// Lifecycle of a proposal as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Proposed,
    PartiallyApplied,
    FullyApplied,
    Rejected,
}

/// An ordered, partially-selectable set of operations for one batch apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTreeProposal {
    pub id: String,
    pub operations: Vec<FileOperation>,
    pub status: ProposalStatus,
}

impl FileTreeProposal {
    pub fn new(id: impl Into<String>, operations: Vec<FileOperation>) -> Self {
        Self {
            id: id.into(),
            operations,
            status: ProposalStatus::Proposed,
        }
    }

    /// Selected operations in their explicit application order.
    pub fn selected_operations(&self) -> Vec<&FileOperation> {
        let mut ops: Vec<&FileOperation> =
            self.operations.iter().filter(|op| op.selected).collect();
        ops.sort_by_key(|op| op.order);
        ops
    }
}

/// Severity of one validation finding. Only errors block a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl ValidationIssue {
    fn error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path,
            message: message.into(),
        }
    }

    fn warning(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            path,
            message: message.into(),
        }
    }
}

/// All findings for one proposal. Warnings never block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }
}

/// Batch policies, usually sourced from [`BatchConfig`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub continue_on_failure: bool,
    pub rollback_on_partial_failure: bool,
    pub stop_on_validation_errors: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

impl From<&BatchConfig> for BatchOptions {
    fn from(cfg: &BatchConfig) -> Self {
        Self {
            continue_on_failure: cfg.continue_on_failure,
            rollback_on_partial_failure: cfg.rollback_on_partial_failure,
            stop_on_validation_errors: cfg.stop_on_validation_errors,
        }
    }
}

/// Aggregate outcome of one batch apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchApplyResult {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Per-operation outcomes, in application order.
    pub results: Vec<ApplyOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub was_cancelled: bool,
    pub was_rolled_back: bool,
    /// False when a best-effort rollback could not compensate everything.
    pub rollback_complete: bool,
    pub validation: Vec<ValidationIssue>,
}

/// Ephemeral per-batch bookkeeping: the phase machine, counters, results,
/// and the one rollback manager for this batch.
struct BatchContext<'a> {
    phase: BatchPhase,
    total: usize,
    completed: usize,
    results: Vec<ApplyOutcome>,
    rollback: RollbackManager,
    started: Instant,
    started_at: DateTime<Utc>,
    sink: &'a dyn ProgressSink,
    cancel: CancelToken,
    was_cancelled: bool,
}

impl<'a> BatchContext<'a> {
    fn new(
        total: usize,
        rollback: RollbackManager,
        sink: &'a dyn ProgressSink,
        cancel: CancelToken,
    ) -> Self {
        Self {
            phase: BatchPhase::Validating,
            total,
            completed: 0,
            results: Vec::with_capacity(total),
            rollback,
            started: Instant::now(),
            started_at: Utc::now(),
            sink,
            cancel,
            was_cancelled: false,
        }
    }

    fn snapshot(&self, current_file: Option<PathBuf>) -> BatchProgress {
        let can_cancel = matches!(
            self.phase,
            BatchPhase::Validating
                | BatchPhase::CreatingDirectories
                | BatchPhase::CreatingBackups
                | BatchPhase::WritingFiles
        );
        BatchProgress {
            total_operations: self.total,
            completed_operations: self.completed,
            phase: self.phase,
            current_file,
            can_cancel,
            cancellation_requested: self.cancel.is_cancelled(),
            elapsed: self.started.elapsed(),
        }
    }

    fn set_phase(&mut self, phase: BatchPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "batch phase transition");
        self.phase = phase;
        self.sink.report(&self.snapshot(None));
    }

    fn push_result(&mut self, outcome: ApplyOutcome) {
        self.completed += 1;
        let current = outcome.path.clone();
        self.results.push(outcome);
        self.sink.report(&self.snapshot(Some(current)));
    }

    fn tally(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for r in &self.results {
            match r.status {
                ApplyStatus::Applied => counts.0 += 1,
                ApplyStatus::Failed | ApplyStatus::Conflict => counts.1 += 1,
                ApplyStatus::Skipped => counts.2 += 1,
            }
        }
        counts
    }
}

/// Applies whole proposals transactionally.
pub struct BatchService {
    apply: Arc<ApplyService>,
    backups: Arc<dyn BackupStore>,
    /// Guards the orchestration entry point: two batches never interleave
    /// phase transitions.
    batch_lock: Mutex<()>,
}

impl BatchService {
    pub fn new(apply: Arc<ApplyService>, backups: Arc<dyn BackupStore>) -> Self {
        Self {
            apply,
            backups,
            batch_lock: Mutex::new(()),
        }
    }

    fn fs(&self) -> &Arc<dyn Filesystem> {
        self.apply.filesystem()
    }

    /// Validate a proposal without touching disk state. Only
    /// `Severity::Error` findings make the proposal invalid.
    pub fn validate_proposal(
        &self,
        proposal: &FileTreeProposal,
        workspace_root: &Path,
    ) -> ValidationReport {
        let mut issues = Vec::new();
        let fs = self.fs();

        // Duplicate targets, case-insensitive.
        for key in proposal
            .operations
            .iter()
            .map(|op| op.path.to_string_lossy().to_lowercase())
            .duplicates()
        {
            issues.push(ValidationIssue::error(
                Some(PathBuf::from(&key)),
                "duplicate target path",
            ));
        }

        for op in &proposal.operations {
            self.validate_path(&op.path, &mut issues);
            if let Some(new_path) = &op.new_path {
                self.validate_path(new_path, &mut issues);
            }

            let abs = workspace_root.join(&op.path);
            match op.kind {
                OperationKind::Create => {
                    if fs.exists(&abs) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "create target already exists and will be overwritten",
                        ));
                    }
                    if op.content.as_deref().is_none_or(str::is_empty) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "create with empty content",
                        ));
                    }
                }
                OperationKind::Modify => {
                    if !fs.exists(&abs) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "modify target does not exist and will be created",
                        ));
                    }
                    if op.content.as_deref().is_none_or(str::is_empty) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "modify with empty content",
                        ));
                    }
                }
                OperationKind::Delete => {
                    if !fs.exists(&abs) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "delete target does not exist",
                        ));
                    }
                }
                OperationKind::Rename | OperationKind::Move => {
                    if !fs.exists(&abs) {
                        issues.push(ValidationIssue::warning(
                            Some(op.path.clone()),
                            "rename/move source does not exist",
                        ));
                    }
                    match &op.new_path {
                        None => issues.push(ValidationIssue::error(
                            Some(op.path.clone()),
                            "rename/move without a destination path",
                        )),
                        Some(new_path) => {
                            if fs.exists(&workspace_root.join(new_path)) {
                                issues.push(ValidationIssue::warning(
                                    Some(new_path.clone()),
                                    "rename/move destination already exists",
                                ));
                            }
                        }
                    }
                }
                OperationKind::CreateDirectory => {}
            }
        }

        ValidationReport { issues }
    }

    /// Shape checks shared by target and destination paths.
    fn validate_path(&self, path: &Path, issues: &mut Vec<ValidationIssue>) {
        let text = path.to_string_lossy();

        if text.trim().is_empty() {
            issues.push(ValidationIssue::error(None, "empty target path"));
            return;
        }
        if text.chars().count() > MAX_PATH_LEN {
            issues.push(ValidationIssue::error(
                Some(path.to_path_buf()),
                format!("path longer than {MAX_PATH_LEN} characters"),
            ));
        }
        if text
            .chars()
            .any(|c| INVALID_PATH_CHARS.contains(&c) || c.is_control())
        {
            issues.push(ValidationIssue::error(
                Some(path.to_path_buf()),
                "path contains invalid characters",
            ));
        }

        // Workspace escape: absolute paths and `..` components.
        if path.is_absolute() {
            issues.push(ValidationIssue::error(
                Some(path.to_path_buf()),
                "path must be workspace-relative",
            ));
        }
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    issues.push(ValidationIssue::error(
                        Some(path.to_path_buf()),
                        "path escapes the workspace root",
                    ));
                    break;
                }
                Component::Prefix(_) | Component::RootDir => {
                    issues.push(ValidationIssue::error(
                        Some(path.to_path_buf()),
                        "path must be workspace-relative",
                    ));
                    break;
                }
                _ => {}
            }
        }
    }

    /// Apply the selected operations of a proposal as one transaction.
    ///
    /// Failures and cancellation are reported as data in the returned
    /// [`BatchApplyResult`]; an `Err` is only returned for unexpected
    /// internal errors, and even then a best-effort rollback has already
    /// run.
    pub fn apply_proposal(
        &self,
        proposal: &mut FileTreeProposal,
        workspace_root: &Path,
        opts: &BatchOptions,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> anyhow::Result<BatchApplyResult> {
        let _entry = self.batch_lock.lock().expect("batch lock poisoned");

        let selected: Vec<FileOperation> = proposal
            .selected_operations()
            .into_iter()
            .cloned()
            .collect();

        let rollback = RollbackManager::new(Arc::clone(self.fs()), Arc::clone(&self.backups));
        let mut ctx = BatchContext::new(selected.len(), rollback, sink, cancel.clone());
        ctx.set_phase(BatchPhase::Validating);

        let report = self.validate_proposal(proposal, workspace_root);
        if !report.is_valid() && opts.stop_on_validation_errors {
            tracing::warn!(
                proposal = %proposal.id,
                errors = report.errors().count(),
                "proposal abandoned by validation"
            );
            ctx.set_phase(BatchPhase::Completed);
            proposal.status = ProposalStatus::Rejected;
            return Ok(BatchApplyResult {
                succeeded: 0,
                failed: 0,
                skipped: selected.len(),
                results: Vec::new(),
                started_at: ctx.started_at,
                finished_at: Utc::now(),
                was_cancelled: false,
                // Nothing was written; the batch is reported as rolled back
                // so callers treat the workspace as untouched.
                was_rolled_back: true,
                rollback_complete: true,
                validation: report.issues,
            });
        }

        // Any unexpected error below must still compensate applied work.
        let run = self.run_batch(&mut ctx, &selected, workspace_root, opts);
        if let Err(err) = run {
            tracing::error!(proposal = %proposal.id, error = %err, "batch failed unexpectedly, rolling back");
            ctx.set_phase(BatchPhase::RollingBack);
            ctx.rollback.rollback();
            ctx.set_phase(BatchPhase::Completed);
            proposal.status = ProposalStatus::Rejected;
            return Err(err);
        }

        // Post-write: compensate or commit.
        let (_, failed, _) = ctx.tally();
        let must_roll_back =
            (ctx.was_cancelled || failed > 0) && opts.rollback_on_partial_failure;

        let (was_rolled_back, rollback_complete) = if must_roll_back {
            ctx.set_phase(BatchPhase::RollingBack);
            let complete = ctx.rollback.rollback();
            (true, complete)
        } else {
            ctx.set_phase(BatchPhase::Finalizing);
            ctx.rollback.commit();
            (false, true)
        };

        ctx.set_phase(BatchPhase::Completed);

        let (succeeded, failed, skipped) = ctx.tally();
        proposal.status = if was_rolled_back {
            ProposalStatus::Rejected
        } else if failed == 0 {
            ProposalStatus::FullyApplied
        } else if succeeded > 0 {
            ProposalStatus::PartiallyApplied
        } else {
            ProposalStatus::Rejected
        };

        Ok(BatchApplyResult {
            succeeded,
            failed,
            skipped,
            results: ctx.results,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            was_cancelled: ctx.was_cancelled,
            was_rolled_back,
            rollback_complete,
            validation: report.issues,
        })
    }

    /// Directory, backup, and write phases. Per-operation failures become
    /// results; an `Err` here means something outside the per-op flow broke.
    fn run_batch(
        &self,
        ctx: &mut BatchContext<'_>,
        selected: &[FileOperation],
        workspace_root: &Path,
        opts: &BatchOptions,
    ) -> anyhow::Result<()> {
        let fs = Arc::clone(self.fs());

        // -- CreatingDirectories: parents before children ------------------
        ctx.set_phase(BatchPhase::CreatingDirectories);
        let mut created_dirs: HashSet<PathBuf> = HashSet::new();
        let mut needed: Vec<PathBuf> = Vec::new();
        for op in selected {
            let abs = workspace_root.join(&op.path);
            match op.kind {
                OperationKind::CreateDirectory => needed.push(abs),
                OperationKind::Create | OperationKind::Modify => {
                    if let Some(parent) = abs.parent() {
                        needed.push(parent.to_path_buf());
                    }
                }
                OperationKind::Rename | OperationKind::Move => {
                    if let Some(new_path) = &op.new_path
                        && let Some(parent) = workspace_root.join(new_path).parent()
                    {
                        needed.push(parent.to_path_buf());
                    }
                }
                OperationKind::Delete => {}
            }
        }
        // Shortest paths first so parents are created (and registered)
        // before their children.
        needed.sort_by_key(|p| (p.components().count(), p.clone()));
        needed.dedup();
        for dir in needed {
            self.ensure_dir(ctx, &fs, workspace_root, &dir, &mut created_dirs)?;
        }

        // -- CreatingBackups: every existing target we may clobber ---------
        ctx.set_phase(BatchPhase::CreatingBackups);
        let mut backup_map: HashMap<PathBuf, PathBuf> = HashMap::new();
        for op in selected {
            let wants_backup = matches!(
                op.kind,
                OperationKind::Modify | OperationKind::Delete | OperationKind::Create
            );
            if !wants_backup {
                continue;
            }
            let abs = workspace_root.join(&op.path);
            if fs.exists(&abs) && !backup_map.contains_key(&abs) {
                let backup = self
                    .backups
                    .create_backup(&abs)
                    .map_err(|e| e.context(format!("backup {}", abs.display())))?;
                backup_map.insert(abs, backup);
            }
        }

        // -- WritingFiles: strict explicit order, one at a time ------------
        ctx.set_phase(BatchPhase::WritingFiles);
        let mut halted_at: Option<usize> = None;

        for (idx, op) in selected.iter().enumerate() {
            // Cooperative cancellation between operations, never mid-write.
            if ctx.cancel.is_cancelled() {
                tracing::info!("cancellation observed between operations");
                ctx.was_cancelled = true;
                halted_at = Some(idx);
                break;
            }

            // All engine writes serialize through the apply service's lock.
            let outcome = {
                let _write = self.apply.write_guard();
                self.execute_operation(ctx, op, workspace_root, &backup_map, &mut created_dirs)
            };

            let is_failure = matches!(outcome.status, ApplyStatus::Failed | ApplyStatus::Conflict);
            ctx.push_result(outcome);

            if is_failure && !opts.continue_on_failure {
                halted_at = Some(idx + 1);
                break;
            }
        }

        // Remaining operations were never attempted.
        if let Some(from) = halted_at {
            for op in &selected[from..] {
                let outcome = if ctx.was_cancelled {
                    ApplyOutcome::cancelled(workspace_root.join(&op.path))
                } else {
                    ApplyOutcome::skipped(workspace_root.join(&op.path), "not attempted")
                };
                ctx.push_result(outcome);
            }
        }

        Ok(())
    }

    /// Create every missing ancestor of `dir`, registering each one for
    /// rollback individually.
    fn ensure_dir(
        &self,
        ctx: &mut BatchContext<'_>,
        fs: &Arc<dyn Filesystem>,
        workspace_root: &Path,
        dir: &Path,
        created_dirs: &mut HashSet<PathBuf>,
    ) -> anyhow::Result<()> {
        // Collect missing ancestors up to (not including) the workspace root.
        let mut missing: Vec<PathBuf> = Vec::new();
        let mut cursor = Some(dir);
        while let Some(p) = cursor {
            if p == workspace_root || fs.exists(p) {
                break;
            }
            missing.push(p.to_path_buf());
            cursor = p.parent();
        }

        // Deepest ancestor was collected first; create top-down.
        for p in missing.into_iter().rev() {
            fs.create_dir_all(&p)
                .map_err(|e| anyhow::Error::new(e).context(format!("create dir {}", p.display())))?;
            if created_dirs.insert(p.clone()) {
                ctx.rollback.register_created_dir(&p);
            }
        }
        Ok(())
    }

    /// Kind-dispatched handler: mutate the filesystem, then register the
    /// matching compensation. Exhaustive over every operation kind.
    fn execute_operation(
        &self,
        ctx: &mut BatchContext<'_>,
        op: &FileOperation,
        workspace_root: &Path,
        backup_map: &HashMap<PathBuf, PathBuf>,
        created_dirs: &mut HashSet<PathBuf>,
    ) -> ApplyOutcome {
        let fs = self.fs();
        let abs = workspace_root.join(&op.path);

        match op.kind {
            OperationKind::Create | OperationKind::Modify => {
                let Some(content) = &op.content else {
                    return ApplyOutcome::failed(
                        abs,
                        FailureKind::ValidationFailed,
                        "operation carries no content",
                    );
                };

                let existed = fs.exists(&abs);
                if let Err(e) = fs.write(&abs, content) {
                    return ApplyOutcome::failed(
                        abs.clone(),
                        classify_io_error(&e),
                        format!("write {}: {e}", abs.display()),
                    );
                }

                // Pre-existing targets were snapshotted in the backup phase;
                // rollback restores the snapshot.
                match (existed, backup_map.get(&abs)) {
                    (true, Some(backup)) => ctx.rollback.register_modified_file(&abs, backup),
                    (true, None) => {
                        tracing::warn!(path = %abs.display(), "overwrote file with no backup");
                        ctx.rollback.register_created_file(&abs);
                    }
                    (false, _) => ctx.rollback.register_created_file(&abs),
                }

                ApplyOutcome::applied_untracked(abs)
            }

            OperationKind::Delete => {
                if !fs.exists(&abs) {
                    return ApplyOutcome::skipped(abs, "already absent");
                }
                if let Err(e) = fs.remove_file(&abs) {
                    return ApplyOutcome::failed(
                        abs.clone(),
                        classify_io_error(&e),
                        format!("delete {}: {e}", abs.display()),
                    );
                }
                match backup_map.get(&abs) {
                    Some(backup) => ctx.rollback.register_deleted_file(&abs, backup),
                    None => {
                        tracing::warn!(path = %abs.display(), "deleted file had no backup")
                    }
                }
                ApplyOutcome::applied_untracked(abs)
            }

            OperationKind::Rename | OperationKind::Move => {
                let Some(new_rel) = &op.new_path else {
                    return ApplyOutcome::failed(
                        abs,
                        FailureKind::ValidationFailed,
                        "rename/move without a destination path",
                    );
                };
                let new_abs = workspace_root.join(new_rel);

                if !fs.exists(&abs) {
                    return ApplyOutcome::failed(
                        abs.clone(),
                        FailureKind::ValidationFailed,
                        format!("source does not exist: {}", abs.display()),
                    );
                }
                if fs.exists(&new_abs) {
                    return ApplyOutcome::failed(
                        new_abs.clone(),
                        FailureKind::ValidationFailed,
                        format!("destination already exists: {}", new_abs.display()),
                    );
                }
                if let Err(e) = fs.rename(&abs, &new_abs) {
                    return ApplyOutcome::failed(
                        abs.clone(),
                        classify_io_error(&e),
                        format!("rename {} -> {}: {e}", abs.display(), new_abs.display()),
                    );
                }
                ctx.rollback.register_renamed_file(&abs, &new_abs);
                ApplyOutcome::applied_untracked(new_abs)
            }

            OperationKind::CreateDirectory => {
                if fs.is_dir(&abs) {
                    return ApplyOutcome::applied_untracked(abs);
                }
                if let Err(e) = fs.create_dir_all(&abs) {
                    return ApplyOutcome::failed(
                        abs.clone(),
                        classify_io_error(&e),
                        format!("create dir {}: {e}", abs.display()),
                    );
                }
                if created_dirs.insert(abs.clone()) {
                    ctx.rollback.register_created_dir(&abs);
                }
                ApplyOutcome::applied_untracked(abs)
            }
        }
    }
}
