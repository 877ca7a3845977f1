//! **patchup** - Transactional diff-and-apply engine for assistant-proposed workspace edits
//!
//! Computes line-level diffs for proposed code blocks, applies single-file
//! or batched multi-file changes with conflict detection, and guarantees a
//! failed or cancelled batch lands back in the pre-apply state via
//! compensating rollback. A library with no UI or CLI surface: hosts drive
//! it and observe typed progress/change events.

/// Core engine - diffing, applying, history, backups, rollback
pub mod core {
    /// Line diff engine with hunk grouping and code-block resolution
    pub mod diff;
    pub use self::diff::{
        CodeBlock, DiffError, DiffHunk, DiffLine, DiffLineKind, DiffOptions, DiffResult,
        DiffStats, compute_diff, delete_file_diff, diff_for_block, merged_diff, new_file_diff,
        render_unified, splice_lines,
    };

    /// Per-path capacity-bounded change history with an undo window
    pub mod history;
    pub use self::history::{ChangeHistory, ChangeKind, ContentId, FileChangeRecord, content_id};

    /// Session-scoped backup store with blake3 manifests
    pub mod backup;
    pub use self::backup::{BackupStore, SessionBackups, SessionManifest, read_session_manifest};

    /// LIFO compensating rollback for one in-flight batch
    pub mod rollback;
    pub use self::rollback::{RollbackAction, RollbackManager};

    /// Single-file apply service: conflict check, backup, write, undo
    pub mod apply;
    pub use self::apply::{
        ApplyOptions, ApplyOutcome, ApplyService, ApplyStatus, ConflictState, FailureKind,
        classify_io_error,
    };

    /// Batch proposal service: validation, phase machine, finalize-or-rollback
    pub mod batch;
    pub use self::batch::{
        BatchApplyResult, BatchOptions, BatchService, FileOperation, FileTreeProposal,
        OperationKind, ProposalStatus, Severity, ValidationIssue, ValidationReport,
    };

    /// Progress snapshots, typed change events, cancellation
    pub mod progress;
    pub use self::progress::{
        ApplyEvent, BatchPhase, BatchProgress, CancelToken, ChannelSink, EventBus, NullSink,
        ProgressSink,
    };
}

/// Infrastructure - configuration, filesystem seam, IO, matching, watching
pub mod infra {
    /// Layered engine configuration (patchup.toml + PATCHUP_* env)
    pub mod config;
    pub use self::config::{EngineConfig, init as config_init, load_config};

    /// Filesystem collaborator trait and the local implementation
    pub mod fsx;
    pub use self::fsx::{Filesystem, LocalFs};

    /// Smart reads, atomic writes, line-ending helpers
    pub mod io;
    pub use self::io::{FileContent, LineEnding, read_file_smart, write_atomic};

    /// Gitignore-style ignore matching with last-match-wins
    pub mod ignore;
    pub use self::ignore::IgnoreMatcher;

    /// Debounced recursive directory watching
    pub mod watch;
    pub use self::watch::{WatchEvent, WorkspaceWatcher};

    /// Gitignore-aware workspace walking
    pub mod walk;
    pub use self::walk::WorkspaceWalker;
}

// Strategic re-exports for host applications
pub use crate::core::{
    ApplyEvent, ApplyOptions, ApplyOutcome, ApplyService, ApplyStatus, BatchApplyResult,
    BatchOptions, BatchPhase, BatchProgress, BatchService, CancelToken, CodeBlock, ConflictState,
    DiffOptions, DiffResult, FailureKind, FileOperation, FileTreeProposal, OperationKind,
    ProgressSink, ProposalStatus,
};
pub use crate::infra::{
    EngineConfig, Filesystem, IgnoreMatcher, LocalFs, WorkspaceWalker, WorkspaceWatcher,
    load_config,
};
