//! Integration tests for batch apply, compensating rollback, and
//! cancellation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;

use patchup::core::apply::ApplyService;
use patchup::core::backup::{BackupStore, SessionBackups};
use patchup::core::batch::{
    BatchOptions, BatchService, FileOperation, FileTreeProposal, OperationKind, ProposalStatus,
};
use patchup::core::progress::{BatchPhase, BatchProgress, CancelToken, NullSink, ProgressSink};
use patchup::core::rollback::RollbackManager;
use patchup::infra::config::EngineConfig;
use patchup::infra::fsx::{Filesystem, LocalFs};

/// Opt-in log output for debugging: `RUST_LOG=patchup=debug cargo test`.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn batch_service(ws: &Path) -> BatchService {
    batch_service_with_fs(ws, Arc::new(LocalFs))
}

fn batch_service_with_fs(ws: &Path, fs: Arc<dyn Filesystem>) -> BatchService {
    let config = EngineConfig::default();
    let backups: Arc<dyn BackupStore> =
        Arc::new(SessionBackups::begin(ws, &config.backup_dir, "batch").unwrap());
    let apply = Arc::new(ApplyService::new(Arc::clone(&fs), Arc::clone(&backups), &config));
    BatchService::new(apply, backups)
}

fn create_op(path: &str, content: &str, order: u32) -> FileOperation {
    FileOperation {
        kind: OperationKind::Create,
        path: PathBuf::from(path),
        content: Some(content.into()),
        new_path: None,
        order,
        selected: true,
    }
}

/// Filesystem that rejects writes to one path with PermissionDenied.
struct DenyingFs {
    inner: LocalFs,
    deny: PathBuf,
}

impl Filesystem for DenyingFs {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.inner.read_to_string(path)
    }
    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        if path.ends_with(&self.deny) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected permission failure",
            ));
        }
        self.inner.write(path, contents)
    }
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        self.inner.copy(from, to)
    }
}

#[test]
fn failed_create_batch_leaves_no_files_behind() {
    init_logging();
    let ws = TempDir::new().unwrap();
    let svc = batch_service_with_fs(
        ws.path(),
        Arc::new(DenyingFs {
            inner: LocalFs,
            deny: PathBuf::from("second.txt"),
        }),
    );

    let mut proposal = FileTreeProposal::new(
        "three-creates",
        vec![
            create_op("first.txt", "1", 0),
            create_op("second.txt", "2", 1),
            create_op("third.txt", "3", 2),
        ],
    );

    let result = svc
        .apply_proposal(
            &mut proposal,
            ws.path(),
            &BatchOptions::default(),
            &NullSink,
            &CancelToken::new(),
        )
        .unwrap();

    assert!(result.was_rolled_back);
    assert!(result.rollback_complete);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(proposal.status, ProposalStatus::Rejected);

    ws.child("first.txt").assert(predicate::path::missing());
    ws.child("second.txt").assert(predicate::path::missing());
    ws.child("third.txt").assert(predicate::path::missing());
}

#[test]
fn cancellation_mid_batch_rolls_back_and_reports_both_flags() {
    let ws = TempDir::new().unwrap();
    let svc = batch_service(ws.path());

    // Request cancellation once the second write completes; the engine
    // must notice between operations and compensate everything.
    struct CancelAfterTwo {
        cancel: CancelToken,
    }
    impl ProgressSink for CancelAfterTwo {
        fn report(&self, progress: &BatchProgress) {
            if progress.phase == BatchPhase::WritingFiles && progress.completed_operations == 2 {
                self.cancel.cancel();
            }
        }
    }

    let cancel = CancelToken::new();
    let sink = CancelAfterTwo {
        cancel: cancel.clone(),
    };

    let mut proposal = FileTreeProposal::new(
        "five-creates",
        (0..5)
            .map(|i| create_op(&format!("file{i}.txt"), "content", i))
            .collect(),
    );

    let result = svc
        .apply_proposal(
            &mut proposal,
            ws.path(),
            &BatchOptions::default(),
            &sink,
            &cancel,
        )
        .unwrap();

    assert!(result.was_cancelled);
    assert!(result.was_rolled_back);
    assert!(result.rollback_complete);

    for i in 0..5 {
        ws.child(format!("file{i}.txt"))
            .assert(predicate::path::missing());
    }
}

#[test]
fn mixed_batch_round_trips_through_rollback() {
    init_logging();
    let ws = TempDir::new().unwrap();
    ws.child("keep/modify-me.txt").write_str("original").unwrap();
    ws.child("keep/delete-me.txt").write_str("bye").unwrap();
    ws.child("keep/rename-me.txt").write_str("moving").unwrap();

    let svc = batch_service_with_fs(
        ws.path(),
        Arc::new(DenyingFs {
            inner: LocalFs,
            deny: PathBuf::from("last-write.txt"),
        }),
    );

    let mut proposal = FileTreeProposal::new(
        "mixed",
        vec![
            FileOperation {
                kind: OperationKind::CreateDirectory,
                path: PathBuf::from("new-dir/nested"),
                content: None,
                new_path: None,
                order: 0,
                selected: true,
            },
            FileOperation {
                kind: OperationKind::Modify,
                path: PathBuf::from("keep/modify-me.txt"),
                content: Some("rewritten".into()),
                new_path: None,
                order: 1,
                selected: true,
            },
            FileOperation {
                kind: OperationKind::Delete,
                path: PathBuf::from("keep/delete-me.txt"),
                content: None,
                new_path: None,
                order: 2,
                selected: true,
            },
            FileOperation {
                kind: OperationKind::Rename,
                path: PathBuf::from("keep/rename-me.txt"),
                content: None,
                new_path: Some(PathBuf::from("keep/renamed.txt")),
                order: 3,
                selected: true,
            },
            create_op("last-write.txt", "never lands", 4),
        ],
    );

    let result = svc
        .apply_proposal(
            &mut proposal,
            ws.path(),
            &BatchOptions::default(),
            &NullSink,
            &CancelToken::new(),
        )
        .unwrap();

    assert!(result.was_rolled_back);
    assert!(result.rollback_complete, "{:?}", result.results);

    // Every mutation was compensated.
    ws.child("keep/modify-me.txt").assert("original");
    ws.child("keep/delete-me.txt").assert("bye");
    ws.child("keep/rename-me.txt").assert("moving");
    ws.child("keep/renamed.txt").assert(predicate::path::missing());
    ws.child("new-dir").assert(predicate::path::missing());
    ws.child("last-write.txt").assert(predicate::path::missing());
}

#[test]
fn committed_batch_cannot_be_rolled_back() {
    let ws = TempDir::new().unwrap();
    let config = EngineConfig::default();
    let fs: Arc<dyn Filesystem> = Arc::new(LocalFs);
    let backups: Arc<dyn BackupStore> =
        Arc::new(SessionBackups::begin(ws.path(), &config.backup_dir, "manual").unwrap());

    std::fs::write(ws.path().join("made.txt"), "data").unwrap();

    let mut mgr = RollbackManager::new(fs, backups);
    mgr.register_created_file(&ws.path().join("made.txt"));
    mgr.commit();

    assert!(!mgr.rollback());
    ws.child("made.txt").assert("data");
}

#[test]
fn successful_batch_reports_full_apply_and_survives() {
    let ws = TempDir::new().unwrap();
    let svc = batch_service(ws.path());

    let mut proposal = FileTreeProposal::new(
        "ok",
        vec![
            create_op("a/one.txt", "one", 0),
            create_op("a/b/two.txt", "two", 1),
        ],
    );

    let result = svc
        .apply_proposal(
            &mut proposal,
            ws.path(),
            &BatchOptions::default(),
            &NullSink,
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(result.succeeded, 2);
    assert!(!result.was_rolled_back);
    assert!(!result.was_cancelled);
    assert_eq!(proposal.status, ProposalStatus::FullyApplied);
    assert!(result.finished_at >= result.started_at);

    ws.child("a/one.txt").assert("one");
    ws.child("a/b/two.txt").assert("two");
}
