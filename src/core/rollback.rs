//! Compensating rollback for one in-flight batch.
//!
//! Every mutation the batch performs registers its compensation here.
//! `rollback` replays them newest-first and is strictly best-effort: a
//! failed compensation is logged and folded into the overall flag, never
//! allowed to stop the remaining ones. `commit` closes the transaction and
//! makes the batch permanent.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::backup::BackupStore;
use crate::infra::fsx::Filesystem;

/// A single compensating step, recorded at mutation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RollbackAction {
    DeleteCreatedFile { path: PathBuf },
    RestoreModifiedFile { path: PathBuf, backup_path: PathBuf },
    DeleteCreatedDirectory { path: PathBuf },
    RestoreDeletedFile { path: PathBuf, backup_path: PathBuf },
    UndoRename { old_path: PathBuf, new_path: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
struct RollbackEntry {
    /// Monotonic registration order; replay happens in descending order.
    order: u64,
    action: RollbackAction,
}

/// Accumulates compensations for exactly one batch.
pub struct RollbackManager {
    fs: Arc<dyn Filesystem>,
    backups: Arc<dyn BackupStore>,
    entries: Vec<RollbackEntry>,
    next_order: u64,
    committed: bool,
}

impl RollbackManager {
    pub fn new(fs: Arc<dyn Filesystem>, backups: Arc<dyn BackupStore>) -> Self {
        Self {
            fs,
            backups,
            entries: Vec::new(),
            next_order: 0,
            committed: false,
        }
    }

    fn register(&mut self, action: RollbackAction) {
        if self.committed {
            tracing::warn!(?action, "registration after commit ignored");
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.entries.push(RollbackEntry { order, action });
    }

    pub fn register_created_file(&mut self, path: &Path) {
        self.register(RollbackAction::DeleteCreatedFile {
            path: path.to_path_buf(),
        });
    }

    pub fn register_created_dir(&mut self, path: &Path) {
        self.register(RollbackAction::DeleteCreatedDirectory {
            path: path.to_path_buf(),
        });
    }

    pub fn register_modified_file(&mut self, path: &Path, backup_path: &Path) {
        self.register(RollbackAction::RestoreModifiedFile {
            path: path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
        });
    }

    pub fn register_deleted_file(&mut self, path: &Path, backup_path: &Path) {
        self.register(RollbackAction::RestoreDeletedFile {
            path: path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
        });
    }

    pub fn register_renamed_file(&mut self, old_path: &Path, new_path: &Path) {
        self.register(RollbackAction::UndoRename {
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
        });
    }

    pub fn action_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Close the transaction: discard all compensations. After this the
    /// batch's mutations are permanent and `rollback` does nothing.
    pub fn commit(&mut self) {
        tracing::debug!(actions = self.entries.len(), "rollback committed");
        self.entries.clear();
        self.committed = true;
    }

    /// Replay every registered compensation in reverse registration order.
    /// Returns whether all of them succeeded. Never early-exits.
    pub fn rollback(&mut self) -> bool {
        if self.committed {
            return false;
        }

        // Registration pushes in ascending order; replay descending.
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by(|a, b| b.order.cmp(&a.order));

        let mut all_ok = true;
        for entry in &entries {
            if let Err(err) = self.compensate(&entry.action) {
                tracing::warn!(
                    order = entry.order,
                    action = ?entry.action,
                    error = %err,
                    "compensation failed"
                );
                all_ok = false;
            }
        }

        tracing::info!(
            actions = entries.len(),
            complete = all_ok,
            "rollback finished"
        );
        all_ok
    }

    fn compensate(&self, action: &RollbackAction) -> anyhow::Result<()> {
        match action {
            RollbackAction::DeleteCreatedFile { path } => {
                if self.fs.exists(path) {
                    self.fs.remove_file(path)?;
                }
                Ok(())
            }
            RollbackAction::RestoreModifiedFile { path, backup_path }
            | RollbackAction::RestoreDeletedFile { path, backup_path } => {
                if self.backups.restore_backup(backup_path, path)? {
                    Ok(())
                } else {
                    anyhow::bail!("backup missing: {}", backup_path.display())
                }
            }
            RollbackAction::DeleteCreatedDirectory { path } => {
                if !self.fs.exists(path) {
                    return Ok(());
                }
                match self.fs.remove_dir(path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                        // Never force-delete user content that appeared in a
                        // directory we created.
                        tracing::warn!(dir = %path.display(), "created directory no longer empty, leaving in place");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            RollbackAction::UndoRename { old_path, new_path } => {
                if self.fs.exists(new_path) && !self.fs.exists(old_path) {
                    self.fs.rename(new_path, old_path)?;
                    Ok(())
                } else {
                    anyhow::bail!(
                        "cannot reverse rename {} -> {}: state changed underneath",
                        old_path.display(),
                        new_path.display()
                    )
                }
            }
        }
    }
}
