//! Session-scoped backup store.
//!
//! Snapshots live under `<workspace>/.patchup/backups/<ID>/`, mirroring the
//! workspace tree, with a `manifest.json` carrying blake3 checksums and a
//! DONE marker for crash safety. Backup paths stay stable for the lifetime
//! of the session so undo and rollback can restore from them at any point.

use anyhow::{Context, Result, bail};
use blake3::Hasher as Blake3;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::infra::io::{sync_dir, write_atomic};

/// Snapshot-and-restore interface consumed by the apply and rollback
/// layers. Implementations must keep returned backup paths readable until
/// the store is dropped.
pub trait BackupStore: Send + Sync {
    /// Snapshot `path` and return the location of the copy.
    fn create_backup(&self, path: &Path) -> Result<PathBuf>;

    /// Copy a backup over `target`. Returns false when the backup no longer
    /// exists (restore is best-effort for callers compensating failures).
    fn restore_backup(&self, backup_path: &Path, target: &Path) -> Result<bool>;
}

/// Per-file metadata recorded in the session manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBackupMeta {
    pub original_path: PathBuf,
    pub rel_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: Option<String>, // blake3:<hex>
}

/// Manifest describing a completed or in-progress session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub id: String,
    pub timestamp: String, // RFC3339 creation time
    pub operation: String, // e.g., "apply", "batch"
    pub success: bool,     // set on finalize
    pub last_updated: String,
    pub files: Vec<FileBackupMeta>,
}

struct SessionState {
    manifest: SessionManifest,
    finalized: bool,
}

/// One backup session rooted in the workspace.
pub struct SessionBackups {
    workspace_root: PathBuf,
    session_dir: PathBuf,
    state: Mutex<SessionState>,
}

impl SessionBackups {
    /// Start a new session under `<workspace>/<backup_dir>/<ID>`.
    pub fn begin(workspace_root: &Path, backup_dir: &str, operation: &str) -> Result<Self> {
        let sessions_dir = workspace_root.join(backup_dir);
        fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("create backups dir: {}", sessions_dir.display()))?;

        let session_id = generate_session_id();
        let session_dir = sessions_dir.join(&session_id);
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("create session dir: {}", session_dir.display()))?;

        let now = Utc::now().to_rfc3339();
        let manifest = SessionManifest {
            id: session_id,
            timestamp: now.clone(),
            operation: operation.into(),
            success: false,
            last_updated: now,
            files: Vec::new(),
        };

        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            session_dir,
            state: Mutex::new(SessionState {
                manifest,
                finalized: false,
            }),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().expect("backup state lock").manifest.files.len()
    }

    /// Write the manifest and DONE marker; idempotent.
    pub fn finalize(&self, success: bool) -> Result<()> {
        let mut state = self.state.lock().expect("backup state lock");
        if state.finalized {
            return Ok(());
        }

        state.manifest.success = success;
        state.manifest.last_updated = Utc::now().to_rfc3339();

        let manifest_path = self.session_dir.join("manifest.json");
        let manifest_text =
            serde_json::to_string_pretty(&state.manifest).context("serialize manifest")?;
        write_atomic(&manifest_path, manifest_text.as_bytes())
            .with_context(|| format!("write manifest: {}", manifest_path.display()))?;

        let done_path = self.session_dir.join("DONE");
        fs::write(&done_path, "")
            .with_context(|| format!("create DONE: {}", done_path.display()))?;
        File::open(&done_path)?.sync_all().ok();
        let _ = sync_dir(&self.session_dir);

        state.finalized = true;
        Ok(())
    }

    /// Workspace-relative mirror location for a target, with a flat
    /// fallback for targets outside the workspace.
    fn mirror_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.workspace_root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => PathBuf::from("_external").join(path.file_name().unwrap_or_default()),
        }
    }
}

impl BackupStore for SessionBackups {
    fn create_backup(&self, path: &Path) -> Result<PathBuf> {
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("stat source: {}", path.display()))?;
        if !meta.file_type().is_file() {
            bail!("unsupported file type for backup: {}", path.display());
        }

        let rel = self.mirror_path(path);
        let backup_path = self.session_dir.join(&rel);
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create backup parent: {}", parent.display()))?;
        }

        fs::copy(path, &backup_path)
            .with_context(|| format!("copy file to backup: {}", backup_path.display()))?;

        let size_bytes = fs::metadata(&backup_path)
            .with_context(|| format!("stat backup: {}", backup_path.display()))?
            .len();
        let checksum = Some(stream_blake3(&backup_path)?);

        let mut state = self.state.lock().expect("backup state lock");
        state.manifest.files.push(FileBackupMeta {
            original_path: path.to_path_buf(),
            rel_path: rel,
            size_bytes,
            checksum,
        });
        state.manifest.last_updated = Utc::now().to_rfc3339();

        tracing::debug!(target = %path.display(), backup = %backup_path.display(), "backed up");
        Ok(backup_path)
    }

    fn restore_backup(&self, backup_path: &Path, target: &Path) -> Result<bool> {
        if !backup_path.exists() {
            tracing::warn!(backup = %backup_path.display(), "backup missing, cannot restore");
            return Ok(false);
        }

        // Verify the snapshot against its recorded checksum before trusting
        // it; a corrupt backup is surfaced, not silently restored.
        let recorded = {
            let state = self.state.lock().expect("backup state lock");
            state
                .manifest
                .files
                .iter()
                .find(|f| self.session_dir.join(&f.rel_path) == backup_path)
                .and_then(|f| f.checksum.clone())
        };
        if let Some(expected) = recorded {
            let actual = stream_blake3(backup_path)?;
            if actual != expected {
                bail!(
                    "backup checksum mismatch for {}: expected {}, got {}",
                    backup_path.display(),
                    expected,
                    actual
                );
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create restore parent: {}", parent.display()))?;
        }
        fs::copy(backup_path, target)
            .with_context(|| format!("restore {} -> {}", backup_path.display(), target.display()))?;

        tracing::debug!(target = %target.display(), "restored from backup");
        Ok(true)
    }
}

impl Drop for SessionBackups {
    fn drop(&mut self) {
        let finalized = self
            .state
            .lock()
            .map(|s| s.finalized)
            .unwrap_or(true);
        if !finalized {
            let _ = self.finalize(false); // best-effort failure finalize
        }
    }
}

/// Generate a sortable, filesystem-safe session ID.
fn generate_session_id() -> String {
    let ts = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let alphabet = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..10)
        .map(|_| {
            let idx = rng.random_range(0..alphabet.len());
            alphabet[idx] as char
        })
        .collect();
    format!("{ts}_{suffix}")
}

/// Stream a file into a blake3 digest as `blake3:<hex>`.
fn stream_blake3(path: &Path) -> Result<String> {
    let mut f =
        File::open(path).with_context(|| format!("open for checksum: {}", path.display()))?;
    let mut hasher = Blake3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Load a session manifest; requires the DONE marker to be present.
pub fn read_session_manifest(session_dir: &Path) -> Result<SessionManifest> {
    let done = session_dir.join("DONE");
    if !done.exists() {
        bail!("session {} is incomplete (missing DONE)", session_dir.display());
    }
    let manifest_path = session_dir.join("manifest.json");
    let s = fs::read_to_string(&manifest_path)
        .with_context(|| format!("read manifest: {}", manifest_path.display()))?;
    let m: SessionManifest = serde_json::from_str(&s)
        .with_context(|| format!("parse manifest: {}", manifest_path.display()))?;
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backup_mirrors_workspace_tree() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path();
        fs::create_dir_all(ws.join("src/core")).unwrap();
        fs::write(ws.join("src/core/x.rs"), "fn main(){}").unwrap();

        let store = SessionBackups::begin(ws, ".patchup/backups", "apply").unwrap();
        let backup = store.create_backup(&ws.join("src/core/x.rs")).unwrap();

        assert!(backup.ends_with("src/core/x.rs"));
        assert_eq!(fs::read_to_string(&backup).unwrap(), "fn main(){}");
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn restore_round_trip() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path();
        let target = ws.join("file.txt");
        fs::write(&target, "original").unwrap();

        let store = SessionBackups::begin(ws, ".patchup/backups", "apply").unwrap();
        let backup = store.create_backup(&target).unwrap();

        fs::write(&target, "mutated").unwrap();
        assert!(store.restore_backup(&backup, &target).unwrap());
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
    }

    #[test]
    fn restore_of_missing_backup_reports_false() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path();
        let store = SessionBackups::begin(ws, ".patchup/backups", "apply").unwrap();

        let restored = store
            .restore_backup(&ws.join("no-such-backup"), &ws.join("t.txt"))
            .unwrap();
        assert!(!restored);
    }

    #[test]
    fn finalize_writes_manifest_and_done() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path();
        fs::write(ws.join("a.txt"), "a").unwrap();

        let store = SessionBackups::begin(ws, ".patchup/backups", "batch").unwrap();
        store.create_backup(&ws.join("a.txt")).unwrap();
        store.finalize(true).unwrap();

        let manifest = read_session_manifest(store.session_dir()).unwrap();
        assert!(manifest.success);
        assert_eq!(manifest.files.len(), 1);
        assert!(manifest.files[0]
            .checksum
            .as_deref()
            .unwrap()
            .starts_with("blake3:"));
    }

    #[test]
    fn corrupted_backup_fails_restore() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path();
        let target = ws.join("file.txt");
        fs::write(&target, "original").unwrap();

        let store = SessionBackups::begin(ws, ".patchup/backups", "apply").unwrap();
        let backup = store.create_backup(&target).unwrap();

        // Corrupt the snapshot behind the store's back.
        fs::write(&backup, "tampered").unwrap();
        assert!(store.restore_backup(&backup, &target).is_err());
    }
}
