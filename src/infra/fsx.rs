//! Filesystem collaborator seam.
//!
//! The engine never calls `std::fs` directly for mutation; everything goes
//! through [`Filesystem`] so tests can substitute failing or recording
//! implementations. [`LocalFs`] is the production implementation and keeps
//! writes atomic via the same-directory tempfile strategy in `infra::io`.

use std::fs;
use std::io;
use std::path::Path;

use crate::infra::io::{read_file_smart, write_atomic};

/// Narrow filesystem interface used by the apply and batch services.
///
/// All methods are blocking; errors are raw `std::io::Error` values that the
/// service layer classifies into its failure taxonomy.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Write the full contents of `path`, atomically replacing any previous
    /// content.
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory. Fails if the directory is not empty; callers rely
    /// on that to avoid deleting user content.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
}

/// Production filesystem backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl Filesystem for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        // Large files take the mmap path.
        match read_file_smart(path) {
            Ok(content) => Ok(content.as_ref().to_string()),
            Err(e) => Err(e
                .downcast::<io::Error>()
                .unwrap_or_else(io::Error::other)),
        }
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        write_atomic(path, contents.as_bytes())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_fs_round_trip() {
        let tmp = TempDir::new().unwrap();
        let fs = LocalFs;
        let file = tmp.path().join("x.txt");

        assert!(!fs.exists(&file));
        fs.write(&file, "abc").unwrap();
        assert!(fs.exists(&file));
        assert_eq!(fs.read_to_string(&file).unwrap(), "abc");

        let moved = tmp.path().join("y.txt");
        fs.rename(&file, &moved).unwrap();
        assert!(!fs.exists(&file));
        assert!(fs.exists(&moved));

        fs.remove_file(&moved).unwrap();
        assert!(!fs.exists(&moved));
    }

    #[test]
    fn remove_dir_refuses_non_empty() {
        let tmp = TempDir::new().unwrap();
        let fs = LocalFs;
        let dir = tmp.path().join("d");
        fs.create_dir_all(&dir).unwrap();
        fs.write(&dir.join("inner.txt"), "keep me").unwrap();

        assert!(fs.remove_dir(&dir).is_err());
        assert!(fs.exists(&dir.join("inner.txt")));
    }
}
