//! The filesystem seam used by compaction and recovery.
//!
//! Every probe and mutation performed against data files, sidecars, ledgers
//! and compaction logs goes through [`FileSystem`]. Production code uses
//! [`OsFileSystem`]; tests wrap it to inject failures at chosen paths.
//!
//! ## Durability
//!
//! Mutations that change directory entries (create, rename, remove) sync the
//! parent directory before returning, so a successful return means the new
//! name (or its absence) survives power loss.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Filesystem operations needed by the compaction engine.
///
/// # Invariants
///
/// - `remove_if_exists` is idempotent: an absent path is `Ok(false)`, any
///   other failure is an error and never swallowed
/// - `read` returns `Ok(None)` for an absent path
/// - `list_dir` returns an empty list for an absent directory
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Returns whether `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Reads the whole file, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for any I/O failure other than "not found".
    fn read(&self, path: &Path) -> StorageResult<Option<Vec<u8>>>;

    /// Returns the length of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns `MissingPath` if the file does not exist.
    fn file_len(&self, path: &Path) -> StorageResult<u64>;

    /// Creates or truncates `path`, writes `data` and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Replaces `path` with `data` via write-temp, sync, rename.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the temp file is removed.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Appends `data` to `path`, creating it if missing, and syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Renames `from` to `to` and syncs the destination directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Removes a file if it exists, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove_if_exists(&self, path: &Path) -> StorageResult<bool>;

    /// Creates a directory and all of its parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Lists the entries of a directory, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    fn list_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Opens an append-only backend at `path`, creating parents if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    fn open_backend(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;
}

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl OsFileSystem {
    /// Creates a new OS filesystem handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Syncs the directory containing `path` so entry changes are durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> StorageResult<()> {
    // NTFS journals metadata; directory handles cannot be fsynced.
    Ok(())
}

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn file_len(&self, path: &Path) -> StorageResult<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::MissingPath(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut file = File::create(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        sync_parent_dir(path)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let written = (|| -> StorageResult<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written.and_then(|()| self.rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let created = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        if created {
            sync_parent_dir(path)?;
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        fs::rename(from, to)?;
        if from.parent() != to.parent() {
            sync_parent_dir(from)?;
        }
        sync_parent_dir(to)
    }

    fn remove_if_exists(&self, path: &Path) -> StorageResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                sync_parent_dir(path)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn open_backend(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_with_create_dirs(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tsfile");
        std::fs::write(&path, b"x").unwrap();

        let fs = OsFileSystem::new();
        assert!(fs.remove_if_exists(&path).unwrap());
        assert!(!fs.remove_if_exists(&path).unwrap());
        assert!(!fs.exists(&path));
    }

    #[test]
    fn remove_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        assert!(OsFileSystem.remove_if_exists(&sub).is_err());
    }

    #[test]
    fn read_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(OsFileSystem.read(&dir.path().join("nope")).unwrap().is_none());
        assert!(matches!(
            OsFileSystem.file_len(&dir.path().join("nope")),
            Err(StorageError::MissingPath(_))
        ));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tsfile.resource");
        let fs = OsFileSystem;

        fs.write_atomic(&path, b"first").unwrap();
        fs.write_atomic(&path, b"second").unwrap();

        assert_eq!(fs.read(&path).unwrap().unwrap(), b"second");
        assert!(!dir.path().join("a.tsfile.resource.tmp").exists());
    }

    #[test]
    fn append_creates_then_extends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tsfile.mods");
        let fs = OsFileSystem;

        fs.append(&path, b"one\n").unwrap();
        fs.append(&path, b"two\n").unwrap();

        assert_eq!(fs.read(&path).unwrap().unwrap(), b"one\ntwo\n");
        assert_eq!(fs.file_len(&path).unwrap(), 8);
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("t.tsfile.target");
        let to = dir.path().join("t.tsfile");
        std::fs::write(&from, b"data").unwrap();

        OsFileSystem.rename(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"data");
    }

    #[test]
    fn list_dir_sorted_and_missing_is_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let listed = OsFileSystem.list_dir(dir.path()).unwrap();
        assert_eq!(listed, vec![dir.path().join("a"), dir.path().join("b")]);
        assert!(OsFileSystem
            .list_dir(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn open_backend_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p").join("x.log");

        let mut backend = OsFileSystem.open_backend(&path).unwrap();
        backend.append(b"rec").unwrap();
        backend.sync().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"rec");
    }
}
