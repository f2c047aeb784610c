//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// An append-only file backend.
///
/// # Durability
///
/// - `flush()` pushes buffered bytes to the OS
/// - `sync()` calls `File::sync_all()` so the bytes survive power loss
///
/// # Example
///
/// ```no_run
/// use tsmerge_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("1-1-1-0.inner-compaction.log")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<Option<File>>,
    size: Mutex<u64>,
}

impl FileBackend {
    /// Opens or creates a file for appending.
    ///
    /// Existing content is preserved and new appends land after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            size: Mutex::new(size),
        })
    }

    /// Opens or creates a file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs and releases the file handle. Later appends fail with `Closed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> StorageResult<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;
        let mut size = self.size.lock();

        let offset = *size;
        if !data.is_empty() {
            file.write_all(data)?;
            *size += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;
        file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;
        file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_are_sequential() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.log");

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"de").unwrap(), 3);
        backend.sync().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
    }

    #[test]
    fn reopen_appends_after_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.log");
        std::fs::write(&path, b"head").unwrap();

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.append(b"tail").unwrap(), 4);
        backend.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"headtail");
    }

    #[test]
    fn closed_backend_rejects_appends() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("x.log")).unwrap();
        backend.close().unwrap();

        assert!(matches!(backend.append(b"x"), Err(StorageError::Closed)));
        assert!(matches!(backend.sync(), Err(StorageError::Closed)));
    }

    #[test]
    fn create_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("x.log");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.exists());
    }
}
