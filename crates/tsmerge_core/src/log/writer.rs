//! Compaction log writer.

use crate::error::{CoreError, CoreResult};
use crate::identifier::FileIdentifier;
use crate::log::record::LogRecord;
use std::fmt;
use std::path::{Path, PathBuf};
use tsmerge_storage::{FileSystem, StorageBackend};

/// Appends SOURCE and TARGET records to one compaction log.
///
/// Each record is written with a single backend append, so a crash can tear
/// at most the last record.
pub struct CompactionLogWriter {
    path: PathBuf,
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
}

impl CompactionLogWriter {
    /// Creates the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the file cannot be created.
    pub fn create(fs: &dyn FileSystem, path: &Path, sync_on_write: bool) -> CoreResult<Self> {
        let backend = fs
            .open_backend(path)
            .map_err(|e| CoreError::mutation("create", path, e))?;
        Ok(Self::with_backend(path.to_path_buf(), backend, sync_on_write))
    }

    /// Wraps an already opened backend.
    #[must_use]
    pub fn with_backend(
        path: PathBuf,
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> Self {
        Self {
            path,
            backend,
            sync_on_write,
        }
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logs every source, in order.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if an append fails.
    pub fn log_sources(&mut self, sources: &[FileIdentifier]) -> CoreResult<()> {
        for source in sources {
            self.append(&LogRecord::source(source.clone()))?;
        }
        Ok(())
    }

    /// Logs the target.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the append fails.
    pub fn log_target(&mut self, target: &FileIdentifier) -> CoreResult<()> {
        self.append(&LogRecord::target(target.clone()))
    }

    /// Appends one record. Returns nothing; the offset is not useful to callers.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the append or sync fails.
    pub fn append(&mut self, record: &LogRecord) -> CoreResult<()> {
        let data = record.encode()?;
        self.backend
            .append(&data)
            .map_err(|e| CoreError::mutation("append", &self.path, e))?;
        if self.sync_on_write {
            self.backend
                .sync()
                .map_err(|e| CoreError::mutation("sync", &self.path, e))?;
        }
        Ok(())
    }

    /// Flushes and syncs the log, then releases the file handle.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the final sync fails.
    pub fn close(mut self) -> CoreResult<()> {
        self.backend
            .sync()
            .map_err(|e| CoreError::mutation("sync", &self.path, e))
    }
}

impl fmt::Debug for CompactionLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionLogWriter")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::analyzer::parse_current;
    use crate::types::{RegistryKey, SequenceClass};
    use tsmerge_storage::InMemoryBackend;

    #[test]
    fn writes_sources_then_target() {
        let key = RegistryKey::new("root.sg", "0", 0, SequenceClass::Sequence);
        let s1 = FileIdentifier::new(&key, "1-1-0-0.tsfile");
        let s2 = FileIdentifier::new(&key, "2-2-0-0.tsfile");
        let t = FileIdentifier::new(&key, "1-1-1-0.tsfile.target");

        let memory = InMemoryBackend::new();
        let mut writer = CompactionLogWriter::with_backend(
            PathBuf::from("x.inner-compaction.log"),
            Box::new(memory.clone()),
            true,
        );
        writer.log_sources(&[s1.clone(), s2.clone()]).unwrap();
        writer.log_target(&t).unwrap();
        writer.close().unwrap();

        let parsed = parse_current(&memory.data());
        assert_eq!(parsed.sources, vec![s1, s2]);
        assert_eq!(parsed.targets, vec![t]);
        assert!(!parsed.truncated);
    }
}
