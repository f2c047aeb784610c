//! Filesystem wrapper with targeted fault injection.
//!
//! [`FaultyFileSystem`] forwards to [`OsFileSystem`] but fails chosen
//! operations on paths whose file name contains a pattern. Rules are shared
//! through a handle, so a test can arm a fault, run recovery, disarm it and
//! run recovery again.

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tsmerge_storage::{FileSystem, OsFileSystem, StorageBackend, StorageError, StorageResult};

/// Filesystem operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    /// [`FileSystem::read`] and [`FileSystem::file_len`].
    Read,
    /// [`FileSystem::write`] and [`FileSystem::write_atomic`].
    Write,
    /// [`FileSystem::append`].
    Append,
    /// [`FileSystem::rename`], matched on the source path.
    Rename,
    /// [`FileSystem::remove_if_exists`].
    Remove,
    /// [`FileSystem::list_dir`].
    List,
    /// [`FileSystem::open_backend`].
    OpenBackend,
}

/// Fails `op` on every path whose file name contains `pattern`.
#[derive(Debug, Clone)]
pub struct FaultRule {
    /// Operation to fail.
    pub op: FsOp,
    /// Substring matched against the file name.
    pub pattern: String,
    /// Remaining failures; `None` fails forever.
    pub remaining: Option<usize>,
}

/// Shared fault configuration and counters.
#[derive(Debug, Default)]
pub struct FaultConfig {
    rules: Vec<FaultRule>,
    /// Number of injected failures so far.
    pub injected: usize,
    /// Paths passed to `remove_if_exists`, in call order.
    pub removed: Vec<PathBuf>,
}

impl FaultConfig {
    /// Adds a rule that fails forever.
    pub fn fail(&mut self, op: FsOp, pattern: impl Into<String>) {
        self.rules.push(FaultRule {
            op,
            pattern: pattern.into(),
            remaining: None,
        });
    }

    /// Adds a rule that fails `times` times, then passes.
    pub fn fail_times(&mut self, op: FsOp, pattern: impl Into<String>, times: usize) {
        self.rules.push(FaultRule {
            op,
            pattern: pattern.into(),
            remaining: Some(times),
        });
    }

    /// Removes every rule.
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    fn should_fail(&mut self, op: FsOp, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hit = self.rules.iter_mut().find(|r| {
            r.op == op && name.contains(&r.pattern) && r.remaining.map_or(true, |n| n > 0)
        });
        match hit {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                self.injected += 1;
                true
            }
            None => false,
        }
    }
}

/// An [`OsFileSystem`] that fails on demand.
#[derive(Debug, Default)]
pub struct FaultyFileSystem {
    inner: OsFileSystem,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl FaultyFileSystem {
    /// Creates a wrapper with no faults armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared fault configuration, for arming rules and reading counters.
    pub fn cfg(&self) -> Arc<Mutex<FaultConfig>> {
        Arc::clone(&self.cfg)
    }

    fn check(&self, op: FsOp, path: &Path) -> StorageResult<()> {
        if self.cfg.lock().should_fail(op, path) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {op:?} failure on {}", path.display()),
            )));
        }
        Ok(())
    }
}

impl FileSystem for FaultyFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn read(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        self.check(FsOp::Read, path)?;
        self.inner.read(path)
    }

    fn file_len(&self, path: &Path) -> StorageResult<u64> {
        self.check(FsOp::Read, path)?;
        self.inner.file_len(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.check(FsOp::Write, path)?;
        self.inner.write(path, data)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.check(FsOp::Write, path)?;
        self.inner.write_atomic(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.check(FsOp::Append, path)?;
        self.inner.append(path, data)
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.check(FsOp::Rename, from)?;
        self.inner.rename(from, to)
    }

    fn remove_if_exists(&self, path: &Path) -> StorageResult<bool> {
        self.cfg.lock().removed.push(path.to_path_buf());
        self.check(FsOp::Remove, path)?;
        self.inner.remove_if_exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        self.check(FsOp::List, path)?;
        self.inner.list_dir(path)
    }

    fn open_backend(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        self.check(FsOp::OpenBackend, path)?;
        self.inner.open_backend(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rule_matches_file_name() {
        let dir = tempdir().unwrap();
        let fs = FaultyFileSystem::new();
        fs.cfg().lock().fail(FsOp::Write, ".resource");

        assert!(fs.write(&dir.path().join("a.tsfile"), b"x").is_ok());
        assert!(fs.write(&dir.path().join("a.tsfile.resource"), b"x").is_err());
        assert_eq!(fs.cfg().lock().injected, 1);
    }

    #[test]
    fn limited_rule_expires() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tsfile");
        std::fs::write(&path, b"x").unwrap();
        let fs = FaultyFileSystem::new();
        fs.cfg().lock().fail_times(FsOp::Remove, "a.tsfile", 1);

        assert!(fs.remove_if_exists(&path).is_err());
        assert!(path.exists());
        assert!(fs.remove_if_exists(&path).unwrap());
        assert_eq!(fs.cfg().lock().removed.len(), 2);
    }

    #[test]
    fn clear_disarms() {
        let dir = tempdir().unwrap();
        let fs = FaultyFileSystem::new();
        let cfg = fs.cfg();
        cfg.lock().fail(FsOp::Append, "log");
        assert!(fs.append(&dir.path().join("x.log"), b"a").is_err());
        cfg.lock().clear();
        assert!(fs.append(&dir.path().join("x.log"), b"a").is_ok());
    }
}
