//! Storage root resolution.
//!
//! Data files live under one of several configured storage roots. A file is
//! identified by its path relative to a root; which root currently holds it
//! is discovered by probing the roots in configuration order.
//!
//! Operators must not place the same relative path under two roots. The
//! resolver relies on that but does not enforce it.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the advisory lock file kept in every storage root.
const LOCK_FILE: &str = "LOCK";

/// Ordered list of storage roots.
///
/// Resolution is a pure lookup: it never creates or mutates files.
///
/// # Example
///
/// ```rust
/// use tsmerge_storage::StorageRoots;
/// use std::path::Path;
///
/// let roots = StorageRoots::new(vec!["/data1".into(), "/data2".into()]);
/// assert_eq!(roots.len(), 2);
/// assert!(roots.resolve(Path::new("sequence/root.sg/0/0/1-1-0-0.tsfile")).is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageRoots {
    roots: Vec<PathBuf>,
}

impl StorageRoots {
    /// Creates a resolver over the given roots, searched in order.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Returns the configured roots in search order.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Returns the number of configured roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Returns true if no root is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Returns the first configured root.
    ///
    /// # Errors
    ///
    /// Returns `NoRoots` if the list is empty.
    pub fn primary(&self) -> StorageResult<&Path> {
        self.roots
            .first()
            .map(PathBuf::as_path)
            .ok_or(StorageError::NoRoots)
    }

    /// Resolves `relative` against each root, returning the first existing match.
    #[must_use]
    pub fn resolve(&self, relative: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.exists())
    }

    /// Returns `relative` joined onto every root, in search order.
    #[must_use]
    pub fn candidates(&self, relative: &Path) -> Vec<PathBuf> {
        self.roots.iter().map(|root| root.join(relative)).collect()
    }

    /// Takes an exclusive advisory lock on every root.
    ///
    /// Used by maintenance tools so they never run against roots that a live
    /// engine (or another tool) is compacting. Roots are created if missing.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process holds any of the locks.
    pub fn lock_all(&self) -> StorageResult<RootsLock> {
        let mut files = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            fs::create_dir_all(root)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(root.join(LOCK_FILE))?;
            if file.try_lock_exclusive().is_err() {
                return Err(StorageError::Locked(root.clone()));
            }
            files.push(file);
        }
        Ok(RootsLock { _files: files })
    }
}

/// Exclusive locks on a set of storage roots, released on drop.
#[derive(Debug)]
pub struct RootsLock {
    _files: Vec<File>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_existing_root_wins() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let rel = Path::new("sequence/root.sg/0/0/1-1-0-0.tsfile");
        for root in [a.path(), b.path()] {
            fs::create_dir_all(root.join(rel).parent().unwrap()).unwrap();
        }
        fs::write(b.path().join(rel), b"b").unwrap();

        let roots = StorageRoots::new(vec![a.path().into(), b.path().into()]);
        assert_eq!(roots.resolve(rel), Some(b.path().join(rel)));

        fs::write(a.path().join(rel), b"a").unwrap();
        assert_eq!(roots.resolve(rel), Some(a.path().join(rel)));
    }

    #[test]
    fn missing_everywhere_is_none() {
        let a = tempdir().unwrap();
        let roots = StorageRoots::new(vec![a.path().into()]);
        assert!(roots.resolve(Path::new("nope.tsfile")).is_none());
    }

    #[test]
    fn resolve_does_not_create() {
        let a = tempdir().unwrap();
        let roots = StorageRoots::new(vec![a.path().join("never")]);
        assert!(roots.resolve(Path::new("x")).is_none());
        assert!(!a.path().join("never").exists());
    }

    #[test]
    fn empty_roots_have_no_primary() {
        let roots = StorageRoots::new(Vec::new());
        assert!(roots.is_empty());
        assert!(matches!(roots.primary(), Err(StorageError::NoRoots)));
    }

    #[test]
    fn lock_is_exclusive() {
        let a = tempdir().unwrap();
        let roots = StorageRoots::new(vec![a.path().into()]);

        let held = roots.lock_all().unwrap();
        assert!(matches!(roots.lock_all(), Err(StorageError::Locked(_))));
        drop(held);
        assert!(roots.lock_all().is_ok());
    }
}
