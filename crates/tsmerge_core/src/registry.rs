//! Per-partition file-set registry and its compaction circuit breaker.

use crate::error::{CoreError, CoreResult};
use crate::identifier::{
    append_suffix, FileIdentifier, TsFileName, RESOURCE_SUFFIX, TSFILE_SUFFIX,
};
use crate::lifecycle::{DataFile, SourceState};
use crate::types::RegistryKey;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tracing::{debug, warn};
use tsmerge_storage::{FileSystem, StorageRoots};

/// Live, ordered list of data files for one
/// (logical group, virtual group, partition, sequence class) scope.
///
/// List mutations happen under a single write lock, so a reader sees either
/// the sources or the target of a compaction, never both or neither.
///
/// # Thread Safety
///
/// Shared as `Arc<FileSetRegistry>`. The external scheduler serializes
/// compaction and recovery per registry; the lock only protects readers.
#[derive(Debug)]
pub struct FileSetRegistry {
    key: RegistryKey,
    files: RwLock<Vec<DataFile>>,
    allow_compaction: AtomicBool,
}

impl FileSetRegistry {
    /// Creates an empty registry with compaction allowed.
    #[must_use]
    pub fn new(key: RegistryKey) -> Self {
        Self::with_files(key, Vec::new())
    }

    /// Creates a registry holding `files`, sorted into data file order.
    #[must_use]
    pub fn with_files(key: RegistryKey, mut files: Vec<DataFile>) -> Self {
        files.sort_by(|a, b| file_order(a.id(), b.id()));
        Self {
            key,
            files: RwLock::new(files),
            allow_compaction: AtomicBool::new(true),
        }
    }

    /// Discovers the registry's files under every root.
    ///
    /// A `.tsfile` is live iff its sidecar exists next to it. The first root
    /// holding a given name wins.
    ///
    /// # Errors
    ///
    /// Returns an error if a partition directory cannot be listed.
    pub fn load(key: RegistryKey, roots: &StorageRoots, fs: &dyn FileSystem) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for root in roots.roots() {
            for path in fs.list_dir(&root.join(key.partition_dir()))? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.ends_with(TSFILE_SUFFIX) {
                    continue;
                }
                if !fs.exists(&append_suffix(&path, RESOURCE_SUFFIX)) {
                    debug!(file = %path.display(), "[Compaction] skipping data file without sidecar");
                    continue;
                }
                if seen.insert(name.to_string()) {
                    files.push(DataFile::closed(FileIdentifier::new(&key, name), path.clone()));
                }
            }
        }
        Ok(Self::with_files(key, files))
    }

    /// Returns the registry's scope.
    #[must_use]
    pub fn key(&self) -> &RegistryKey {
        &self.key
    }

    /// The registry's name: its logical group. Legacy logs are prefixed with it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.key.logical_group
    }

    /// Snapshot of the live files in order.
    #[must_use]
    pub fn list_files(&self) -> Vec<DataFile> {
        self.files.read().clone()
    }

    /// Number of live files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Returns true if no file is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Returns whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &FileIdentifier) -> bool {
        self.files.read().iter().any(|f| f.id() == id)
    }

    /// Returns the registered file for `id`.
    #[must_use]
    pub fn get(&self, id: &FileIdentifier) -> Option<DataFile> {
        self.files.read().iter().find(|f| f.id() == id).cloned()
    }

    /// Registers `file` in order. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the file belongs to another registry.
    pub fn insert(&self, file: DataFile) -> CoreResult<bool> {
        self.check_scope(file.id())?;
        let mut files = self.files.write();
        Ok(insert_sorted(&mut files, file))
    }

    /// Unregisters every file in `ids`, returning how many were present.
    pub fn remove(&self, ids: &[FileIdentifier]) -> usize {
        let mut files = self.files.write();
        let before = files.len();
        files.retain(|f| !ids.contains(f.id()));
        before - files.len()
    }

    /// Atomically unregisters `sources` and registers `target`.
    ///
    /// Sources that are already absent are ignored, and so is a target that
    /// is already present, which makes a repeated swap a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the target belongs to another registry.
    pub fn replace(&self, sources: &[FileIdentifier], target: DataFile) -> CoreResult<()> {
        self.check_scope(target.id())?;
        let mut files = self.files.write();
        files.retain(|f| !sources.contains(f.id()));
        insert_sorted(&mut files, target);
        Ok(())
    }

    /// Marks `ids` as selected by a compaction, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if any file is absent or not closed.
    pub fn select(&self, ids: &[FileIdentifier]) -> CoreResult<Vec<DataFile>> {
        let mut files = self.files.write();
        for id in ids {
            match files.iter().find(|f| f.id() == id) {
                Some(f) if f.state() == SourceState::Closed => {}
                Some(f) => {
                    return Err(CoreError::invalid_operation(format!(
                        "{id} is {}, cannot select it",
                        f.state()
                    )))
                }
                None => {
                    return Err(CoreError::invalid_operation(format!("{id} is not registered")))
                }
            }
        }
        let mut selected = Vec::with_capacity(ids.len());
        for file in files.iter_mut().filter(|f| ids.contains(f.id())) {
            file.select()?;
            selected.push(file.clone());
        }
        Ok(selected)
    }

    /// Returns selected files among `ids` to `Closed`. Other files are untouched.
    pub fn release(&self, ids: &[FileIdentifier]) {
        let mut files = self.files.write();
        for file in files.iter_mut().filter(|f| ids.contains(f.id())) {
            file.release_if_selected();
        }
    }

    /// Opens or closes the circuit breaker.
    pub fn set_allow_compaction(&self, allow: bool) {
        let previous = self.allow_compaction.swap(allow, AtomicOrdering::SeqCst);
        if previous && !allow {
            warn!(registry = %self.key, "[Compaction] compaction disabled for registry");
        }
    }

    /// Returns whether new compactions may start.
    #[must_use]
    pub fn is_compaction_allowed(&self) -> bool {
        self.allow_compaction.load(AtomicOrdering::SeqCst)
    }

    /// Location of the registry-wide legacy ledger under `root`.
    #[must_use]
    pub fn legacy_mods_path(&self, root: &Path, file_name: &str) -> PathBuf {
        root.join(self.key.group_dir()).join(file_name)
    }

    fn check_scope(&self, id: &FileIdentifier) -> CoreResult<()> {
        if id.registry_key() != self.key {
            return Err(CoreError::invalid_operation(format!(
                "{id} does not belong to registry {}",
                self.key
            )));
        }
        Ok(())
    }
}

fn insert_sorted(files: &mut Vec<DataFile>, file: DataFile) -> bool {
    if files.iter().any(|f| f.id() == file.id()) {
        return false;
    }
    let at = files
        .iter()
        .position(|f| file_order(f.id(), file.id()) == Ordering::Greater)
        .unwrap_or(files.len());
    files.insert(at, file);
    true
}

/// Orders files by (timestamp, version) when the names parse, by name otherwise.
fn file_order(a: &FileIdentifier, b: &FileIdentifier) -> Ordering {
    match (TsFileName::parse(&a.file_name), TsFileName::parse(&b.file_name)) {
        (Ok(x), Ok(y)) => (x.timestamp, x.version)
            .cmp(&(y.timestamp, y.version))
            .then_with(|| a.file_name.cmp(&b.file_name)),
        _ => a.file_name.cmp(&b.file_name),
    }
}
