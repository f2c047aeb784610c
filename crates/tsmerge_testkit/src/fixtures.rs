//! Test fixtures: on-disk layouts and snapshots.
//!
//! A [`TestLayout`] owns one or more temporary storage roots holding a single
//! registry's partition. Helpers write data files with sidecars, ledgers and
//! compaction logs in both formats, so tests can stage exactly the disk state
//! a crash would leave behind.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tsmerge_core::log::{current_log_name, legacy_log_path};
use tsmerge_core::{
    append_suffix, recover_registry, write_sidecar, CompactionConfig, CompactionLogWriter,
    Deletion, FileIdentifier, FileSetRegistry, LedgerKind, ModificationLedger, RegistryKey,
    SequenceClass, SidecarMeta, StartupReport, TsFileName, RESOURCE_SUFFIX,
};
use tsmerge_storage::{FileSystem, OsFileSystem};

/// Logical group used by every layout.
pub const TEST_GROUP: &str = "root.sg";

/// Registry key used by every layout.
#[must_use]
pub fn test_key() -> RegistryKey {
    RegistryKey::new(TEST_GROUP, "0", 0, SequenceClass::Sequence)
}

/// Temporary storage roots for one registry, removed on drop.
pub struct TestLayout {
    _temp_dir: TempDir,
    roots: Vec<PathBuf>,
    key: RegistryKey,
}

impl TestLayout {
    /// Creates a layout with a single storage root.
    pub fn new() -> Self {
        Self::with_roots(1)
    }

    /// Creates a layout with `count` storage roots.
    pub fn with_roots(count: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let key = test_key();
        let roots: Vec<PathBuf> = (0..count)
            .map(|i| temp_dir.path().join(format!("root{i}")))
            .collect();
        for root in &roots {
            fs::create_dir_all(root.join(key.partition_dir()))
                .expect("Failed to create partition directory");
        }
        Self {
            _temp_dir: temp_dir,
            roots,
            key,
        }
    }

    /// The registry key of this layout.
    pub fn key(&self) -> &RegistryKey {
        &self.key
    }

    /// All storage roots, in search order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// The storage root at `index`.
    pub fn root(&self, index: usize) -> &Path {
        &self.roots[index]
    }

    /// Configuration pointing at this layout's roots.
    pub fn config(&self) -> CompactionConfig {
        CompactionConfig::new().data_dirs(self.roots.clone())
    }

    /// The partition directory under root `index`.
    pub fn partition_dir(&self, index: usize) -> PathBuf {
        self.roots[index].join(self.key.partition_dir())
    }

    /// The virtual group directory under root `index`.
    pub fn group_dir(&self, index: usize) -> PathBuf {
        self.roots[index].join(self.key.group_dir())
    }

    /// Identifier of `name` in this layout's registry.
    pub fn id(&self, name: &str) -> FileIdentifier {
        FileIdentifier::new(&self.key, name)
    }

    /// Absolute path of `name` under root `index`.
    pub fn path(&self, index: usize, name: &str) -> PathBuf {
        self.partition_dir(index).join(name)
    }

    /// Writes a data file and a sidecar that validates against it.
    ///
    /// The time range is derived from the name's timestamp.
    pub fn write_data_file(&self, index: usize, name: &str, data: &[u8]) -> PathBuf {
        let start = TsFileName::parse(name)
            .map(|n| n.timestamp as i64 * 100)
            .unwrap_or(0);
        let meta = SidecarMeta {
            file_len: data.len() as u64,
            start_time: start,
            end_time: start + 99,
            series_count: 1,
        };
        self.write_data_file_with_meta(index, name, data, &meta)
    }

    /// Writes a data file with an explicit sidecar.
    pub fn write_data_file_with_meta(
        &self,
        index: usize,
        name: &str,
        data: &[u8],
        meta: &SidecarMeta,
    ) -> PathBuf {
        let path = self.path(index, name);
        fs::write(&path, data).expect("Failed to write data file");
        write_sidecar(&OsFileSystem, &append_suffix(&path, RESOURCE_SUFFIX), meta)
            .expect("Failed to write sidecar");
        path
    }

    /// Writes raw bytes to `name` in the partition directory, no sidecar.
    pub fn write_raw(&self, index: usize, name: &str, data: &[u8]) -> PathBuf {
        let path = self.path(index, name);
        fs::write(&path, data).expect("Failed to write file");
        path
    }

    /// Appends deletions to the ledger of kind `kind` next to `name`.
    pub fn write_ledger(
        &self,
        index: usize,
        name: &str,
        kind: LedgerKind,
        deletions: &[Deletion],
    ) -> PathBuf {
        let data_path = self.path(index, name);
        let ledger = match kind {
            LedgerKind::Ordinary => ModificationLedger::ordinary(&data_path),
            LedgerKind::InFlight => ModificationLedger::in_flight(&data_path),
        };
        ledger
            .append(&OsFileSystem, deletions)
            .expect("Failed to append ledger");
        ledger.path().to_path_buf()
    }

    /// Records a deletion against a source the way a live engine does while
    /// that source is being compacted: in both of its ledgers.
    pub fn delete_during_compaction(&self, index: usize, name: &str, deletion: &Deletion) {
        self.write_ledger(index, name, LedgerKind::Ordinary, std::slice::from_ref(deletion));
        self.write_ledger(index, name, LedgerKind::InFlight, std::slice::from_ref(deletion));
    }

    /// Reads the ordinary ledger next to `name`.
    pub fn read_ledger(&self, index: usize, name: &str) -> Vec<Deletion> {
        ModificationLedger::ordinary(&self.path(index, name))
            .read(&OsFileSystem)
            .expect("Failed to read ledger")
    }

    /// Writes a current-format log in the partition directory of root `index`.
    ///
    /// `target` is written verbatim, so pass either the temp or final name.
    /// The log is named after the first source's next inner level.
    pub fn write_current_log(
        &self,
        index: usize,
        sources: &[&str],
        target: Option<&str>,
    ) -> PathBuf {
        let stem = sources
            .first()
            .and_then(|s| TsFileName::parse(s).ok())
            .map(|n| n.next_inner_level().stem())
            .unwrap_or_else(|| "0-0-1-0".to_string());
        let path = self.partition_dir(index).join(current_log_name(&stem));
        let mut writer =
            CompactionLogWriter::create(&OsFileSystem, &path, true).expect("Failed to create log");
        let ids: Vec<FileIdentifier> = sources.iter().map(|s| self.id(s)).collect();
        writer.log_sources(&ids).expect("Failed to log sources");
        if let Some(target) = target {
            writer
                .log_target(&self.id(target))
                .expect("Failed to log target");
        }
        writer.close().expect("Failed to close log");
        path
    }

    /// Writes a legacy text log in the virtual group directory of root `index`.
    ///
    /// Paths are recorded as full paths under root `index`.
    pub fn write_legacy_log(&self, index: usize, sources: &[&str], target: Option<&str>) -> PathBuf {
        let mut text = String::from("sequence\n");
        for source in sources {
            text.push_str("source\n");
            text.push_str(&self.path(index, source).display().to_string());
            text.push('\n');
        }
        if let Some(target) = target {
            text.push_str("target\n");
            text.push_str(&self.path(index, target).display().to_string());
            text.push('\n');
        }
        let path = legacy_log_path(&self.roots[index], &self.key);
        fs::write(&path, text).expect("Failed to write legacy log");
        path
    }

    /// Writes the registry-wide ledger left by pre-upgrade versions.
    pub fn write_legacy_ledger(&self, index: usize, deletions: &[Deletion]) -> PathBuf {
        let path = self
            .group_dir(index)
            .join(tsmerge_core::DEFAULT_LEGACY_MODS_FILE);
        ModificationLedger::at(path.clone(), LedgerKind::InFlight)
            .append(&OsFileSystem, deletions)
            .expect("Failed to write legacy ledger");
        path
    }

    /// Loads the registry from disk, as a restart would.
    pub fn load_registry(&self) -> Arc<FileSetRegistry> {
        Arc::new(
            FileSetRegistry::load(self.key.clone(), &self.config().storage_roots(), &OsFileSystem)
                .expect("Failed to load registry"),
        )
    }

    /// Runs startup recovery over this layout with the OS filesystem.
    pub fn restart(&self) -> (Arc<FileSetRegistry>, StartupReport) {
        self.restart_with(Arc::new(OsFileSystem))
    }

    /// Runs startup recovery over this layout with `fs`.
    pub fn restart_with(&self, fs: Arc<dyn FileSystem>) -> (Arc<FileSetRegistry>, StartupReport) {
        recover_registry(self.key.clone(), fs, &self.config()).expect("Startup recovery failed")
    }

    /// Captures every file under every root.
    pub fn snapshot(&self) -> DiskSnapshot {
        DiskSnapshot::capture(&self.roots)
    }
}

impl Default for TestLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// File names currently registered, in registry order.
pub fn registered_names(registry: &FileSetRegistry) -> Vec<String> {
    registry
        .list_files()
        .iter()
        .map(|f| f.id().file_name.clone())
        .collect()
}

/// Contents of every file under a set of storage roots.
///
/// Keys are `"<root index>/<relative path>"` with `/` separators. Root lock
/// files are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskSnapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl DiskSnapshot {
    /// Walks `roots` and records every regular file.
    pub fn capture(roots: &[PathBuf]) -> Self {
        let mut files = BTreeMap::new();
        for (index, root) in roots.iter().enumerate() {
            walk(root, root, index, &mut files);
        }
        Self { files }
    }

    /// Returns true if a file with this key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    /// Contents of the file with this key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.files.get(key).map(Vec::as_slice)
    }

    /// Keys of every captured file.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of captured files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns a copy without files whose key ends with `suffix`.
    pub fn without_suffix(&self, suffix: &str) -> Self {
        Self {
            files: self
                .files
                .iter()
                .filter(|(k, _)| !k.ends_with(suffix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Describes every difference from `other`, one line each.
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, data) in &self.files {
            match other.files.get(key) {
                None => out.push(format!("- {key}")),
                Some(theirs) if theirs != data => {
                    out.push(format!("~ {key} ({} vs {} bytes)", data.len(), theirs.len()));
                }
                Some(_) => {}
            }
        }
        for key in other.files.keys() {
            if !self.files.contains_key(key) {
                out.push(format!("+ {key}"));
            }
        }
        out
    }

    /// Pretty JSON listing of keys and sizes, for failure messages.
    pub fn to_json(&self) -> String {
        let sizes: BTreeMap<&str, usize> =
            self.files.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        serde_json::to_string_pretty(&sizes).unwrap_or_default()
    }
}

fn walk(root: &Path, dir: &Path, index: usize, files: &mut BTreeMap<String, Vec<u8>>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, index, files);
            continue;
        }
        if path.file_name().is_some_and(|n| n == "LOCK") {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        let data = fs::read(&path).unwrap_or_default();
        files.insert(format!("{index}/{relative}"), data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_creates_partitions() {
        let layout = TestLayout::with_roots(2);
        assert!(layout.partition_dir(0).is_dir());
        assert!(layout.partition_dir(1).is_dir());
        assert_eq!(layout.config().data_dirs.len(), 2);
    }

    #[test]
    fn data_files_load_into_registry() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"abc");
        layout.write_raw(0, "2-2-0-0.tsfile", b"no sidecar");
        assert_eq!(registered_names(&layout.load_registry()), vec!["1-1-0-0.tsfile"]);
    }

    #[test]
    fn snapshot_keys_are_root_relative() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"abc");
        let snap = layout.snapshot();
        assert!(snap.contains("0/sequence/root.sg/0/0/1-1-0-0.tsfile"));
        assert!(snap.contains("0/sequence/root.sg/0/0/1-1-0-0.tsfile.resource"));
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.without_suffix(".resource").len(), 1);
    }

    #[test]
    fn snapshot_diff() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"abc");
        let before = layout.snapshot();
        layout.write_raw(0, "1-1-0-0.tsfile", b"abcd");
        layout.write_raw(0, "x", b"");
        let diff = before.diff(&layout.snapshot());
        assert_eq!(diff.len(), 2);
        assert!(diff[0].starts_with("~ 0/sequence/root.sg/0/0/1-1-0-0.tsfile"));
        assert!(diff[1].starts_with("+ "));
    }

    #[test]
    fn current_log_named_after_target() {
        let layout = TestLayout::new();
        let log = layout.write_current_log(0, &["3-3-0-0.tsfile"], None);
        assert_eq!(
            log.file_name().unwrap().to_str().unwrap(),
            "3-3-1-0.inner-compaction.log"
        );
    }
}
