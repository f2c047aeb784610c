//! Startup: find leftover compaction logs and recover each registry.

use crate::config::CompactionConfig;
use crate::error::CoreResult;
use crate::identifier::{COMPACTION_MODS_SUFFIX, TEMP_TARGET_SUFFIX};
use crate::log::{legacy_log_path, CURRENT_LOG_SUFFIX};
use crate::recover::{RecoverTask, RecoveryOutcome};
use crate::registry::FileSetRegistry;
use crate::types::RegistryKey;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tsmerge_storage::{FileSystem, StorageRoots};

/// Result of recovering one log at startup.
#[derive(Debug)]
pub struct LogRecovery {
    /// The log that was processed.
    pub log: PathBuf,
    /// Its outcome, or the error that disabled the registry.
    pub outcome: Result<RecoveryOutcome, String>,
}

/// Summary of [`recover_registry`].
#[derive(Debug)]
pub struct StartupReport {
    /// One entry per discovered log, legacy logs first.
    pub logs: Vec<LogRecovery>,
    /// Orphaned temp targets and in-flight ledgers removed after recovery.
    pub orphans_removed: usize,
}

/// Finds every compaction log of `key` under every root.
///
/// Legacy logs sit in the virtual group directory and are listed first;
/// current logs sit in the partition directory.
///
/// # Errors
///
/// Returns an error if a partition directory cannot be listed.
pub fn discover_compaction_logs(
    roots: &StorageRoots,
    key: &RegistryKey,
    fs: &dyn FileSystem,
) -> CoreResult<Vec<PathBuf>> {
    let mut legacy = Vec::new();
    let mut current = Vec::new();
    for root in roots.roots() {
        let legacy_path = legacy_log_path(root, key);
        if fs.exists(&legacy_path) {
            legacy.push(legacy_path);
        }
        for path in fs.list_dir(&root.join(key.partition_dir()))? {
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CURRENT_LOG_SUFFIX))
            {
                current.push(path);
            }
        }
    }
    legacy.extend(current);
    Ok(legacy)
}

/// Deletes temp targets and in-flight ledgers in the registry's partition
/// directories.
///
/// A compaction that dies before its TARGET record is logged leaves these
/// behind, and recovery of an incomplete log deliberately touches nothing but
/// the log. Once no log remains, no compaction is in flight and both kinds of
/// file are garbage. Does nothing while any log remains.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed or a file cannot be removed.
pub fn sweep_orphan_artifacts(
    roots: &StorageRoots,
    key: &RegistryKey,
    fs: &dyn FileSystem,
) -> CoreResult<usize> {
    if !discover_compaction_logs(roots, key, fs)?.is_empty() {
        return Ok(0);
    }
    let mut removed = 0;
    for root in roots.roots() {
        for path in fs.list_dir(&root.join(key.partition_dir()))? {
            let orphan = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_TARGET_SUFFIX) || n.ends_with(COMPACTION_MODS_SUFFIX));
            if orphan && fs.remove_if_exists(&path)? {
                info!(registry = %key, file = %path.display(), "[Compaction] removed orphan file");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Loads the registry for `key` and recovers every leftover log.
///
/// A failed recovery is recorded in the report and leaves the registry's
/// circuit breaker open; it does not stop the remaining logs from being tried.
///
/// # Errors
///
/// Returns an error only if discovery itself fails.
pub fn recover_registry(
    key: RegistryKey,
    fs: Arc<dyn FileSystem>,
    config: &CompactionConfig,
) -> CoreResult<(Arc<FileSetRegistry>, StartupReport)> {
    let roots = config.storage_roots();
    let registry = Arc::new(FileSetRegistry::load(key.clone(), &roots, fs.as_ref())?);
    let logs = discover_compaction_logs(&roots, &key, fs.as_ref())?;

    let mut report = StartupReport {
        logs: Vec::with_capacity(logs.len()),
        orphans_removed: 0,
    };
    for log in logs {
        let task = RecoverTask::new(Arc::clone(&registry), Arc::clone(&fs), config.clone(), log.clone());
        let outcome = task.recover().map_err(|e| e.to_string());
        report.logs.push(LogRecovery { log, outcome });
    }

    if registry.is_compaction_allowed() {
        report.orphans_removed = sweep_orphan_artifacts(&roots, &key, fs.as_ref())?;
    } else {
        warn!(registry = %key, "[Compaction][Recover] registry left disabled after startup recovery");
    }
    Ok((registry, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SequenceClass;
    use tempfile::tempdir;
    use tsmerge_storage::OsFileSystem;

    fn key() -> RegistryKey {
        RegistryKey::new("root.sg", "0", 0, SequenceClass::Sequence)
    }

    #[test]
    fn discovers_legacy_then_current() {
        let dir = tempdir().unwrap();
        let partition = dir.path().join(key().partition_dir());
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(partition.join("1-1-1-0.inner-compaction.log"), b"").unwrap();
        std::fs::write(partition.join("1-1-0-0.tsfile"), b"").unwrap();
        let legacy = dir.path().join(key().group_dir()).join("root.sg.compaction.log");
        std::fs::write(&legacy, b"").unwrap();

        let roots = StorageRoots::new(vec![dir.path().to_path_buf()]);
        let logs = discover_compaction_logs(&roots, &key(), &OsFileSystem).unwrap();
        assert_eq!(logs, vec![legacy, partition.join("1-1-1-0.inner-compaction.log")]);
    }

    #[test]
    fn sweep_waits_for_logs() {
        let dir = tempdir().unwrap();
        let partition = dir.path().join(key().partition_dir());
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(partition.join("1-1-1-0.tsfile.target"), b"x").unwrap();
        std::fs::write(partition.join("1-1-0-0.tsfile.compaction.mods"), b"").unwrap();
        std::fs::write(partition.join("1-1-0-0.tsfile"), b"x").unwrap();
        let log = partition.join("1-1-1-0.inner-compaction.log");
        std::fs::write(&log, b"").unwrap();
        let roots = StorageRoots::new(vec![dir.path().to_path_buf()]);

        assert_eq!(sweep_orphan_artifacts(&roots, &key(), &OsFileSystem).unwrap(), 0);
        std::fs::remove_file(&log).unwrap();
        assert_eq!(sweep_orphan_artifacts(&roots, &key(), &OsFileSystem).unwrap(), 2);
        assert!(partition.join("1-1-0-0.tsfile").exists());
    }

    #[test]
    fn recover_registry_without_logs() {
        let dir = tempdir().unwrap();
        let config = CompactionConfig::new().data_dirs(vec![dir.path().to_path_buf()]);
        let (registry, report) = recover_registry(key(), Arc::new(OsFileSystem), &config).unwrap();
        assert!(registry.is_empty());
        assert!(report.logs.is_empty());
        assert_eq!(report.orphans_removed, 0);
    }
}
