//! Recovery of one leftover compaction log.
//!
//! Recovery never re-runs a merge. It reads the log, probes the roots for the
//! evidence the forward task leaves at each step, and finishes whichever
//! outcome that evidence implies:
//!
//! | Log | Sources | Target | Action |
//! |---|---|---|---|
//! | missing | - | - | nothing |
//! | no SOURCE or no TARGET | - | - | delete the log |
//! | complete | all present | absent | drop in-flight ledgers |
//! | complete | all present | present | commit or roll back, as validated |
//! | complete | some missing | - | finish source cleanup |
//!
//! The log is deleted only after its branch succeeds. Any failure keeps the
//! log for the next restart and opens the registry's circuit breaker.

use crate::config::CompactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::handler::{ExceptionHandler, Resolution, TargetRef};
use crate::lifecycle::DataFile;
use crate::log::{self, is_legacy_log, AnalyzedLog};
use crate::registry::FileSetRegistry;
use crate::resource::{SidecarValidator, TargetValidator};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tsmerge_storage::{FileSystem, StorageRoots};

/// Which branch a recovery took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The log was already gone.
    NoLog,
    /// The log named no source or no target; it was deleted.
    IncompleteLog,
    /// All sources present, no target: in-flight ledgers dropped.
    AbortedBeforeMerge,
    /// All sources present, valid target: the compaction was committed.
    Committed,
    /// All sources present, invalid target: the target was discarded.
    RolledBack,
    /// Some sources already deleted: cleanup was finished.
    SourcesCleanedUp,
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoLog => "no-log",
            Self::IncompleteLog => "incomplete-log",
            Self::AbortedBeforeMerge => "aborted",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
            Self::SourcesCleanedUp => "sources-cleaned-up",
        };
        f.write_str(name)
    }
}

/// Resolves one compaction log left behind by an unclean shutdown.
pub struct RecoverTask {
    registry: Arc<FileSetRegistry>,
    fs: Arc<dyn FileSystem>,
    roots: StorageRoots,
    config: CompactionConfig,
    validator: Arc<dyn TargetValidator>,
    log_path: PathBuf,
}

impl RecoverTask {
    /// Creates a recovery task for the log at `log_path`.
    #[must_use]
    pub fn new(
        registry: Arc<FileSetRegistry>,
        fs: Arc<dyn FileSystem>,
        config: CompactionConfig,
        log_path: PathBuf,
    ) -> Self {
        Self {
            registry,
            fs,
            roots: config.storage_roots(),
            config,
            validator: Arc::new(SidecarValidator),
            log_path,
        }
    }

    /// Replaces the target validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn TargetValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// The log this task resolves.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// The registry this task repairs.
    #[must_use]
    pub fn registry(&self) -> &Arc<FileSetRegistry> {
        &self.registry
    }

    /// Returns true if the log predates the current format.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        is_legacy_log(&self.log_path, self.registry.name())
    }

    /// Only a task whose log still exists may run, so two scheduled
    /// recoveries of one log cannot both do destructive work.
    #[must_use]
    pub fn is_valid_to_run(&self) -> bool {
        self.fs.exists(&self.log_path)
    }

    /// Duplicates share a log path and a storage root configuration.
    #[must_use]
    pub fn same_task(&self, other: &Self) -> bool {
        self.log_path == other.log_path && self.roots == other.roots
    }

    /// Parses the log. An unreadable log counts as empty, which aborts.
    #[must_use]
    pub fn analyze(&self) -> AnalyzedLog {
        let legacy = self.is_legacy();
        match log::parse(self.fs.as_ref(), &self.log_path, legacy) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    registry = %self.registry.key(),
                    log = %self.log_path.display(),
                    error = %e,
                    "[Compaction][Recover] cannot read log, treating it as empty"
                );
                AnalyzedLog {
                    legacy,
                    ..AnalyzedLog::default()
                }
            }
        }
    }

    /// Runs recovery to completion.
    ///
    /// On success the log is deleted; if only that delete fails, compaction is
    /// disabled but the outcome is still returned. On failure the log is kept
    /// and compaction is disabled.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the chosen branch.
    pub fn recover(&self) -> CoreResult<RecoveryOutcome> {
        info!(
            registry = %self.registry.key(),
            log = %self.log_path.display(),
            "[Compaction][Recover] inner space compaction log found"
        );
        if !self.fs.exists(&self.log_path) {
            return Ok(RecoveryOutcome::NoLog);
        }

        match self.recover_branch() {
            Ok(outcome) => {
                self.delete_log();
                info!(
                    registry = %self.registry.key(),
                    %outcome,
                    "[Compaction][Recover] recovered compaction"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    registry = %self.registry.key(),
                    log = %self.log_path.display(),
                    error = %e,
                    "[Compaction][Recover] failed to recover compaction, set allowCompaction to false"
                );
                self.registry.set_allow_compaction(false);
                Err(e)
            }
        }
    }

    fn recover_branch(&self) -> CoreResult<RecoveryOutcome> {
        let parsed = self.analyze();
        let target_id = match parsed.first_target() {
            Some(t) if !parsed.sources.is_empty() => t,
            _ => {
                info!(
                    registry = %self.registry.key(),
                    sources = parsed.sources.len(),
                    targets = parsed.targets.len(),
                    "[Compaction][Recover] incomplete log file, abort recover"
                );
                return Ok(RecoveryOutcome::IncompleteLog);
            }
        };
        if parsed.targets.len() > 1 {
            warn!(
                registry = %self.registry.key(),
                ignored = parsed.targets.len() - 1,
                "[Compaction][Recover] only the first target record is consulted"
            );
        }

        let handler = self.handler();
        let mut target = TargetRef::probe(target_id, &self.roots);
        let resolved: Option<Vec<DataFile>> = parsed
            .sources
            .iter()
            .map(|id| {
                self.roots
                    .resolve(&id.relative_path())
                    .map(|path| DataFile::closed(id.clone(), path))
            })
            .collect();

        let Some(mut sources) = resolved else {
            info!(
                registry = %self.registry.key(),
                target = %target.id(),
                "[Compaction][Recover] some source files are lost, finishing cleanup"
            );
            handler.handle_when_sources_lost(&target, &parsed.sources, parsed.legacy)?;
            return Ok(RecoveryOutcome::SourcesCleanedUp);
        };

        // Recovery takes over the sources of the interrupted compaction.
        for source in &mut sources {
            source.select()?;
        }

        if target.is_none() {
            info!(
                registry = %self.registry.key(),
                target = %target.id(),
                "[Compaction][Recover] target file does not exist"
            );
            handler.abort(&sources)?;
            return Ok(RecoveryOutcome::AbortedBeforeMerge);
        }

        match handler.resolve(&target, &sources) {
            Resolution::Commit => {
                let committed = handler.commit(&mut target, &sources)?;
                info!(
                    registry = %self.registry.key(),
                    target = %committed.path.display(),
                    sources = committed.deleted.len(),
                    "[Compaction][Recover] committed interrupted compaction"
                );
                Ok(RecoveryOutcome::Committed)
            }
            Resolution::Rollback => {
                handler.rollback(&target, &sources)?;
                Ok(RecoveryOutcome::RolledBack)
            }
            Resolution::Fatal(reason) => Err(CoreError::fatal(reason)),
        }
    }

    fn delete_log(&self) {
        if let Err(e) = self.fs.remove_if_exists(&self.log_path) {
            error!(
                registry = %self.registry.key(),
                log = %self.log_path.display(),
                error = %e,
                "[Compaction][Recover] exception while deleting log file, set allowCompaction to false"
            );
            self.registry.set_allow_compaction(false);
        }
    }

    fn handler(&self) -> ExceptionHandler<'_> {
        ExceptionHandler::new(
            self.fs.as_ref(),
            &self.roots,
            &self.registry,
            self.validator.as_ref(),
            &self.config.legacy_mods_file_name,
        )
    }
}

impl fmt::Debug for RecoverTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverTask")
            .field("registry", self.registry.key())
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{append_suffix, FileIdentifier, RESOURCE_SUFFIX};
    use crate::log::{CompactionLogWriter, LogRecord};
    use crate::resource::{write_sidecar, SidecarMeta};
    use crate::types::{RegistryKey, SequenceClass};
    use tempfile::{tempdir, TempDir};
    use tsmerge_storage::OsFileSystem;

    fn key() -> RegistryKey {
        RegistryKey::new("root.sg", "0", 0, SequenceClass::Sequence)
    }

    struct Env {
        dir: TempDir,
        config: CompactionConfig,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join(key().partition_dir())).unwrap();
            let config = CompactionConfig::new().data_dirs(vec![dir.path().to_path_buf()]);
            Self { dir, config }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(key().partition_dir()).join(name)
        }

        fn data_file(&self, name: &str, data: &[u8]) {
            std::fs::write(self.path(name), data).unwrap();
            let meta = SidecarMeta {
                file_len: data.len() as u64,
                start_time: 0,
                end_time: 1,
                series_count: 1,
            };
            write_sidecar(
                &OsFileSystem,
                &append_suffix(&self.path(name), RESOURCE_SUFFIX),
                &meta,
            )
            .unwrap();
        }

        fn log(&self, sources: &[&str], target: Option<&str>) -> PathBuf {
            let path = self.path("1-1-1-0.inner-compaction.log");
            let mut writer = CompactionLogWriter::create(&OsFileSystem, &path, true).unwrap();
            let ids: Vec<_> = sources
                .iter()
                .map(|n| FileIdentifier::new(&key(), *n))
                .collect();
            writer.log_sources(&ids).unwrap();
            if let Some(t) = target {
                writer
                    .append(&LogRecord::target(FileIdentifier::new(&key(), t)))
                    .unwrap();
            }
            writer.close().unwrap();
            path
        }

        fn task(&self, log: PathBuf) -> RecoverTask {
            let registry =
                FileSetRegistry::load(key(), &self.config.storage_roots(), &OsFileSystem).unwrap();
            RecoverTask::new(
                Arc::new(registry),
                Arc::new(OsFileSystem),
                self.config.clone(),
                log,
            )
        }
    }

    #[test]
    fn missing_log_is_noop() {
        let env = Env::new();
        let task = env.task(env.path("1-1-1-0.inner-compaction.log"));
        assert!(!task.is_valid_to_run());
        assert_eq!(task.recover().unwrap(), RecoveryOutcome::NoLog);
        assert!(task.registry().is_compaction_allowed());
    }

    #[test]
    fn incomplete_log_is_deleted() {
        let env = Env::new();
        env.data_file("1-1-0-0.tsfile", b"a");
        let log = env.log(&["1-1-0-0.tsfile"], None);
        let task = env.task(log.clone());

        assert!(task.is_valid_to_run());
        assert_eq!(task.recover().unwrap(), RecoveryOutcome::IncompleteLog);
        assert!(!log.exists());
        assert!(env.path("1-1-0-0.tsfile").exists());
    }

    #[test]
    fn valid_target_commits() {
        let env = Env::new();
        env.data_file("1-1-0-0.tsfile", b"a");
        env.data_file("2-2-0-0.tsfile", b"b");
        env.data_file("1-1-1-0.tsfile", b"ab");
        let log = env.log(
            &["1-1-0-0.tsfile", "2-2-0-0.tsfile"],
            Some("1-1-1-0.tsfile.target"),
        );
        let task = env.task(log.clone());

        assert_eq!(task.recover().unwrap(), RecoveryOutcome::Committed);
        assert!(!log.exists());
        assert!(!env.path("1-1-0-0.tsfile").exists());
        assert!(!env.path("2-2-0-0.tsfile").exists());
        assert_eq!(task.registry().len(), 1);
    }

    #[test]
    fn invalid_target_rolls_back() {
        let env = Env::new();
        env.data_file("1-1-0-0.tsfile", b"a");
        env.data_file("2-2-0-0.tsfile", b"b");
        std::fs::write(env.path("1-1-1-0.tsfile.target"), b"a").unwrap();
        let log = env.log(
            &["1-1-0-0.tsfile", "2-2-0-0.tsfile"],
            Some("1-1-1-0.tsfile.target"),
        );
        let task = env.task(log.clone());

        assert_eq!(task.recover().unwrap(), RecoveryOutcome::RolledBack);
        assert!(!env.path("1-1-1-0.tsfile.target").exists());
        assert!(env.path("1-1-0-0.tsfile").exists());
        assert_eq!(task.registry().len(), 2);
    }

    #[test]
    fn same_task_compares_log_and_roots() {
        let env = Env::new();
        let a = env.task(env.path("x.inner-compaction.log"));
        let b = env.task(env.path("x.inner-compaction.log"));
        let c = env.task(env.path("y.inner-compaction.log"));
        assert!(a.same_task(&b));
        assert!(!a.same_task(&c));
    }

    #[test]
    fn legacy_detection() {
        let env = Env::new();
        let legacy = env.dir.path().join(key().group_dir()).join("root.sg.compaction.log");
        assert!(env.task(legacy).is_legacy());
        assert!(!env.task(env.path("1-1-1-0.inner-compaction.log")).is_legacy());
    }
}
