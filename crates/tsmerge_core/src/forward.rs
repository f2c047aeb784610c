//! Forward inner compaction: select, log, merge, commit, clean up.
//!
//! ## Write Order
//!
//! 1. Create the compaction log and write one SOURCE record per source
//! 2. Merge the sources into `<target>.tsfile.target`
//! 3. Write the TARGET record naming the temp target
//! 4. Rename the temp target to its final name
//! 5. Write the target's sidecar
//! 6. Merge every source ledger into the target's ledger
//! 7. Swap sources for target in the registry
//! 8. Delete each source (data, sidecar, ledgers)
//! 9. Delete the log
//!
//! Sources are never deleted before step 7 has made the target durable and
//! registered. Recovery depends on that: a log whose sources are partly
//! missing always belongs to a committed target.

use crate::config::CompactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::handler::{ExceptionHandler, Resolution, TargetRef};
use crate::identifier::{append_suffix, FileIdentifier, TsFileName, RESOURCE_SUFFIX};
use crate::lifecycle::{DataFile, SourceState, TargetFile};
use crate::log::{current_log_name, CompactionLogWriter};
use crate::merge::{ConcatMerger, Merger};
use crate::registry::FileSetRegistry;
use crate::resource::{write_sidecar, SidecarValidator, TargetValidator};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tsmerge_storage::{FileSystem, StorageRoots};

/// Points in the forward task after which a process kill is observable on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionCheckpoint {
    /// The empty log file exists.
    LogOpened,
    /// Every SOURCE record is durable.
    SourcesLogged,
    /// The temp target is fully written.
    TempTargetWritten,
    /// The TARGET record is durable.
    TargetLogged,
    /// The temp target has its final name.
    TargetPromoted,
    /// The target's sidecar is durable.
    SidecarWritten,
    /// Source ledgers are merged into the target's ledger.
    LedgersMigrated,
    /// The registry holds the target instead of the sources.
    RegistrySwapped,
    /// Source number `n` (0-based) is deleted.
    SourceDeleted(usize),
    /// Every source is deleted; only the log remains.
    SourcesDeleted,
}

impl CompactionCheckpoint {
    /// Every checkpoint a task over `sources` source files passes, in order.
    #[must_use]
    pub fn sequence(sources: usize) -> Vec<Self> {
        let mut all = vec![
            Self::LogOpened,
            Self::SourcesLogged,
            Self::TempTargetWritten,
            Self::TargetLogged,
            Self::TargetPromoted,
            Self::SidecarWritten,
            Self::LedgersMigrated,
            Self::RegistrySwapped,
        ];
        all.extend((0..sources).map(Self::SourceDeleted));
        all.push(Self::SourcesDeleted);
        all
    }
}

impl fmt::Display for CompactionCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceDeleted(n) => write!(f, "SourceDeleted({n})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// How a forward task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The target replaced the sources.
    Committed(PathBuf),
    /// The task failed before a target was logged; sources are untouched.
    Aborted,
    /// The task failed with an incomplete target, which was discarded.
    RolledBack,
    /// The task failed while deleting sources; the cleanup was finished.
    SourcesCleanedUp,
}

#[derive(Debug, Default)]
struct Progress {
    log: Option<PathBuf>,
    temp_target: Option<PathBuf>,
    target_logged: bool,
}

/// One inner compaction over a fixed list of sources.
pub struct ForwardCompactionTask {
    registry: Arc<FileSetRegistry>,
    fs: Arc<dyn FileSystem>,
    roots: StorageRoots,
    config: CompactionConfig,
    merger: Arc<dyn Merger>,
    validator: Arc<dyn TargetValidator>,
    sources: Vec<FileIdentifier>,
    halt_after: Option<CompactionCheckpoint>,
}

impl ForwardCompactionTask {
    /// Creates a task merging `sources`, which must all be registered in `registry`.
    #[must_use]
    pub fn new(
        registry: Arc<FileSetRegistry>,
        fs: Arc<dyn FileSystem>,
        config: CompactionConfig,
        sources: Vec<FileIdentifier>,
    ) -> Self {
        Self {
            registry,
            fs,
            roots: config.storage_roots(),
            config,
            merger: Arc::new(ConcatMerger),
            validator: Arc::new(SidecarValidator),
            sources,
            halt_after: None,
        }
    }

    /// Replaces the merge collaborator.
    #[must_use]
    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.merger = merger;
        self
    }

    /// Replaces the target validator used on the failure path.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn TargetValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Stops the task right after `checkpoint` as if the process had died.
    ///
    /// The run returns `SimulatedCrash` and skips all failure handling, so
    /// the disk is left exactly as a kill at that point would leave it.
    #[must_use]
    pub fn halt_after(mut self, checkpoint: CompactionCheckpoint) -> Self {
        self.halt_after = Some(checkpoint);
        self
    }

    /// Picks the first run of adjacent closed files sharing an inner level
    /// that is at least `min_source_files` long, capped at `max_source_files`.
    #[must_use]
    pub fn select_candidates(
        registry: &FileSetRegistry,
        config: &CompactionConfig,
    ) -> Option<Vec<FileIdentifier>> {
        let min = config.min_source_files.max(1);
        let mut run: Vec<FileIdentifier> = Vec::new();
        let mut run_level = None;
        for file in registry.list_files() {
            let level = TsFileName::parse(&file.id().file_name)
                .ok()
                .filter(|_| file.state() == SourceState::Closed)
                .map(|n| n.inner_level);
            if level.is_none() || level != run_level {
                if run.len() >= min {
                    break;
                }
                run.clear();
                run_level = level;
            }
            if level.is_some() && run.len() < config.max_source_files {
                run.push(file.id().clone());
            }
        }
        (run.len() >= min).then_some(run)
    }

    /// The registry this task compacts.
    #[must_use]
    pub fn registry(&self) -> &Arc<FileSetRegistry> {
        &self.registry
    }

    /// The sources this task merges.
    #[must_use]
    pub fn sources(&self) -> &[FileIdentifier] {
        &self.sources
    }

    /// The final target: the first source's name one inner level up.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` with no sources, `InvalidFormat` if the
    /// first source's name does not parse.
    pub fn target_id(&self) -> CoreResult<FileIdentifier> {
        let first = self
            .sources
            .first()
            .ok_or_else(|| CoreError::invalid_operation("forward task has no sources"))?;
        let name = TsFileName::parse(&first.file_name)?.next_inner_level();
        Ok(first.with_file_name(name.to_string()))
    }

    /// A forward task may start only while its registry allows compaction
    /// and every source is registered and closed.
    #[must_use]
    pub fn is_valid_to_run(&self) -> bool {
        self.registry.is_compaction_allowed()
            && !self.sources.is_empty()
            && self.sources.iter().all(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|f| f.state() == SourceState::Closed)
            })
    }

    /// Two forward tasks are duplicates if they merge the same sources of
    /// the same registry.
    #[must_use]
    pub fn same_task(&self, other: &Self) -> bool {
        self.registry.key() == other.registry.key() && self.sources == other.sources
    }

    /// Runs the compaction.
    ///
    /// A failure after the sources are selected is resolved in place (abort,
    /// rollback or cleanup) and reported as the matching outcome. If the
    /// failure itself cannot be resolved the registry's circuit breaker is
    /// opened, the log is kept for recovery, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `CompactionDisabled` if the registry is disabled,
    /// `InvalidOperation` if the sources cannot be selected,
    /// `SimulatedCrash` when halted, or the unresolved failure.
    pub fn run(&self) -> CoreResult<ForwardOutcome> {
        if !self.registry.is_compaction_allowed() {
            return Err(CoreError::CompactionDisabled {
                registry: self.registry.key().to_string(),
            });
        }
        let selected = self.registry.select(&self.sources)?;
        info!(
            registry = %self.registry.key(),
            sources = selected.len(),
            "[Compaction] inner compaction starts"
        );

        let mut progress = Progress::default();
        match self.execute(&selected, &mut progress) {
            Ok(target) => {
                if let Some(log) = &progress.log {
                    self.delete_log(log);
                }
                info!(
                    registry = %self.registry.key(),
                    target = %target.display(),
                    "[Compaction] inner compaction finished"
                );
                Ok(ForwardOutcome::Committed(target))
            }
            Err(e) if e.is_simulated_crash() => {
                debug!(registry = %self.registry.key(), "[Compaction] {e}");
                Err(e)
            }
            Err(e) => self.handle_failure(&selected, &progress, &e),
        }
    }

    fn execute(&self, selected: &[DataFile], progress: &mut Progress) -> CoreResult<PathBuf> {
        let target_id = self.target_id()?;
        let partition_dir = selected
            .first()
            .and_then(|f| f.path().parent())
            .map(Path::to_path_buf)
            .ok_or_else(|| CoreError::invalid_operation("source has no parent directory"))?;
        let fs = self.fs.as_ref();

        let stem = TsFileName::parse(&target_id.file_name)?.stem();
        let log_path = partition_dir.join(current_log_name(&stem));
        let mut writer = CompactionLogWriter::create(fs, &log_path, self.config.sync_on_write)?;
        progress.log = Some(log_path);
        self.checkpoint(CompactionCheckpoint::LogOpened)?;

        writer.log_sources(&self.sources)?;
        self.checkpoint(CompactionCheckpoint::SourcesLogged)?;

        let temp_id = target_id.as_temp_target();
        let temp_path = partition_dir.join(&temp_id.file_name);
        let mut target = TargetRef::new(&target_id, TargetFile::None);
        target.begin_write(temp_path.clone())?;
        progress.temp_target = Some(temp_path.clone());
        let meta = self.merger.merge(fs, selected, &temp_path)?;
        self.checkpoint(CompactionCheckpoint::TempTargetWritten)?;

        writer.log_target(&temp_id)?;
        writer.close()?;
        progress.target_logged = true;
        self.checkpoint(CompactionCheckpoint::TargetLogged)?;

        let handler = self.handler();
        let final_path = handler.promote(&mut target)?;
        self.checkpoint(CompactionCheckpoint::TargetPromoted)?;

        write_sidecar(fs, &append_suffix(&final_path, RESOURCE_SUFFIX), &meta)?;
        self.checkpoint(CompactionCheckpoint::SidecarWritten)?;

        let committed =
            handler.commit_observed(&mut target, selected, &mut |cp| self.checkpoint(cp))?;
        Ok(committed.path)
    }

    fn handle_failure(
        &self,
        selected: &[DataFile],
        progress: &Progress,
        cause: &CoreError,
    ) -> CoreResult<ForwardOutcome> {
        error!(
            registry = %self.registry.key(),
            error = %cause,
            "[Compaction] inner compaction failed, handling exception"
        );
        let handler = self.handler();
        let resolved = (|| -> CoreResult<ForwardOutcome> {
            if !progress.target_logged {
                if let Some(temp) = &progress.temp_target {
                    self.fs
                        .remove_if_exists(temp)
                        .map_err(|e| CoreError::mutation("delete", temp, e))?;
                }
                handler.abort(selected)?;
                return Ok(ForwardOutcome::Aborted);
            }

            let mut target = TargetRef::probe(&self.target_id()?, &self.roots);
            if selected.iter().all(|s| self.fs.exists(s.path())) {
                match handler.resolve(&target, selected) {
                    Resolution::Commit => {
                        let committed = handler.commit(&mut target, selected)?;
                        Ok(ForwardOutcome::Committed(committed.path))
                    }
                    Resolution::Rollback => {
                        handler.rollback(&target, selected)?;
                        Ok(ForwardOutcome::RolledBack)
                    }
                    Resolution::Fatal(reason) => Err(CoreError::fatal(reason)),
                }
            } else {
                handler.handle_when_sources_lost(&target, &self.sources, false)?;
                Ok(ForwardOutcome::SourcesCleanedUp)
            }
        })();

        match resolved {
            Ok(outcome) => {
                if let Some(log) = &progress.log {
                    self.delete_log(log);
                }
                warn!(
                    registry = %self.registry.key(),
                    outcome = ?outcome,
                    "[Compaction] inner compaction failure handled"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    registry = %self.registry.key(),
                    error = %e,
                    "[Compaction] failed to handle compaction failure, set allowCompaction to false"
                );
                self.registry.set_allow_compaction(false);
                self.registry.release(&self.sources);
                Err(e)
            }
        }
    }

    fn delete_log(&self, log: &Path) {
        if let Err(e) = self.fs.remove_if_exists(log) {
            error!(
                registry = %self.registry.key(),
                log = %log.display(),
                error = %e,
                "[Compaction] failed to delete compaction log, set allowCompaction to false"
            );
            self.registry.set_allow_compaction(false);
        }
    }

    fn checkpoint(&self, checkpoint: CompactionCheckpoint) -> CoreResult<()> {
        debug!(registry = %self.registry.key(), %checkpoint, "[Compaction] checkpoint");
        if self.halt_after == Some(checkpoint) {
            return Err(CoreError::SimulatedCrash {
                checkpoint: checkpoint.to_string(),
            });
        }
        Ok(())
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

impl fmt::Debug for ForwardCompactionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardCompactionTask")
            .field("registry", self.registry.key())
            .field("sources", &self.sources)
            .field("halt_after", &self.halt_after)
            .finish_non_exhaustive()
    }
}
