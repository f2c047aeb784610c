//! Commit/rollback decisions shared by the forward failure path and recovery.
//!
//! Both paths reach the same question with the same evidence: a target that
//! may or may not be complete and a set of sources. Keeping the decision and
//! the resulting filesystem work here means they cannot diverge.

use crate::error::{CoreError, CoreResult};
use crate::forward::CompactionCheckpoint;
use crate::identifier::{append_suffix, FileIdentifier, RESOURCE_SUFFIX};
use crate::ledger::{merge_ledgers, LedgerKind, ModificationLedger};
use crate::lifecycle::{DataFile, SourceState, TargetFile};
use crate::registry::FileSetRegistry;
use crate::resource::{TargetValidator, Validation};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tsmerge_storage::{FileSystem, StorageRoots};

/// Outcome of [`ExceptionHandler::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The target is complete; finish the compaction.
    Commit,
    /// The target is incomplete; discard it and keep the sources.
    Rollback,
    /// Neither is safe. The registry must stop compacting.
    Fatal(String),
}

/// A merge target: its final identifier and where it currently stands on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    id: FileIdentifier,
    file: TargetFile,
}

impl TargetRef {
    /// Wraps a known target state. `id` may name either form of the target.
    #[must_use]
    pub fn new(id: &FileIdentifier, file: TargetFile) -> Self {
        Self {
            id: id.as_final(),
            file,
        }
    }

    /// Probes the roots for the target, temp name first, then final name.
    #[must_use]
    pub fn probe(id: &FileIdentifier, roots: &StorageRoots) -> Self {
        let id = id.as_final();
        let temp = roots.resolve(&id.as_temp_target().relative_path());
        let final_path = roots.resolve(&id.relative_path());
        Self {
            file: TargetFile::probe(temp, final_path),
            id,
        }
    }

    /// Identifier of the final (promoted) target.
    #[must_use]
    pub fn id(&self) -> &FileIdentifier {
        &self.id
    }

    /// Lifecycle state of the target.
    #[must_use]
    pub fn file(&self) -> &TargetFile {
        &self.file
    }

    /// Returns true if neither form of the target exists.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.file.is_none()
    }

    /// Moves the target to `Temp` at `temp` before the merge writes it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the target already exists.
    pub fn begin_write(&mut self, temp: PathBuf) -> CoreResult<()> {
        self.file.begin_write(temp)
    }

    fn sidecar_path(&self) -> Option<PathBuf> {
        self.file
            .final_path()
            .map(|p| append_suffix(&p, RESOURCE_SUFFIX))
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTarget {
    /// Final path of the registered target.
    pub path: PathBuf,
    /// The sources, each moved to `Deleted`.
    pub deleted: Vec<DataFile>,
}

/// Decides and carries out commit or rollback for one registry.
#[derive(Debug)]
pub struct ExceptionHandler<'a> {
    fs: &'a dyn FileSystem,
    roots: &'a StorageRoots,
    registry: &'a FileSetRegistry,
    validator: &'a dyn TargetValidator,
    legacy_mods_file_name: &'a str,
}

impl<'a> ExceptionHandler<'a> {
    /// Creates a handler over borrowed collaborators.
    #[must_use]
    pub fn new(
        fs: &'a dyn FileSystem,
        roots: &'a StorageRoots,
        registry: &'a FileSetRegistry,
        validator: &'a dyn TargetValidator,
        legacy_mods_file_name: &'a str,
    ) -> Self {
        Self {
            fs,
            roots,
            registry,
            validator,
            legacy_mods_file_name,
        }
    }

    /// Decides the fate of a compaction whose sources all still exist.
    ///
    /// A valid target commits, an invalid or absent one rolls back. An I/O
    /// failure while checking, or a source that has disappeared, is fatal.
    #[must_use]
    pub fn resolve(&self, target: &TargetRef, sources: &[DataFile]) -> Resolution {
        if let Some(lost) = sources.iter().find(|s| !self.fs.exists(s.path())) {
            return Resolution::Fatal(format!("source {} disappeared", lost.id()));
        }
        let (Some(data_path), Some(sidecar)) = (target.file().path(), target.sidecar_path()) else {
            info!(
                registry = %self.registry.key(),
                target = %target.id(),
                "[Compaction] target does not exist, rolling back"
            );
            return Resolution::Rollback;
        };
        match self.validator.validate(self.fs, data_path, &sidecar) {
            Ok(Validation::Valid) => Resolution::Commit,
            Ok(Validation::Invalid(reason)) => {
                warn!(
                    registry = %self.registry.key(),
                    target = %data_path.display(),
                    %reason,
                    "[Compaction] target is incomplete, rolling back"
                );
                Resolution::Rollback
            }
            Err(e) => Resolution::Fatal(format!(
                "cannot validate target {}: {e}",
                data_path.display()
            )),
        }
    }

    /// Commits a target whose sidecar is already in place.
    ///
    /// Every source must be selected; each ends up `Deleted`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if a source is not selected,
    /// `TargetValidation` if the promoted target does not validate and
    /// `FilesystemMutation` if any rename, append or delete fails.
    pub fn commit(
        &self,
        target: &mut TargetRef,
        sources: &[DataFile],
    ) -> CoreResult<CommittedTarget> {
        self.commit_observed(target, sources, &mut |_| Ok(()))
    }

    /// Like [`Self::commit`], reporting each completed step to `observer`.
    ///
    /// An observer error stops the commit at that step.
    ///
    /// # Errors
    ///
    /// As [`Self::commit`], plus any error returned by `observer`.
    pub fn commit_observed(
        &self,
        target: &mut TargetRef,
        sources: &[DataFile],
        observer: &mut dyn FnMut(CompactionCheckpoint) -> CoreResult<()>,
    ) -> CoreResult<CommittedTarget> {
        if let Some(source) = sources.iter().find(|s| s.state() != SourceState::SelectedSource) {
            return Err(CoreError::invalid_operation(format!(
                "{} is {}, cannot commit it",
                source.id(),
                source.state()
            )));
        }
        let final_path = self.promote(target)?;
        let sidecar = append_suffix(&final_path, RESOURCE_SUFFIX);
        if let Validation::Invalid(reason) = self.validator.validate(self.fs, &final_path, &sidecar)? {
            return Err(CoreError::target_validation(&final_path, reason));
        }

        let mut ledgers = Vec::with_capacity(sources.len() * 2);
        for source in sources {
            ledgers.push(ModificationLedger::ordinary(source.path()));
            ledgers.push(ModificationLedger::in_flight(source.path()));
        }
        let merged = merge_ledgers(self.fs, &ledgers, &ModificationLedger::ordinary(&final_path))?;
        observer(CompactionCheckpoint::LedgersMigrated)?;

        let source_ids: Vec<FileIdentifier> = sources.iter().map(|s| s.id().clone()).collect();
        self.registry.replace(
            &source_ids,
            DataFile::closed(target.id.clone(), final_path.clone()),
        )?;
        target.file.commit()?;
        observer(CompactionCheckpoint::RegistrySwapped)?;

        let mut deleted = Vec::with_capacity(sources.len());
        for (n, source) in sources.iter().enumerate() {
            self.delete_source(source.path())?;
            let mut source = source.clone();
            source.mark_deleted()?;
            deleted.push(source);
            observer(CompactionCheckpoint::SourceDeleted(n))?;
        }
        observer(CompactionCheckpoint::SourcesDeleted)?;

        info!(
            registry = %self.registry.key(),
            target = %final_path.display(),
            sources = sources.len(),
            deletions = merged,
            "[Compaction] committed"
        );
        Ok(CommittedTarget {
            path: final_path,
            deleted,
        })
    }

    /// Renames a temp target into place. A target already final is left alone.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the rename fails, `InvalidOperation`
    /// if there is no target to promote.
    pub fn promote(&self, target: &mut TargetRef) -> CoreResult<PathBuf> {
        if let TargetFile::Temp(temp) = &target.file {
            let final_path = strip_to_final(temp, &target.id);
            self.fs
                .rename(temp, &final_path)
                .map_err(|e| CoreError::mutation("rename", temp, e))?;
        }
        target.file.promote()?;
        target
            .file
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| CoreError::invalid_operation("no target to promote"))
    }

    /// Discards every trace of the target and returns the sources to service.
    ///
    /// Target artifacts are removed under every root, so a partial sidecar
    /// or ledger is found even when the data file itself is gone.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if any delete fails.
    pub fn rollback(&self, target: &TargetRef, sources: &[DataFile]) -> CoreResult<()> {
        let id = target.id();
        let relatives = [
            id.as_temp_target().relative_path(),
            id.relative_path(),
            id.sidecar_path(),
            id.mods_path(),
            id.compaction_mods_path(),
        ];
        for relative in &relatives {
            for candidate in self.roots.candidates(relative) {
                self.remove(&candidate)?;
            }
        }
        self.registry.remove(std::slice::from_ref(id));

        for source in sources {
            ModificationLedger::in_flight(source.path()).remove(self.fs)?;
        }
        let source_ids: Vec<FileIdentifier> = sources.iter().map(|s| s.id().clone()).collect();
        self.registry.release(&source_ids);

        info!(
            registry = %self.registry.key(),
            target = %id,
            "[Compaction] rolled back"
        );
        Ok(())
    }

    /// Abort before any target existed: drop the sources' in-flight ledgers.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if a ledger cannot be deleted.
    pub fn abort(&self, sources: &[DataFile]) -> CoreResult<()> {
        for source in sources {
            ModificationLedger::in_flight(source.path()).remove(self.fs)?;
        }
        let source_ids: Vec<FileIdentifier> = sources.iter().map(|s| s.id().clone()).collect();
        self.registry.release(&source_ids);
        Ok(())
    }

    /// Finishes a compaction whose source deletion had already begun.
    ///
    /// Sources are only ever deleted after the target is committed, so the
    /// only work left is cleanup: orphan sidecars, every source ledger, any
    /// remaining source files and, for legacy logs, the registry-wide ledger.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if the committed target cannot be found,
    /// `LegacyMigration` if the legacy ledger cannot be merged, and
    /// `FilesystemMutation` if any delete fails.
    pub fn handle_when_sources_lost(
        &self,
        target: &TargetRef,
        sources: &[FileIdentifier],
        legacy: bool,
    ) -> CoreResult<()> {
        let final_path = match target.file() {
            TargetFile::Final(p) | TargetFile::Committed(p) => p.clone(),
            other => {
                error!(
                    registry = %self.registry.key(),
                    target = %target.id(),
                    state = ?other,
                    "[Compaction] sources are partly deleted but the target is not committed"
                );
                return Err(CoreError::fatal(format!(
                    "sources of {} are partly deleted but the target is not committed",
                    target.id()
                )));
            }
        };

        let mut remaining = Vec::new();
        for source in sources {
            match self.roots.resolve(&source.relative_path()) {
                Some(path) => remaining.push(path),
                None => {
                    if let Some(sidecar) = self.roots.resolve(&source.sidecar_path()) {
                        self.remove(&sidecar)?;
                    }
                }
            }
            for ledger in [source.compaction_mods_path(), source.mods_path()] {
                if let Some(path) = self.roots.resolve(&ledger) {
                    self.remove(&path)?;
                }
            }
        }
        for path in &remaining {
            self.delete_source(path)?;
        }
        self.registry.remove(sources);

        if self
            .registry
            .insert(DataFile::closed(target.id.clone(), final_path.clone()))?
        {
            info!(
                registry = %self.registry.key(),
                target = %final_path.display(),
                "[Compaction] registered committed target"
            );
        }

        if legacy {
            self.migrate_legacy_ledger(&final_path)?;
        }
        Ok(())
    }

    /// Appends the registry-wide legacy ledger to the target's ledger once,
    /// then deletes it. A no-op if no legacy ledger exists.
    fn migrate_legacy_ledger(&self, final_path: &Path) -> CoreResult<()> {
        let target_ledger = ModificationLedger::ordinary(final_path);
        for root in self.roots.roots() {
            let path = self.registry.legacy_mods_path(root, self.legacy_mods_file_name);
            if !self.fs.exists(&path) {
                continue;
            }
            let legacy = ModificationLedger::at(path.clone(), LedgerKind::InFlight);
            let merged = merge_ledgers(self.fs, std::slice::from_ref(&legacy), &target_ledger)
                .map_err(|e| {
                    CoreError::legacy_migration(format!("{}: {e}", path.display()))
                })?;
            legacy.remove(self.fs)?;
            info!(
                registry = %self.registry.key(),
                ledger = %path.display(),
                deletions = merged,
                "[Compaction] migrated legacy ledger"
            );
        }
        Ok(())
    }

    /// Deletes a source's data file, then its sidecar, then both ledgers.
    fn delete_source(&self, data_path: &Path) -> CoreResult<()> {
        self.remove(data_path)?;
        self.remove(&append_suffix(data_path, RESOURCE_SUFFIX))?;
        ModificationLedger::ordinary(data_path).remove(self.fs)?;
        ModificationLedger::in_flight(data_path).remove(self.fs)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> CoreResult<()> {
        self.fs
            .remove_if_exists(path)
            .map(|_| ())
            .map_err(|e| CoreError::mutation("delete", path, e))
    }
}

fn strip_to_final(temp: &Path, id: &FileIdentifier) -> PathBuf {
    temp.with_file_name(&id.file_name)
}
