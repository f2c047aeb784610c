//! Data file and merge target lifecycles.
//!
//! ```text
//! source:  Closed -> SelectedSource -> Deleted        (compaction committed)
//!                                   -> Closed         (aborted / rolled back)
//!
//! target:  None -> Temp -> Final -> Committed
//! ```
//!
//! A crash before `Committed` resolves the target to `None` on recovery.

use crate::error::{CoreError, CoreResult};
use crate::identifier::{append_suffix, FileIdentifier, RESOURCE_SUFFIX, TEMP_TARGET_SUFFIX};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle state of a source data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Closed, has a sidecar, visible in the registry.
    Closed,
    /// Referenced by exactly one in-flight compaction, still readable.
    SelectedSource,
    /// Removed after a committed compaction.
    Deleted,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::SelectedSource => "selected",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A data file resolved to an absolute location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    id: FileIdentifier,
    path: PathBuf,
    state: SourceState,
}

impl DataFile {
    /// Creates a closed data file at `path`.
    #[must_use]
    pub fn closed(id: FileIdentifier, path: PathBuf) -> Self {
        Self {
            id,
            path,
            state: SourceState::Closed,
        }
    }

    /// Returns the canonical identifier.
    #[must_use]
    pub fn id(&self) -> &FileIdentifier {
        &self.id
    }

    /// Returns the absolute path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the absolute path of the sidecar.
    #[must_use]
    pub fn sidecar_path(&self) -> PathBuf {
        append_suffix(&self.path, RESOURCE_SUFFIX)
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SourceState {
        self.state
    }

    /// `Closed -> SelectedSource`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the file is not closed.
    pub fn select(&mut self) -> CoreResult<()> {
        self.transition(SourceState::Closed, SourceState::SelectedSource)
    }

    /// `SelectedSource -> Closed`, after an abort or rollback.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the file is not selected.
    pub fn release(&mut self) -> CoreResult<()> {
        self.transition(SourceState::SelectedSource, SourceState::Closed)
    }

    /// Returns a selected file to `Closed` and reports whether it was
    /// selected. Closed and deleted files are left as they are.
    pub fn release_if_selected(&mut self) -> bool {
        match self.state {
            SourceState::SelectedSource => {
                self.state = SourceState::Closed;
                true
            }
            SourceState::Closed | SourceState::Deleted => false,
        }
    }

    /// `SelectedSource -> Deleted`, after a commit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the file is not selected.
    pub fn mark_deleted(&mut self) -> CoreResult<()> {
        self.transition(SourceState::SelectedSource, SourceState::Deleted)
    }

    fn transition(&mut self, from: SourceState, to: SourceState) -> CoreResult<()> {
        if self.state != from {
            return Err(CoreError::invalid_operation(format!(
                "{} is {}, cannot move to {to}",
                self.id, self.state
            )));
        }
        self.state = to;
        Ok(())
    }
}

/// Lifecycle state of a merge target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetFile {
    /// No merge output exists.
    #[default]
    None,
    /// Partially written output at its temporary name; unsafe to read.
    Temp(PathBuf),
    /// Fully written output at its final name, not yet registered.
    Final(PathBuf),
    /// Sidecar written and registered; readable.
    Committed(PathBuf),
}

impl TargetFile {
    /// Probes the filesystem for the target: temp name first, then final.
    #[must_use]
    pub fn probe(temp: Option<PathBuf>, final_path: Option<PathBuf>) -> Self {
        match (temp, final_path) {
            (Some(temp), _) => Self::Temp(temp),
            (None, Some(final_path)) => Self::Final(final_path),
            (None, None) => Self::None,
        }
    }

    /// Returns the path of the target in its current state.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::None => None,
            Self::Temp(p) | Self::Final(p) | Self::Committed(p) => Some(p),
        }
    }

    /// Returns the path the target has (or will have) once promoted.
    #[must_use]
    pub fn final_path(&self) -> Option<PathBuf> {
        match self {
            Self::None => None,
            Self::Temp(p) => Some(strip_temp_suffix(p)),
            Self::Final(p) | Self::Committed(p) => Some(p.clone()),
        }
    }

    /// Returns true if no merge output exists.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// `None -> Temp` once the merge starts writing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` from any other state.
    pub fn begin_write(&mut self, temp: PathBuf) -> CoreResult<()> {
        match self {
            Self::None => {
                *self = Self::Temp(temp);
                Ok(())
            }
            other => Err(invalid_target_transition(other, "temp")),
        }
    }

    /// `Temp -> Final` once the output has been renamed into place.
    /// A target already at `Final` stays there.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` from `None` or `Committed`.
    pub fn promote(&mut self) -> CoreResult<()> {
        match self {
            Self::Temp(p) => {
                *self = Self::Final(strip_temp_suffix(p));
                Ok(())
            }
            Self::Final(_) => Ok(()),
            other => Err(invalid_target_transition(other, "final")),
        }
    }

    /// `Final -> Committed` once the registry holds the target.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless the target is `Final`.
    pub fn commit(&mut self) -> CoreResult<()> {
        match self {
            Self::Final(p) => {
                *self = Self::Committed(std::mem::take(p));
                Ok(())
            }
            other => Err(invalid_target_transition(other, "committed")),
        }
    }
}

fn invalid_target_transition(from: &TargetFile, to: &str) -> CoreError {
    CoreError::invalid_operation(format!("target cannot move from {from:?} to {to}"))
}

fn strip_temp_suffix(path: &Path) -> PathBuf {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(TEMP_TARGET_SUFFIX))
        .map_or_else(|| path.to_path_buf(), |stem| path.with_file_name(stem))
}
