//! Error types for tsmerge core.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tsmerge_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while compacting or recovering a registry.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage layer error outside of a tracked mutation.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Compaction log is missing, empty or unparseable.
    #[error("compaction log format error: {message}")]
    LogFormat {
        /// Description of the problem.
        message: String,
    },

    /// A committed-looking target failed structural validation.
    #[error("target validation failed for {}: {message}", path.display())]
    TargetValidation {
        /// Target data file.
        path: PathBuf,
        /// Why it was rejected.
        message: String,
    },

    /// A required delete, rename or write did not succeed.
    #[error("failed to {op} {}: {source}", path.display())]
    FilesystemMutation {
        /// The operation attempted (`delete`, `rename`, `write`, ...).
        op: &'static str,
        /// The path the operation targeted.
        path: PathBuf,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// Migrating a pre-upgrade ledger failed.
    #[error("legacy ledger migration failed: {message}")]
    LegacyMigration {
        /// Description of the failure.
        message: String,
    },

    /// Commit/rollback could not be decided; the registry must stop compacting.
    #[error("compaction fatal: {reason}")]
    Fatal {
        /// Why the decision could not be made.
        reason: String,
    },

    /// Invalid on-disk format (identifier, sidecar, file name).
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The registry's circuit breaker is open.
    #[error("compaction disabled for registry {registry}")]
    CompactionDisabled {
        /// Registry display name.
        registry: String,
    },

    /// A forward task was halted at a checkpoint to simulate process death.
    #[error("simulated crash after {checkpoint}")]
    SimulatedCrash {
        /// The checkpoint that was reached.
        checkpoint: String,
    },
}

impl CoreError {
    /// Creates a log format error.
    pub fn log_format(message: impl Into<String>) -> Self {
        Self::LogFormat {
            message: message.into(),
        }
    }

    /// Creates a target validation error.
    pub fn target_validation(path: &Path, message: impl Into<String>) -> Self {
        Self::TargetValidation {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Creates a filesystem mutation error.
    pub fn mutation(op: &'static str, path: &Path, source: StorageError) -> Self {
        Self::FilesystemMutation {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Creates a legacy migration error.
    pub fn legacy_migration(message: impl Into<String>) -> Self {
        Self::LegacyMigration {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for the simulated-crash error used by crash tests.
    #[must_use]
    pub fn is_simulated_crash(&self) -> bool {
        matches!(self, Self::SimulatedCrash { .. })
    }
}
