//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A path that was required to exist is missing.
    #[error("missing path: {}", .0.display())]
    MissingPath(PathBuf),

    /// No storage root has been configured.
    #[error("no storage roots configured")]
    NoRoots,

    /// Another process holds the lock on a storage root.
    #[error("storage root locked: {}", .0.display())]
    Locked(PathBuf),

    /// The backend has been closed.
    #[error("storage is closed")]
    Closed,
}
