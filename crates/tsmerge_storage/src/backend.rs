//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Backends are **opaque**: they do not interpret the bytes handed to them.
/// Compaction log writers frame their own records and push them through a
/// backend so that tests can swap in memory-backed or torn-write backends.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - after `sync` returns, every previously appended byte survives a crash
/// - backends must be `Send + Sync`
pub trait StorageBackend: Send + Sync {
    /// Appends data to the end of the storage, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes all appended data and file metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
