//! # tsmerge Storage
//!
//! Lowest-level storage layer for the tsmerge compaction engine.
//!
//! This crate knows nothing about data files, sidecars, ledgers or
//! compaction logs. It provides:
//!
//! - [`StorageBackend`] - append-only byte stores used by log writers
//!   ([`FileBackend`], [`InMemoryBackend`])
//! - [`FileSystem`] - the seam through which every filesystem mutation made
//!   by compaction and recovery flows ([`OsFileSystem`])
//! - [`StorageRoots`] - ordered storage roots resolving relative paths,
//!   first existing match wins
//!
//! ## Example
//!
//! ```rust
//! use tsmerge_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record").unwrap();
//! assert_eq!(offset, 0);
//! assert_eq!(backend.size().unwrap(), 6);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod fs;
mod memory;
mod roots;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use fs::{FileSystem, OsFileSystem};
pub use memory::InMemoryBackend;
pub use roots::{RootsLock, StorageRoots};
