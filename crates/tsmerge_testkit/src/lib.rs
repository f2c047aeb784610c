//! # tsmerge Testkit
//!
//! Test utilities for tsmerge.
//!
//! This crate provides:
//! - On-disk layouts with data files, sidecars, ledgers and compaction logs
//! - Disk snapshots for comparing outcomes
//! - A fault-injecting [`FileSystem`](tsmerge_storage::FileSystem)
//! - Torn-write backends and a kill-at-every-checkpoint crash matrix
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tsmerge_testkit::prelude::*;
//!
//! #[test]
//! fn every_crash_point_recovers() {
//!     let results = CrashMatrix::new(3).run();
//!     assert!(results.iter().all(|r| r.passed));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faulty;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
