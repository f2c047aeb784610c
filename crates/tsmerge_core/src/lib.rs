//! # tsmerge Core
//!
//! Crash-safe inner compaction for closed time-series data files.
//!
//! This crate provides:
//! - Data file identifiers, naming and lifecycle states
//! - Sidecar format and target validation
//! - Modification ledgers
//! - The compaction log and its current and legacy analyzers
//! - Per-partition file-set registries with a compaction circuit breaker
//! - Forward compaction, recovery, and the commit/rollback logic they share
//!
//! ## Crash Safety
//!
//! Every compaction is journaled before it touches anything. After an
//! unclean shutdown, [`RecoverTask`] reads the surviving log, probes the
//! storage roots, and completes either "never happened" or "fully
//! committed", never a mix of the two.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tsmerge_core::{recover_registry, CompactionConfig, RegistryKey, SequenceClass};
//! use tsmerge_storage::OsFileSystem;
//!
//! let config = CompactionConfig::new().data_dirs(vec!["/data".into()]);
//! let key = RegistryKey::new("root.sg", "0", 0, SequenceClass::Sequence);
//! let (registry, report) = recover_registry(key, Arc::new(OsFileSystem), &config)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod config;
mod error;
mod forward;
mod handler;
mod identifier;
mod ledger;
mod lifecycle;
pub mod log;
mod merge;
mod recover;
mod registry;
mod resource;
mod startup;
mod task;
mod types;

pub use checksum::compute_crc32;
pub use config::{CompactionConfig, DEFAULT_LEGACY_MODS_FILE};
pub use error::{CoreError, CoreResult};
pub use forward::{CompactionCheckpoint, ForwardCompactionTask, ForwardOutcome};
pub use handler::{CommittedTarget, ExceptionHandler, Resolution, TargetRef};
pub use identifier::{
    append_suffix, FileIdentifier, TsFileName, COMPACTION_MODS_SUFFIX, MODS_SUFFIX,
    RESOURCE_SUFFIX, TEMP_TARGET_SUFFIX, TSFILE_SUFFIX,
};
pub use ledger::{merge_ledgers, Deletion, LedgerKind, ModificationLedger};
pub use lifecycle::{DataFile, SourceState, TargetFile};
pub use log::{AnalyzedLog, CompactionLogWriter, LogRecord, LogRecordKind};
pub use merge::{ConcatMerger, Merger};
pub use recover::{RecoverTask, RecoveryOutcome};
pub use registry::FileSetRegistry;
pub use resource::{
    read_sidecar, write_sidecar, SidecarMeta, SidecarValidator, TargetValidator, Validation,
    SIDECAR_MAGIC, SIDECAR_SIZE, SIDECAR_VERSION,
};
pub use startup::{
    discover_compaction_logs, recover_registry, sweep_orphan_artifacts, LogRecovery,
    StartupReport,
};
pub use task::{CompactionTask, TaskOutcome, TaskQueue};
pub use types::{RegistryKey, SequenceClass};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
