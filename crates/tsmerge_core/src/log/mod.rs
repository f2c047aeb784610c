//! Compaction log: the write-ahead record of one in-flight inner compaction.
//!
//! A log holds one or more SOURCE records followed by TARGET records. It is
//! written before any merge output exists and deleted only once the
//! compaction has been fully committed or aborted, so a log that survives a
//! restart marks exactly one compaction that recovery must resolve.
//!
//! ## Current Record Format
//!
//! ```text
//! | magic "TCLG" (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the identifier's info string,
//! `"<group> <virtual group> <partition> <true|false> <file name>"`.
//!
//! ## Legacy Format
//!
//! Logs written before the upgrade are line-oriented text: a `source` or
//! `target` flag line followed by the file's full path. They are named
//! `<logical group>.compaction.log` and live in the virtual group directory.
//!
//! ## Recovery Policy
//!
//! Unlike the WAL of a database, a compaction log never fails to parse. A
//! truncated frame, bad magic, CRC mismatch or unknown kind ends the log at
//! the last complete record; recovery then sees an incomplete log and
//! aborts, which is always safe.

mod analyzer;
mod record;
mod writer;

pub use analyzer::{parse, parse_current, parse_legacy, AnalyzedLog};
pub use record::{LogRecord, LogRecordKind, LOG_MAGIC, LOG_VERSION};
pub use writer::CompactionLogWriter;

use std::path::{Path, PathBuf};

/// Suffix of a current-format log: `<target stem>.inner-compaction.log`.
pub const CURRENT_LOG_SUFFIX: &str = ".inner-compaction.log";

/// Suffix of a legacy log: `<logical group>.compaction.log`.
pub const LEGACY_LOG_SUFFIX: &str = ".compaction.log";

/// File name of the current-format log for a compaction producing `target_stem`.
#[must_use]
pub fn current_log_name(target_stem: &str) -> String {
    format!("{target_stem}{CURRENT_LOG_SUFFIX}")
}

/// File name of the legacy log of a logical group.
#[must_use]
pub fn legacy_log_name(logical_group: &str) -> String {
    format!("{logical_group}{LEGACY_LOG_SUFFIX}")
}

/// Returns true if `log_path` is a legacy log of the registry named `registry_name`.
///
/// A legacy log name starts with the registry's name and ends in
/// `.compaction.log` but not `.inner-compaction.log`, so a group named like
/// a data file stem cannot claim a current log.
#[must_use]
pub fn is_legacy_log(log_path: &Path, registry_name: &str) -> bool {
    log_path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n.starts_with(registry_name)
                && n.ends_with(LEGACY_LOG_SUFFIX)
                && !n.ends_with(CURRENT_LOG_SUFFIX)
        })
}

/// Returns true if `path` names a compaction log of either format.
#[must_use]
pub fn is_compaction_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(CURRENT_LOG_SUFFIX) || n.ends_with(LEGACY_LOG_SUFFIX))
}

/// Location of the legacy log of the registry's logical group under `root`.
#[must_use]
pub fn legacy_log_path(root: &Path, key: &crate::types::RegistryKey) -> PathBuf {
    root.join(key.group_dir())
        .join(legacy_log_name(&key.logical_group))
}
