//! Compaction log analyzers for the current and legacy formats.

use crate::error::CoreResult;
use crate::identifier::FileIdentifier;
use crate::log::record::{LogRecord, LogRecordKind};
use std::path::Path;
use tracing::debug;
use tsmerge_storage::FileSystem;

const LEGACY_SOURCE_FLAG: &str = "source";
const LEGACY_TARGET_FLAG: &str = "target";
const LEGACY_INFO_FLAGS: [&str; 3] = ["sequence", "unsequence", "full_merge"];

/// The recoverable content of a compaction log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzedLog {
    /// SOURCE records, in log order.
    pub sources: Vec<FileIdentifier>,
    /// TARGET records, in log order.
    pub targets: Vec<FileIdentifier>,
    /// Whether the log was read with the legacy analyzer.
    pub legacy: bool,
    /// Whether parsing stopped before the end of the file.
    pub truncated: bool,
}

impl AnalyzedLog {
    /// The only target recovery consults. Later TARGET records are ignored.
    #[must_use]
    pub fn first_target(&self) -> Option<&FileIdentifier> {
        self.targets.first()
    }

    /// A log is complete once it names at least one source and a target.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.sources.is_empty() && !self.targets.is_empty()
    }
}

/// Parses the log at `path`. A missing or empty log yields an empty result.
///
/// # Errors
///
/// Returns an error only if the file exists but cannot be read.
pub fn parse(fs: &dyn FileSystem, path: &Path, legacy: bool) -> CoreResult<AnalyzedLog> {
    let Some(data) = fs.read(path)? else {
        return Ok(AnalyzedLog {
            legacy,
            ..AnalyzedLog::default()
        });
    };
    let parsed = if legacy {
        parse_legacy(&String::from_utf8_lossy(&data))
    } else {
        parse_current(&data)
    };
    if parsed.truncated {
        debug!(
            log = %path.display(),
            sources = parsed.sources.len(),
            targets = parsed.targets.len(),
            "[Compaction] log ends in an incomplete or corrupt record"
        );
    }
    Ok(parsed)
}

/// Parses framed records until the data ends or a record fails to decode.
#[must_use]
pub fn parse_current(data: &[u8]) -> AnalyzedLog {
    let mut log = AnalyzedLog::default();
    let mut offset = 0;
    while offset < data.len() {
        match LogRecord::decode(&data[offset..]) {
            Ok(Some((record, used))) => {
                match record.kind {
                    LogRecordKind::Source => log.sources.push(record.file),
                    LogRecordKind::Target => log.targets.push(record.file),
                }
                offset += used;
            }
            Ok(None) | Err(_) => {
                log.truncated = true;
                break;
            }
        }
    }
    log
}

/// Parses the legacy line format.
///
/// A flag line must be followed by a path line; a dangling flag, a path that
/// does not name a data file, or an unknown line ends the log.
#[must_use]
pub fn parse_legacy(text: &str) -> AnalyzedLog {
    let mut log = AnalyzedLog {
        legacy: true,
        ..AnalyzedLog::default()
    };
    let complete = match text.rfind('\n') {
        Some(end) => {
            log.truncated = end + 1 < text.len();
            &text[..end]
        }
        None => {
            log.truncated = !text.is_empty();
            return log;
        }
    };

    let mut lines = complete.split('\n').map(|l| l.trim_end_matches('\r'));
    while let Some(line) = lines.next() {
        if line.is_empty() || LEGACY_INFO_FLAGS.contains(&line) {
            continue;
        }
        let kind = match line {
            LEGACY_SOURCE_FLAG => LogRecordKind::Source,
            LEGACY_TARGET_FLAG => LogRecordKind::Target,
            _ => {
                log.truncated = true;
                break;
            }
        };
        let Some(file) = lines
            .next()
            .and_then(|p| FileIdentifier::from_path(Path::new(p)).ok())
        else {
            log.truncated = true;
            break;
        };
        match kind {
            LogRecordKind::Source => log.sources.push(file),
            LogRecordKind::Target => log.targets.push(file),
        }
    }
    log
}
