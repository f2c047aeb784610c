//! Modification ledgers: append-only records of logical deletes.
//!
//! Every data file may carry two ledgers:
//!
//! - `<file>.mods` - committed deletes that apply to the file
//! - `<file>.compaction.mods` - deletes that arrived while the file was a
//!   compaction source; merged into the target's ledger on commit and
//!   discarded on abort
//!
//! ## Line Format
//!
//! ```text
//! DELETION,<series path>,<file offset>,<start time>,<end time>
//! ```
//!
//! A trailing line without a newline is a torn append and is ignored.

use crate::error::{CoreError, CoreResult};
use crate::identifier::{append_suffix, COMPACTION_MODS_SUFFIX, MODS_SUFFIX};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;
use tsmerge_storage::FileSystem;

const DELETION_TAG: &str = "DELETION";

/// One logical delete of a time range on a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Deletion {
    /// Series path the delete applies to.
    pub path: String,
    /// Length of the data file when the delete was issued.
    pub file_offset: u64,
    /// First deleted timestamp (inclusive).
    pub start_time: i64,
    /// Last deleted timestamp (inclusive).
    pub end_time: i64,
}

impl Deletion {
    /// Creates a deletion record.
    #[must_use]
    pub fn new(path: impl Into<String>, file_offset: u64, start_time: i64, end_time: i64) -> Self {
        Self {
            path: path.into(),
            file_offset,
            start_time,
            end_time,
        }
    }

    /// Parses one ledger line (without its newline).
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the line is not a well-formed deletion.
    pub fn parse_line(line: &str) -> CoreResult<Self> {
        let invalid = || CoreError::invalid_format(format!("invalid ledger line: {line}"));
        let rest = line
            .strip_prefix(DELETION_TAG)
            .and_then(|r| r.strip_prefix(','))
            .ok_or_else(invalid)?;
        // Series paths may contain commas; numeric fields are taken from the right.
        let mut fields = rest.rsplitn(4, ',');
        let end_time = fields.next().ok_or_else(invalid)?;
        let start_time = fields.next().ok_or_else(invalid)?;
        let file_offset = fields.next().ok_or_else(invalid)?;
        let path = fields.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            path: path.to_string(),
            file_offset: file_offset.parse().map_err(|_| invalid())?,
            start_time: start_time.parse().map_err(|_| invalid())?,
            end_time: end_time.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Deletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DELETION_TAG},{},{},{},{}",
            self.path, self.file_offset, self.start_time, self.end_time
        )
    }
}

/// Which of a data file's two ledgers a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    /// `<file>.mods`
    Ordinary,
    /// `<file>.compaction.mods`
    InFlight,
}

/// Handle to one ledger file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationLedger {
    path: PathBuf,
    kind: LedgerKind,
}

impl ModificationLedger {
    /// The committed ledger of the data file at `data_path`.
    #[must_use]
    pub fn ordinary(data_path: &Path) -> Self {
        Self {
            path: append_suffix(data_path, MODS_SUFFIX),
            kind: LedgerKind::Ordinary,
        }
    }

    /// The in-flight ledger of the data file at `data_path`.
    #[must_use]
    pub fn in_flight(data_path: &Path) -> Self {
        Self {
            path: append_suffix(data_path, COMPACTION_MODS_SUFFIX),
            kind: LedgerKind::InFlight,
        }
    }

    /// A ledger at an explicit location, such as the legacy registry-wide file.
    #[must_use]
    pub fn at(path: PathBuf, kind: LedgerKind) -> Self {
        Self { path, kind }
    }

    /// Returns the ledger's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns which ledger this is.
    #[must_use]
    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    /// Returns whether the ledger file exists.
    #[must_use]
    pub fn exists(&self, fs: &dyn FileSystem) -> bool {
        fs.exists(&self.path)
    }

    /// Reads every complete record. A missing ledger is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a complete line is malformed.
    pub fn read(&self, fs: &dyn FileSystem) -> CoreResult<Vec<Deletion>> {
        let Some(data) = fs.read(&self.path)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&data);
        let complete = match text.rfind('\n') {
            Some(end) => &text[..end],
            None => return Ok(Vec::new()),
        };
        complete
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(Deletion::parse_line)
            .collect()
    }

    /// Appends records durably.
    ///
    /// A torn trailing line left by an interrupted append is cut off first, so
    /// new records always start on a fresh line.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the append fails.
    pub fn append(&self, fs: &dyn FileSystem, deletions: &[Deletion]) -> CoreResult<()> {
        if deletions.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for d in deletions {
            buf.push_str(&d.to_string());
            buf.push('\n');
        }

        let existing = fs.read(&self.path)?.unwrap_or_default();
        if existing.last().map_or(true, |&b| b == b'\n') {
            return fs
                .append(&self.path, buf.as_bytes())
                .map_err(|e| CoreError::mutation("append", &self.path, e));
        }

        let keep = existing
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |end| end + 1);
        warn!(
            path = %self.path.display(),
            dropped = existing.len() - keep,
            "[Compaction] truncating torn ledger tail before append"
        );
        let mut data = existing;
        data.truncate(keep);
        data.extend_from_slice(buf.as_bytes());
        fs.write_atomic(&self.path, &data)
            .map_err(|e| CoreError::mutation("append", &self.path, e))
    }

    /// Deletes the ledger if it exists.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemMutation` if the file exists but cannot be removed.
    pub fn remove(&self, fs: &dyn FileSystem) -> CoreResult<bool> {
        fs.remove_if_exists(&self.path)
            .map_err(|e| CoreError::mutation("delete", &self.path, e))
    }
}

/// Appends every record of `sources` that `target` does not already hold.
///
/// Safe to repeat: a second run after a crash appends nothing new.
/// Returns the number of records appended.
///
/// # Errors
///
/// Returns an error if any ledger cannot be read or the append fails.
pub fn merge_ledgers(
    fs: &dyn FileSystem,
    sources: &[ModificationLedger],
    target: &ModificationLedger,
) -> CoreResult<usize> {
    let mut seen: HashSet<Deletion> = target.read(fs)?.into_iter().collect();
    let mut pending = Vec::new();
    for ledger in sources {
        for deletion in ledger.read(fs)? {
            if seen.insert(deletion.clone()) {
                pending.push(deletion);
            }
        }
    }
    target.append(fs, &pending)?;
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;
    use tsmerge_storage::OsFileSystem;

    #[test]
    fn line_roundtrip() {
        let d = Deletion::new("root.sg.d1.s1", 128, -5, 99);
        let line = d.to_string();
        assert_eq!(line, "DELETION,root.sg.d1.s1,128,-5,99");
        assert_eq!(Deletion::parse_line(&line).unwrap(), d);
    }

    #[test]
    fn path_with_commas() {
        let d = Deletion::parse_line("DELETION,root.sg.`a,b`.s,1,2,3").unwrap();
        assert_eq!(d.path, "root.sg.`a,b`.s");
        assert_eq!(d.end_time, 3);
    }

    #[test]
    fn malformed_lines() {
        assert!(Deletion::parse_line("").is_err());
        assert!(Deletion::parse_line("INSERT,a,1,2,3").is_err());
        assert!(Deletion::parse_line("DELETION,,1,2,3").is_err());
        assert!(Deletion::parse_line("DELETION,a,x,2,3").is_err());
        assert!(Deletion::parse_line("DELETION,a,1,2").is_err());
    }

    #[test]
    fn sibling_paths() {
        let data = Path::new("/r/1-1-0-0.tsfile");
        assert_eq!(
            ModificationLedger::ordinary(data).path(),
            Path::new("/r/1-1-0-0.tsfile.mods")
        );
        assert_eq!(
            ModificationLedger::in_flight(data).path(),
            Path::new("/r/1-1-0-0.tsfile.compaction.mods")
        );
    }

    #[test]
    fn append_read_remove() {
        let dir = tempdir().unwrap();
        let fs = OsFileSystem;
        let ledger = ModificationLedger::ordinary(&dir.path().join("a.tsfile"));

        assert!(ledger.read(&fs).unwrap().is_empty());
        ledger
            .append(&fs, &[Deletion::new("s1", 0, 1, 2), Deletion::new("s2", 0, 3, 4)])
            .unwrap();
        ledger.append(&fs, &[Deletion::new("s3", 8, 5, 6)]).unwrap();

        let read = ledger.read(&fs).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2].path, "s3");

        assert!(ledger.remove(&fs).unwrap());
        assert!(!ledger.exists(&fs));
        assert!(!ledger.remove(&fs).unwrap());
    }

    #[test]
    fn torn_trailing_line_is_ignored() {
        let dir = tempdir().unwrap();
        let fs = OsFileSystem;
        let ledger = ModificationLedger::ordinary(&dir.path().join("a.tsfile"));
        std::fs::write(ledger.path(), b"DELETION,s1,0,1,2\nDELETION,s2,0,3").unwrap();

        assert_eq!(ledger.read(&fs).unwrap(), vec![Deletion::new("s1", 0, 1, 2)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempdir().unwrap();
        let fs = OsFileSystem;
        let a = ModificationLedger::ordinary(&dir.path().join("a.tsfile"));
        let a_inflight = ModificationLedger::in_flight(&dir.path().join("a.tsfile"));
        let b = ModificationLedger::ordinary(&dir.path().join("b.tsfile"));
        let target = ModificationLedger::ordinary(&dir.path().join("t.tsfile"));

        a.append(&fs, &[Deletion::new("s1", 0, 1, 2)]).unwrap();
        a_inflight
            .append(&fs, &[Deletion::new("s1", 0, 1, 2), Deletion::new("s9", 4, 0, 9)])
            .unwrap();
        b.append(&fs, &[Deletion::new("s2", 0, 3, 4)]).unwrap();

        let sources = [a.clone(), a_inflight, b, ModificationLedger::ordinary(&dir.path().join("none"))];
        assert_eq!(merge_ledgers(&fs, &sources, &target).unwrap(), 3);
        assert_eq!(merge_ledgers(&fs, &sources, &target).unwrap(), 0);
        assert_eq!(target.read(&fs).unwrap().len(), 3);
    }

    #[test]
    fn append_after_torn_tail_starts_a_new_line() {
        let dir = tempdir().unwrap();
        let fs = OsFileSystem;
        let ledger = ModificationLedger::ordinary(&dir.path().join("a.tsfile"));
        std::fs::write(ledger.path(), b"DELETION,s0,0,0,1\nDELETION,s1,0,1").unwrap();

        ledger.append(&fs, &[Deletion::new("s2", 0, 3, 4)]).unwrap();

        assert_eq!(
            ledger.read(&fs).unwrap(),
            vec![Deletion::new("s0", 0, 0, 1), Deletion::new("s2", 0, 3, 4)]
        );
    }

    #[test]
    fn merge_into_torn_target_keeps_every_deletion() {
        let dir = tempdir().unwrap();
        let fs = OsFileSystem;
        let source = ModificationLedger::in_flight(&dir.path().join("a.tsfile"));
        let target = ModificationLedger::ordinary(&dir.path().join("t.tsfile"));
        source
            .append(
                &fs,
                &[
                    Deletion::new("root.sg.d.s", 0, 1, 2),
                    Deletion::new("root.sg.d.t", 0, 3, 4),
                ],
            )
            .unwrap();
        std::fs::write(target.path(), b"DELETION,root.sg.d.s,0,1").unwrap();

        assert_eq!(merge_ledgers(&fs, &[source], &target).unwrap(), 2);
        assert_eq!(
            target.read(&fs).unwrap(),
            vec![
                Deletion::new("root.sg.d.s", 0, 1, 2),
                Deletion::new("root.sg.d.t", 0, 3, 4),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_line_roundtrip(
            path in "[a-z][a-z0-9.,]{0,20}",
            offset in any::<u64>(),
            start in any::<i64>(),
            end in any::<i64>(),
        ) {
            let d = Deletion::new(path, offset, start, end);
            prop_assert_eq!(Deletion::parse_line(&d.to_string()).unwrap(), d);
        }
    }
}
