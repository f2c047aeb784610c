//! Merge collaborator: produces the target's bytes from the sources.
//!
//! The encoding-level merge of time-series data is not part of this crate.
//! Forward compaction only needs something that writes a complete temp
//! target and reports the sidecar metadata describing it.

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::DataFile;
use crate::resource::{read_sidecar, SidecarMeta};
use std::fmt;
use std::path::Path;
use tsmerge_storage::FileSystem;

/// Writes the merged content of `sources` to `temp_target`.
pub trait Merger: Send + Sync + fmt::Debug {
    /// Merges `sources` into a new file at `temp_target` and returns the
    /// metadata its sidecar must carry.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the target cannot be written.
    fn merge(
        &self,
        fs: &dyn FileSystem,
        sources: &[DataFile],
        temp_target: &Path,
    ) -> CoreResult<SidecarMeta>;
}

/// Concatenates source bytes and unions their time ranges.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatMerger;

impl Merger for ConcatMerger {
    fn merge(
        &self,
        fs: &dyn FileSystem,
        sources: &[DataFile],
        temp_target: &Path,
    ) -> CoreResult<SidecarMeta> {
        let mut merged = Vec::new();
        let mut meta: Option<SidecarMeta> = None;
        for source in sources {
            let data = fs.read(source.path())?.ok_or_else(|| {
                CoreError::invalid_operation(format!("source {} is missing", source.id()))
            })?;
            let sidecar = read_sidecar(fs, &source.sidecar_path())?.ok_or_else(|| {
                CoreError::invalid_operation(format!("source {} has no sidecar", source.id()))
            })?;
            merged.extend_from_slice(&data);
            meta = Some(match meta {
                None => sidecar,
                Some(acc) => SidecarMeta {
                    file_len: 0,
                    start_time: acc.start_time.min(sidecar.start_time),
                    end_time: acc.end_time.max(sidecar.end_time),
                    series_count: acc.series_count.max(sidecar.series_count),
                },
            });
        }
        let meta = meta.ok_or_else(|| CoreError::invalid_operation("nothing to merge"))?;

        fs.write(temp_target, &merged)
            .map_err(|e| CoreError::mutation("write", temp_target, e))?;
        Ok(SidecarMeta {
            file_len: merged.len() as u64,
            ..meta
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::FileIdentifier;
    use crate::resource::write_sidecar;
    use crate::types::{RegistryKey, SequenceClass};
    use tempfile::tempdir;
    use tsmerge_storage::OsFileSystem;

    fn source(dir: &Path, name: &str, data: &[u8], start: i64, end: i64) -> DataFile {
        let key = RegistryKey::new("root.sg", "0", 0, SequenceClass::Sequence);
        let file = DataFile::closed(FileIdentifier::new(&key, name), dir.join(name));
        std::fs::write(file.path(), data).unwrap();
        let meta = SidecarMeta {
            file_len: data.len() as u64,
            start_time: start,
            end_time: end,
            series_count: 2,
        };
        write_sidecar(&OsFileSystem, &file.sidecar_path(), &meta).unwrap();
        file
    }

    #[test]
    fn concatenates_and_unions_ranges() {
        let dir = tempdir().unwrap();
        let a = source(dir.path(), "1-1-0-0.tsfile", b"abc", 10, 20);
        let b = source(dir.path(), "2-2-0-0.tsfile", b"de", 5, 15);
        let target = dir.path().join("1-1-1-0.tsfile.target");

        let meta = ConcatMerger.merge(&OsFileSystem, &[a, b], &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcde");
        assert_eq!(meta.file_len, 5);
        assert_eq!((meta.start_time, meta.end_time), (5, 20));
    }

    #[test]
    fn missing_source_fails_without_writing() {
        let dir = tempdir().unwrap();
        let a = source(dir.path(), "1-1-0-0.tsfile", b"abc", 10, 20);
        std::fs::remove_file(a.path()).unwrap();
        let target = dir.path().join("t.target");

        assert!(ConcatMerger.merge(&OsFileSystem, &[a], &target).is_err());
        assert!(!target.exists());
        assert!(ConcatMerger.merge(&OsFileSystem, &[], &target).is_err());
    }
}
