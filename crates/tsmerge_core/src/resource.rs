//! Sidecar (`.tsfile.resource`) format and target validation.
//!
//! ## Sidecar Format
//!
//! ```text
//! | magic "TSRS" (4) | version (2) | file_len (8) | start_time (8) | end_time (8) | series_count (4) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.

use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::path::Path;
use tsmerge_storage::{FileSystem, StorageError};

/// Magic bytes identifying a sidecar.
pub const SIDECAR_MAGIC: [u8; 4] = *b"TSRS";

/// Current sidecar format version.
pub const SIDECAR_VERSION: u16 = 1;

/// Encoded sidecar size.
pub const SIDECAR_SIZE: usize = 4 + 2 + 8 + 8 + 8 + 4 + 4;

/// Metadata describing one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarMeta {
    /// Length of the data file in bytes.
    pub file_len: u64,
    /// Smallest timestamp stored in the file.
    pub start_time: i64,
    /// Largest timestamp stored in the file.
    pub end_time: i64,
    /// Number of series present in the file.
    pub series_count: u32,
}

impl SidecarMeta {
    /// Encodes the sidecar to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SIDECAR_SIZE);
        buf.extend_from_slice(&SIDECAR_MAGIC);
        buf.extend_from_slice(&SIDECAR_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.file_len.to_le_bytes());
        buf.extend_from_slice(&self.start_time.to_le_bytes());
        buf.extend_from_slice(&self.end_time.to_le_bytes());
        buf.extend_from_slice(&self.series_count.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a sidecar.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a wrong size, magic or version and
    /// `ChecksumMismatch` if the CRC does not match.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != SIDECAR_SIZE {
            return Err(CoreError::invalid_format(format!(
                "sidecar is {} bytes, expected {SIDECAR_SIZE}",
                data.len()
            )));
        }
        if data[0..4] != SIDECAR_MAGIC {
            return Err(CoreError::invalid_format("invalid sidecar magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > SIDECAR_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported sidecar version: {version}"
            )));
        }

        let body_end = SIDECAR_SIZE - 4;
        let stored = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed = compute_crc32(&data[..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            bytes
        };
        Ok(Self {
            file_len: u64::from_le_bytes(u64_at(6)),
            start_time: i64::from_le_bytes(u64_at(14)),
            end_time: i64::from_le_bytes(u64_at(22)),
            series_count: u32::from_le_bytes([data[30], data[31], data[32], data[33]]),
        })
    }
}

/// Reads and decodes a sidecar, returning `None` if it does not exist.
///
/// # Errors
///
/// Returns a storage error if the read fails, or a format error if the
/// sidecar does not decode.
pub fn read_sidecar(fs: &dyn FileSystem, path: &Path) -> CoreResult<Option<SidecarMeta>> {
    match fs.read(path)? {
        Some(data) => SidecarMeta::decode(&data).map(Some),
        None => Ok(None),
    }
}

/// Writes a sidecar atomically.
///
/// # Errors
///
/// Returns `FilesystemMutation` if the write fails.
pub fn write_sidecar(fs: &dyn FileSystem, path: &Path, meta: &SidecarMeta) -> CoreResult<()> {
    fs.write_atomic(path, &meta.encode())
        .map_err(|e| CoreError::mutation("write", path, e))
}

/// Outcome of validating a merge target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The target is complete and may be committed.
    Valid,
    /// The target is incomplete or corrupt; the reason is for logging.
    Invalid(String),
}

impl Validation {
    /// Returns true for [`Validation::Valid`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Decides whether a committed-looking target is structurally complete.
///
/// Implementations must return `Err` only when the check itself could not be
/// carried out (an I/O failure); a target that is merely broken is
/// `Ok(Validation::Invalid(..))`.
pub trait TargetValidator: Send + Sync + fmt::Debug {
    /// Validates the data file at `data_path` against the sidecar at `sidecar_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem could not be queried.
    fn validate(
        &self,
        fs: &dyn FileSystem,
        data_path: &Path,
        sidecar_path: &Path,
    ) -> CoreResult<Validation>;
}

/// Default validator: the sidecar must decode, describe a non-inverted time
/// range, and declare exactly the data file's on-disk length.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarValidator;

impl TargetValidator for SidecarValidator {
    fn validate(
        &self,
        fs: &dyn FileSystem,
        data_path: &Path,
        sidecar_path: &Path,
    ) -> CoreResult<Validation> {
        let meta = match read_sidecar(fs, sidecar_path) {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(Validation::Invalid("sidecar missing".into())),
            Err(CoreError::Storage(e)) => return Err(CoreError::Storage(e)),
            Err(e) => return Ok(Validation::Invalid(format!("sidecar unreadable: {e}"))),
        };
        if meta.start_time > meta.end_time {
            return Ok(Validation::Invalid(format!(
                "inverted time range {}..{}",
                meta.start_time, meta.end_time
            )));
        }
        let actual = match fs.file_len(data_path) {
            Ok(len) => len,
            Err(StorageError::MissingPath(_)) => {
                return Ok(Validation::Invalid("data file missing".into()))
            }
            Err(e) => return Err(e.into()),
        };
        if actual != meta.file_len {
            return Ok(Validation::Invalid(format!(
                "sidecar declares {} bytes, file has {actual}",
                meta.file_len
            )));
        }
        Ok(Validation::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tsmerge_storage::OsFileSystem;

    fn meta(file_len: u64) -> SidecarMeta {
        SidecarMeta {
            file_len,
            start_time: 10,
            end_time: 20,
            series_count: 3,
        }
    }

    #[test]
    fn encode_decode() {
        let m = meta(42);
        let encoded = m.encode();
        assert_eq!(encoded.len(), SIDECAR_SIZE);
        assert_eq!(SidecarMeta::decode(&encoded).unwrap(), m);
    }

    #[test]
    fn decode_rejects_corruption() {
        let mut encoded = meta(42).encode();
        encoded[8] ^= 0xFF;
        assert!(matches!(
            SidecarMeta::decode(&encoded),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(SidecarMeta::decode(&encoded[..10]).is_err());
        assert!(SidecarMeta::decode(b"XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX").is_err());
    }

    #[test]
    fn validator_accepts_matching_length() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("t.tsfile");
        let sidecar = dir.path().join("t.tsfile.resource");
        std::fs::write(&data, b"12345").unwrap();
        write_sidecar(&OsFileSystem, &sidecar, &meta(5)).unwrap();

        let v = SidecarValidator.validate(&OsFileSystem, &data, &sidecar).unwrap();
        assert!(v.is_valid());
    }

    #[test]
    fn validator_rejects_length_mismatch() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("t.tsfile");
        let sidecar = dir.path().join("t.tsfile.resource");
        std::fs::write(&data, b"123").unwrap();
        write_sidecar(&OsFileSystem, &sidecar, &meta(5)).unwrap();

        let v = SidecarValidator.validate(&OsFileSystem, &data, &sidecar).unwrap();
        assert!(!v.is_valid());
    }

    #[test]
    fn validator_rejects_missing_or_garbled_sidecar() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("t.tsfile");
        let sidecar = dir.path().join("t.tsfile.resource");
        std::fs::write(&data, b"123").unwrap();

        let v = SidecarValidator.validate(&OsFileSystem, &data, &sidecar).unwrap();
        assert_eq!(v, Validation::Invalid("sidecar missing".into()));

        std::fs::write(&sidecar, b"half a sidecar").unwrap();
        let v = SidecarValidator.validate(&OsFileSystem, &data, &sidecar).unwrap();
        assert!(!v.is_valid());
    }

    #[test]
    fn validator_rejects_inverted_range() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("t.tsfile");
        let sidecar = dir.path().join("t.tsfile.resource");
        std::fs::write(&data, b"123").unwrap();
        let inverted = SidecarMeta {
            start_time: 30,
            ..meta(3)
        };
        write_sidecar(&OsFileSystem, &sidecar, &inverted).unwrap();

        let v = SidecarValidator.validate(&OsFileSystem, &data, &sidecar).unwrap();
        assert!(!v.is_valid());
    }
}
