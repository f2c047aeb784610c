//! Compaction log record types and framing.

use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::identifier::FileIdentifier;

/// Magic bytes identifying a compaction log record.
pub const LOG_MAGIC: [u8; 4] = *b"TCLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4) = 11 bytes
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Kind of a compaction log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordKind {
    /// A file being merged away.
    Source = 1,
    /// The file the sources are merged into.
    Target = 2,
}

impl LogRecordKind {
    /// Converts a byte to a record kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Source),
            2 => Some(Self::Target),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One record of a compaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Whether this names a source or the target.
    pub kind: LogRecordKind,
    /// The referenced data file.
    pub file: FileIdentifier,
}

impl LogRecord {
    /// A SOURCE record.
    #[must_use]
    pub fn source(file: FileIdentifier) -> Self {
        Self {
            kind: LogRecordKind::Source,
            file,
        }
    }

    /// A TARGET record.
    #[must_use]
    pub fn target(file: FileIdentifier) -> Self {
        Self {
            kind: LogRecordKind::Target,
            file,
        }
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit a 4-byte length.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.file.to_info_string().into_bytes();
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.kind.as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Decodes the record starting at the beginning of `data`.
    ///
    /// Returns `Ok(None)` if `data` ends before the record does (a torn
    /// append), otherwise the record and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// Returns `LogFormat` for bad magic, version, kind or payload and
    /// `ChecksumMismatch` for a CRC failure.
    pub fn decode(data: &[u8]) -> CoreResult<Option<(Self, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        if data[0..4] != LOG_MAGIC {
            return Err(CoreError::log_format("invalid record magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_format(format!(
                "unsupported log version: {version}"
            )));
        }
        let kind = LogRecordKind::from_byte(data[6])
            .ok_or_else(|| CoreError::log_format(format!("unknown record kind: {}", data[6])))?;
        let len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;

        let total = HEADER_SIZE + len + CRC_SIZE;
        if data.len() < total {
            return Ok(None);
        }

        let body_end = HEADER_SIZE + len;
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

        let info = std::str::from_utf8(&data[HEADER_SIZE..body_end])
            .map_err(|_| CoreError::log_format("record payload is not UTF-8"))?;
        let file = FileIdentifier::from_info_string(info)
            .map_err(|e| CoreError::log_format(e.to_string()))?;

        Ok(Some((Self { kind, file }, total)))
    }
}
