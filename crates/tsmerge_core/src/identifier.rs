//! Canonical data file references and on-disk naming.
//!
//! A data file lives at
//!
//! ```text
//! <root>/<sequence|unsequence>/<logical group>/<virtual group>/<partition>/<name>.tsfile
//! ```
//!
//! and drags a family of siblings along with it:
//!
//! | Suffix | Meaning |
//! |---|---|
//! | `.tsfile` | committed, readable data file |
//! | `.tsfile.resource` | sidecar describing the data file |
//! | `.tsfile.target` | in-flight merge output, not yet promoted |
//! | `.tsfile.mods` | committed delete ledger |
//! | `.tsfile.compaction.mods` | in-flight delete ledger |
//!
//! Suffix strings are confined to this module; everything else asks a
//! [`FileIdentifier`] for the path it needs.

use crate::error::{CoreError, CoreResult};
use crate::types::{RegistryKey, SequenceClass};
use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Suffix of a committed data file.
pub const TSFILE_SUFFIX: &str = ".tsfile";
/// Suffix appended to a data file path to name its sidecar.
pub const RESOURCE_SUFFIX: &str = ".resource";
/// Suffix appended to a final target name while it is being written.
pub const TEMP_TARGET_SUFFIX: &str = ".target";
/// Suffix appended to a data file path to name its committed ledger.
pub const MODS_SUFFIX: &str = ".mods";
/// Suffix appended to a data file path to name its in-flight ledger.
pub const COMPACTION_MODS_SUFFIX: &str = ".compaction.mods";

/// Separator between fields of an identifier's info string.
const INFO_SEPARATOR: char = ' ';

/// Appends a raw suffix to a path without touching its extension.
#[must_use]
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Canonical reference to a data file.
///
/// Two identifiers are equal iff every field matches. The storage root
/// currently holding the file is deliberately not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentifier {
    /// Logical group name.
    pub logical_group: String,
    /// Virtual group id.
    pub virtual_group: String,
    /// Time partition id.
    pub time_partition: i64,
    /// Sequence class.
    pub sequence: SequenceClass,
    /// File name within the partition directory.
    pub file_name: String,
}

impl FileIdentifier {
    /// Creates an identifier for `file_name` inside the registry `key`.
    #[must_use]
    pub fn new(key: &RegistryKey, file_name: impl Into<String>) -> Self {
        Self {
            logical_group: key.logical_group.clone(),
            virtual_group: key.virtual_group.clone(),
            time_partition: key.time_partition,
            sequence: key.sequence,
            file_name: file_name.into(),
        }
    }

    /// Returns the registry this file belongs to.
    #[must_use]
    pub fn registry_key(&self) -> RegistryKey {
        RegistryKey::new(
            self.logical_group.clone(),
            self.virtual_group.clone(),
            self.time_partition,
            self.sequence,
        )
    }

    /// Path of the file relative to a storage root.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        self.registry_key().partition_dir().join(&self.file_name)
    }

    /// Relative path of the sidecar.
    #[must_use]
    pub fn sidecar_path(&self) -> PathBuf {
        append_suffix(&self.relative_path(), RESOURCE_SUFFIX)
    }

    /// Relative path of the committed ledger.
    #[must_use]
    pub fn mods_path(&self) -> PathBuf {
        append_suffix(&self.relative_path(), MODS_SUFFIX)
    }

    /// Relative path of the in-flight ledger.
    #[must_use]
    pub fn compaction_mods_path(&self) -> PathBuf {
        append_suffix(&self.relative_path(), COMPACTION_MODS_SUFFIX)
    }

    /// Returns true if this names an in-flight merge output.
    #[must_use]
    pub fn is_temp_target(&self) -> bool {
        self.file_name.ends_with(TEMP_TARGET_SUFFIX)
    }

    /// Returns the identifier of the in-flight form of this file.
    #[must_use]
    pub fn as_temp_target(&self) -> Self {
        if self.is_temp_target() {
            return self.clone();
        }
        self.with_file_name(format!("{}{TEMP_TARGET_SUFFIX}", self.file_name))
    }

    /// Returns the identifier of the final (promoted) form of this file.
    #[must_use]
    pub fn as_final(&self) -> Self {
        match self.file_name.strip_suffix(TEMP_TARGET_SUFFIX) {
            Some(stem) => self.with_file_name(stem),
            None => self.clone(),
        }
    }

    /// Returns a copy naming a different file in the same partition.
    #[must_use]
    pub fn with_file_name(&self, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..self.clone()
        }
    }

    /// Parses the trailing five components of an absolute or relative path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the path is too short, the class directory
    /// is unknown or the partition is not an integer.
    pub fn from_path(path: &Path) -> CoreResult<Self> {
        let parts: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        if parts.len() < 5 {
            return Err(CoreError::invalid_format(format!(
                "data file path has too few components: {}",
                path.display()
            )));
        }
        let tail = &parts[parts.len() - 5..];
        let sequence = SequenceClass::from_dir_name(tail[0]).ok_or_else(|| {
            CoreError::invalid_format(format!("unknown sequence directory: {}", tail[0]))
        })?;
        let time_partition = tail[3].parse::<i64>().map_err(|_| {
            CoreError::invalid_format(format!("invalid time partition: {}", tail[3]))
        })?;

        Ok(Self {
            logical_group: tail[1].to_string(),
            virtual_group: tail[2].to_string(),
            time_partition,
            sequence,
            file_name: tail[4].to_string(),
        })
    }

    /// Renders `"<group> <virtual group> <partition> <true|false> <name>"`.
    #[must_use]
    pub fn to_info_string(&self) -> String {
        let sep = INFO_SEPARATOR;
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.logical_group,
            self.virtual_group,
            self.time_partition,
            self.sequence.as_flag(),
            self.file_name
        )
    }

    /// Parses the output of [`Self::to_info_string`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for anything that is not exactly five valid fields.
    pub fn from_info_string(info: &str) -> CoreResult<Self> {
        let fields: Vec<&str> = info.split(INFO_SEPARATOR).collect();
        let [group, virtual_group, partition, flag, name] = fields.as_slice() else {
            return Err(CoreError::invalid_format(format!(
                "expected 5 identifier fields, got {}",
                fields.len()
            )));
        };
        let time_partition = partition
            .parse::<i64>()
            .map_err(|_| CoreError::invalid_format(format!("invalid time partition: {partition}")))?;
        let sequence = match *flag {
            "true" => SequenceClass::Sequence,
            "false" => SequenceClass::Unsequence,
            other => {
                return Err(CoreError::invalid_format(format!(
                    "invalid sequence flag: {other}"
                )))
            }
        };
        if group.is_empty() || virtual_group.is_empty() || name.is_empty() {
            return Err(CoreError::invalid_format("empty identifier field"));
        }

        Ok(Self {
            logical_group: (*group).to_string(),
            virtual_group: (*virtual_group).to_string(),
            time_partition,
            sequence,
            file_name: (*name).to_string(),
        })
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

/// Structured data file name: `{timestamp}-{version}-{inner}-{cross}.tsfile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TsFileName {
    /// Creation timestamp.
    pub timestamp: u64,
    /// Flush version.
    pub version: u64,
    /// Number of inner compactions this file has been through.
    pub inner_level: u32,
    /// Number of cross compactions this file has been through.
    pub cross_level: u32,
}

impl TsFileName {
    /// Parses a data file name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the name does not have four numeric fields.
    pub fn parse(name: &str) -> CoreResult<Self> {
        let stem = name.strip_suffix(TSFILE_SUFFIX).unwrap_or(name);
        let fields: Vec<&str> = stem.split('-').collect();
        let invalid = || CoreError::invalid_format(format!("invalid data file name: {name}"));
        let [timestamp, version, inner, cross] = fields.as_slice() else {
            return Err(invalid());
        };

        Ok(Self {
            timestamp: timestamp.parse().map_err(|_| invalid())?,
            version: version.parse().map_err(|_| invalid())?,
            inner_level: inner.parse().map_err(|_| invalid())?,
            cross_level: cross.parse().map_err(|_| invalid())?,
        })
    }

    /// Name of the file produced by inner-compacting a run starting at `self`.
    #[must_use]
    pub const fn next_inner_level(self) -> Self {
        Self {
            inner_level: self.inner_level + 1,
            ..self
        }
    }

    /// File name without the `.tsfile` suffix.
    #[must_use]
    pub fn stem(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.timestamp, self.version, self.inner_level, self.cross_level
        )
    }
}

impl fmt::Display for TsFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TSFILE_SUFFIX}", self.stem())
    }
}
