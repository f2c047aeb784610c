//! Core type definitions.

use std::fmt;
use std::path::PathBuf;

/// Ordering category of a data file. Inner compaction only merges files of
/// the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SequenceClass {
    /// Files whose time ranges are ordered and non-overlapping.
    Sequence,
    /// Files that may overlap earlier data.
    Unsequence,
}

impl SequenceClass {
    /// Directory name used for this class under each storage root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Unsequence => "unsequence",
        }
    }

    /// Parses a directory name.
    #[must_use]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "sequence" => Some(Self::Sequence),
            "unsequence" => Some(Self::Unsequence),
            _ => None,
        }
    }

    /// Converts the boolean flag stored in log records.
    #[must_use]
    pub const fn from_flag(sequence: bool) -> Self {
        if sequence {
            Self::Sequence
        } else {
            Self::Unsequence
        }
    }

    /// Returns the boolean flag stored in log records.
    #[must_use]
    pub const fn as_flag(self) -> bool {
        matches!(self, Self::Sequence)
    }
}

impl fmt::Display for SequenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Scope of one file-set registry: logical group, virtual group, time
/// partition and sequence class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    /// Logical group name, e.g. `root.sg`.
    pub logical_group: String,
    /// Virtual group id within the logical group.
    pub virtual_group: String,
    /// Time partition id.
    pub time_partition: i64,
    /// Sequence class.
    pub sequence: SequenceClass,
}

impl RegistryKey {
    /// Creates a registry key.
    #[must_use]
    pub fn new(
        logical_group: impl Into<String>,
        virtual_group: impl Into<String>,
        time_partition: i64,
        sequence: SequenceClass,
    ) -> Self {
        Self {
            logical_group: logical_group.into(),
            virtual_group: virtual_group.into(),
            time_partition,
            sequence,
        }
    }

    /// Directory of the virtual group relative to a storage root.
    ///
    /// Legacy compaction logs and the legacy ledger live here.
    #[must_use]
    pub fn group_dir(&self) -> PathBuf {
        PathBuf::from(self.sequence.dir_name())
            .join(&self.logical_group)
            .join(&self.virtual_group)
    }

    /// Directory of the time partition relative to a storage root.
    #[must_use]
    pub fn partition_dir(&self) -> PathBuf {
        self.group_dir().join(self.time_partition.to_string())
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} [{} {}]",
            self.logical_group, self.virtual_group, self.sequence, self.time_partition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn sequence_flag_roundtrip() {
        assert_eq!(SequenceClass::from_flag(true), SequenceClass::Sequence);
        assert!(!SequenceClass::Unsequence.as_flag());
        assert_eq!(
            SequenceClass::from_dir_name("unsequence"),
            Some(SequenceClass::Unsequence)
        );
        assert_eq!(SequenceClass::from_dir_name("other"), None);
    }

    #[test]
    fn registry_dirs() {
        let key = RegistryKey::new("root.sg", "0", 7, SequenceClass::Sequence);
        assert_eq!(key.group_dir(), Path::new("sequence/root.sg/0"));
        assert_eq!(key.partition_dir(), Path::new("sequence/root.sg/0/7"));
        assert_eq!(key.to_string(), "root.sg-0 [sequence 7]");
    }
}
