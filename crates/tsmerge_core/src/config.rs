//! Compaction configuration.

use std::path::PathBuf;
use tsmerge_storage::StorageRoots;

/// Default name of the registry-wide ledger written by pre-upgrade versions.
pub const DEFAULT_LEGACY_MODS_FILE: &str = "compaction.mods";

/// Configuration shared by forward and recovery tasks.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Storage roots, searched in order when resolving relative paths.
    pub data_dirs: Vec<PathBuf>,

    /// Maximum number of source files merged by one forward task.
    pub max_source_files: usize,

    /// Minimum number of candidates before a forward task is worth running.
    pub min_source_files: usize,

    /// Whether to sync the compaction log after every record.
    pub sync_on_write: bool,

    /// File name of the registry-wide ledger left behind by legacy versions.
    pub legacy_mods_file_name: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            data_dirs: Vec::new(),
            max_source_files: 10,
            min_source_files: 2,
            sync_on_write: true,
            legacy_mods_file_name: DEFAULT_LEGACY_MODS_FILE.to_string(),
        }
    }
}

impl CompactionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the storage roots.
    #[must_use]
    pub fn data_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.data_dirs = dirs;
        self
    }

    /// Sets the maximum number of sources per forward task.
    #[must_use]
    pub const fn max_source_files(mut self, value: usize) -> Self {
        self.max_source_files = value;
        self
    }

    /// Sets the minimum number of sources per forward task.
    #[must_use]
    pub const fn min_source_files(mut self, value: usize) -> Self {
        self.min_source_files = value;
        self
    }

    /// Sets whether to sync the compaction log after every record.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the legacy registry-wide ledger file name.
    #[must_use]
    pub fn legacy_mods_file_name(mut self, name: impl Into<String>) -> Self {
        self.legacy_mods_file_name = name.into();
        self
    }

    /// Builds the path resolver for the configured roots.
    #[must_use]
    pub fn storage_roots(&self) -> StorageRoots {
        StorageRoots::new(self.data_dirs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CompactionConfig::default();
        assert!(config.sync_on_write);
        assert_eq!(config.min_source_files, 2);
        assert_eq!(config.legacy_mods_file_name, "compaction.mods");
    }

    #[test]
    fn builder_pattern() {
        let config = CompactionConfig::new()
            .data_dirs(vec!["/a".into(), "/b".into()])
            .max_source_files(4)
            .sync_on_write(false);

        assert_eq!(config.max_source_files, 4);
        assert!(!config.sync_on_write);
        assert_eq!(config.storage_roots().len(), 2);
    }
}
