//! Verify command implementation.

use tsmerge_core::{
    discover_compaction_logs, CompactionConfig, FileSetRegistry, ModificationLedger, RegistryKey,
    SidecarValidator, TargetValidator, Validation,
};
use tsmerge_storage::OsFileSystem;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of data files checked.
    pub files_checked: usize,
    /// Number of files whose sidecar matches.
    pub valid_files: usize,
    /// Number of files with a bad sidecar or ledger.
    pub corrupt_files: usize,
    /// Compaction logs still waiting for recovery.
    pub pending_logs: usize,
    /// List of errors found.
    pub errors: Vec<String>,
    /// Findings that do not fail verification.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            files_checked: 0,
            valid_files: 0,
            corrupt_files: 0,
            pending_logs: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if no file is corrupt.
    pub fn is_ok(&self) -> bool {
        self.corrupt_files == 0 && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(config: &CompactionConfig, key: RegistryKey) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying {key}");
    println!();

    let result = verify(config, key)?;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every registered data file of `key` without modifying anything.
pub fn verify(
    config: &CompactionConfig,
    key: RegistryKey,
) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let _lock = config.storage_roots().lock_all()?;
    let fs = OsFileSystem;
    let roots = config.storage_roots();
    let mut result = VerifyResult::new();

    for log in discover_compaction_logs(&roots, &key, &fs)? {
        result.pending_logs += 1;
        result
            .warnings
            .push(format!("Unrecovered compaction log: {}", log.display()));
    }

    let registry = FileSetRegistry::load(key, &roots, &fs)?;
    for file in registry.list_files() {
        result.files_checked += 1;
        let mut ok = true;

        match SidecarValidator.validate(&fs, file.path(), &file.sidecar_path())? {
            Validation::Valid => {}
            Validation::Invalid(reason) => {
                result.errors.push(format!("{}: {reason}", file.id()));
                ok = false;
            }
        }

        if let Err(e) = ModificationLedger::ordinary(file.path()).read(&fs) {
            result
                .errors
                .push(format!("{}: unreadable ledger: {e}", file.id()));
            ok = false;
        }

        let in_flight = ModificationLedger::in_flight(file.path());
        if in_flight.exists(&fs) {
            result.warnings.push(format!(
                "{}: leftover in-flight ledger {}",
                file.id(),
                in_flight.path().display()
            ));
        }

        if ok {
            result.valid_files += 1;
        } else {
            result.corrupt_files += 1;
        }
    }

    Ok(result)
}

fn print_result(result: &VerifyResult) {
    println!(
        "  Files checked: {}, valid: {}, corrupt: {}",
        result.files_checked, result.valid_files, result.corrupt_files
    );
    if result.pending_logs > 0 {
        println!("  Pending compaction logs: {}", result.pending_logs);
    }
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
    for warning in &result.warnings {
        println!("    WARNING: {warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsmerge_core::SidecarMeta;
    use tsmerge_testkit::TestLayout;

    #[test]
    fn clean_layout_passes() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"abc");
        layout.write_data_file(0, "2-2-0-0.tsfile", b"defg");

        let result = verify(&layout.config(), layout.key().clone()).unwrap();
        assert_eq!(result.files_checked, 2);
        assert_eq!(result.valid_files, 2);
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn length_mismatch_fails() {
        let layout = TestLayout::new();
        layout.write_data_file_with_meta(
            0,
            "1-1-0-0.tsfile",
            b"abc",
            &SidecarMeta {
                file_len: 99,
                start_time: 0,
                end_time: 10,
                series_count: 1,
            },
        );

        let result = verify(&layout.config(), layout.key().clone()).unwrap();
        assert_eq!(result.corrupt_files, 1);
        assert!(!result.is_ok());
    }

    #[test]
    fn pending_log_is_a_warning() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"abc");
        layout.write_current_log(0, &["1-1-0-0.tsfile"], None);

        let result = verify(&layout.config(), layout.key().clone()).unwrap();
        assert_eq!(result.pending_logs, 1);
        assert!(result.is_ok());
    }
}
