//! Recover command implementation.

use serde::Serialize;
use std::sync::Arc;
use tsmerge_core::{recover_registry, CompactionConfig, RegistryKey, StartupReport};
use tsmerge_storage::OsFileSystem;

/// One recovered log for output.
#[derive(Debug, Serialize)]
pub struct LogResult {
    /// Path of the log.
    pub log: String,
    /// Branch taken, e.g. `committed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Error that left the log in place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Recovery summary for output.
#[derive(Debug, Serialize)]
pub struct RecoverSummary {
    /// Registry that was recovered.
    pub registry: String,
    /// Per-log results, legacy logs first.
    pub logs: Vec<LogResult>,
    /// Orphaned temp targets and in-flight ledgers removed.
    pub orphans_removed: usize,
    /// Registered data files after recovery.
    pub files: usize,
    /// Whether compaction may run again.
    pub compaction_allowed: bool,
}

/// Runs the recover command.
pub fn run(
    config: &CompactionConfig,
    key: RegistryKey,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = recover(config, key)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            print_text_output(&summary);
        }
    }

    if summary.compaction_allowed {
        Ok(())
    } else {
        Err("Recovery failed; compaction stays disabled for this registry".into())
    }
}

/// Locks the roots and recovers `key`.
pub fn recover(
    config: &CompactionConfig,
    key: RegistryKey,
) -> Result<RecoverSummary, Box<dyn std::error::Error>> {
    let _lock = config.storage_roots().lock_all()?;
    let name = key.to_string();
    let (registry, report) = recover_registry(key, Arc::new(OsFileSystem), config)?;
    Ok(summarize(name, &report, registry.len(), registry.is_compaction_allowed()))
}

fn summarize(
    registry: String,
    report: &StartupReport,
    files: usize,
    allowed: bool,
) -> RecoverSummary {
    RecoverSummary {
        registry,
        logs: report
            .logs
            .iter()
            .map(|l| LogResult {
                log: l.log.display().to_string(),
                outcome: l.outcome.as_ref().ok().map(ToString::to_string),
                error: l.outcome.as_ref().err().cloned(),
            })
            .collect(),
        orphans_removed: report.orphans_removed,
        files,
        compaction_allowed: allowed,
    }
}

fn print_text_output(summary: &RecoverSummary) {
    println!("Recovering {}", summary.registry);
    println!();
    if summary.logs.is_empty() {
        println!("No compaction logs found");
    }
    for log in &summary.logs {
        match (&log.outcome, &log.error) {
            (Some(outcome), _) => println!("  ✓ {} -> {outcome}", log.log),
            (None, Some(error)) => println!("  ✗ {}: {error}", log.log),
            (None, None) => println!("  ? {}", log.log),
        }
    }
    println!();
    println!("  Orphans removed:    {}", summary.orphans_removed);
    println!("  Registered files:   {}", summary.files);
    println!(
        "  Compaction:         {}",
        if summary.compaction_allowed { "allowed" } else { "DISABLED" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsmerge_testkit::TestLayout;

    #[test]
    fn recovers_and_summarizes() {
        let layout = TestLayout::new();
        layout.write_data_file(0, "1-1-0-0.tsfile", b"a");
        layout.write_data_file(0, "2-2-0-0.tsfile", b"b");
        layout.write_current_log(0, &["1-1-0-0.tsfile", "2-2-0-0.tsfile"], None);

        let summary = recover(&layout.config(), layout.key().clone()).unwrap();
        assert_eq!(summary.logs.len(), 1);
        assert_eq!(summary.logs[0].outcome.as_deref(), Some("incomplete-log"));
        assert_eq!(summary.files, 2);
        assert!(summary.compaction_allowed);
    }

    #[test]
    fn lock_is_released_after_recovery() {
        let layout = TestLayout::new();
        recover(&layout.config(), layout.key().clone()).unwrap();
        assert!(layout.config().storage_roots().lock_all().is_ok());
    }
}
