//! Compact command implementation.

use std::sync::Arc;
use tsmerge_core::{
    recover_registry, CompactionConfig, FileIdentifier, ForwardCompactionTask, ForwardOutcome,
    RegistryKey,
};
use tsmerge_storage::OsFileSystem;

/// Runs the compact command.
///
/// Leftover logs are recovered first, so a half-finished compaction is never
/// merged again.
pub fn run(
    config: &CompactionConfig,
    key: RegistryKey,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting {key}");
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    match compact(config, key, dry_run)? {
        None => {
            println!("No compaction needed - not enough files at one level");
        }
        Some((sources, outcome)) => {
            println!("Sources ({}):", sources.len());
            for source in &sources {
                println!("  {source}");
            }
            println!();
            match outcome {
                None => {}
                Some(ForwardOutcome::Committed(target)) => {
                    println!("✓ Compaction complete: {}", target.display());
                }
                Some(other) => {
                    println!("✗ Compaction failed and was undone ({other:?})");
                    return Err("Compaction failed".into());
                }
            }
        }
    }
    Ok(())
}

/// Chosen sources and, unless `dry_run`, how the merge ended.
pub type CompactReport = Option<(Vec<FileIdentifier>, Option<ForwardOutcome>)>;

/// Locks the roots, recovers `key` and merges one run of candidates.
pub fn compact(
    config: &CompactionConfig,
    key: RegistryKey,
    dry_run: bool,
) -> Result<CompactReport, Box<dyn std::error::Error>> {
    let _lock = config.storage_roots().lock_all()?;
    let fs = Arc::new(OsFileSystem);
    let (registry, report) = recover_registry(key, fs.clone(), config)?;
    if !registry.is_compaction_allowed() {
        for failed in report.logs.iter().filter(|l| l.outcome.is_err()) {
            println!("  ✗ {}", failed.log.display());
        }
        return Err("Compaction is disabled; run `tsmerge recover` first".into());
    }

    let Some(sources) = ForwardCompactionTask::select_candidates(&registry, config) else {
        return Ok(None);
    };
    if dry_run {
        return Ok(Some((sources, None)));
    }

    let task = ForwardCompactionTask::new(registry, fs, config.clone(), sources.clone());
    let outcome = task.run()?;
    Ok(Some((sources, Some(outcome))))
}
