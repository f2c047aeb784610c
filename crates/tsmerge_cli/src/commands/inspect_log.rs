//! Inspect-log command implementation.

use serde::Serialize;
use std::path::Path;
use tsmerge_core::log::{self, AnalyzedLog, LEGACY_LOG_SUFFIX};
use tsmerge_storage::OsFileSystem;

/// Decoded compaction log for output.
#[derive(Debug, Serialize)]
pub struct LogInfo {
    /// Path of the log.
    pub path: String,
    /// `current` or `legacy`.
    pub format: &'static str,
    /// Source files, relative to their storage root.
    pub sources: Vec<String>,
    /// Target files, relative to their storage root.
    pub targets: Vec<String>,
    /// Whether parsing stopped at a torn or corrupt record.
    pub truncated: bool,
    /// Whether recovery would act on this log rather than just delete it.
    pub complete: bool,
}

impl LogInfo {
    fn new(path: &Path, parsed: &AnalyzedLog) -> Self {
        Self {
            path: path.display().to_string(),
            format: if parsed.legacy { "legacy" } else { "current" },
            sources: parsed.sources.iter().map(ToString::to_string).collect(),
            targets: parsed.targets.iter().map(ToString::to_string).collect(),
            truncated: parsed.truncated,
            complete: parsed.is_complete(),
        }
    }
}

/// Runs the inspect-log command.
pub fn run(path: &Path, legacy: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("Log file not found: {}", path.display()).into());
    }
    let info = inspect(path, legacy)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        _ => {
            print_text_output(&info);
        }
    }
    Ok(())
}

/// Decodes the log at `path`, detecting the legacy format from its name
/// unless `legacy` forces it.
pub fn inspect(path: &Path, legacy: bool) -> Result<LogInfo, Box<dyn std::error::Error>> {
    let legacy = legacy
        || path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(LEGACY_LOG_SUFFIX));
    let parsed = log::parse(&OsFileSystem, path, legacy)?;
    Ok(LogInfo::new(path, &parsed))
}

fn print_text_output(info: &LogInfo) {
    println!("Compaction log {} ({} format)", info.path, info.format);
    println!();
    println!("Sources ({}):", info.sources.len());
    for source in &info.sources {
        println!("  {source}");
    }
    println!("Targets ({}):", info.targets.len());
    for target in &info.targets {
        println!("  {target}");
    }
    if info.targets.len() > 1 {
        println!("  (only the first target is used by recovery)");
    }
    println!();
    if info.truncated {
        println!("Log ends in a torn or corrupt record");
    }
    if info.complete {
        println!("Recovery will resolve this compaction");
    } else {
        println!("Log is incomplete; recovery will only delete it");
    }
}
