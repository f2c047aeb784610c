//! Logs and ledgers written by pre-upgrade versions.

use std::sync::Arc;
use tsmerge_core::log::legacy_log_path;
use tsmerge_core::{CoreError, Deletion, LedgerKind, RecoverTask, RecoveryOutcome};
use tsmerge_storage::OsFileSystem;
use tsmerge_testkit::prelude::*;

const S1: &str = "1-1-0-0.tsfile";
const S2: &str = "2-2-0-0.tsfile";
const TARGET: &str = "1-1-1-0.tsfile";

fn stage(layout: &TestLayout) {
    layout.write_data_file(0, S1, b"first source");
    layout.write_data_file(0, S2, b"second source");
    layout.write_ledger(0, S2, LedgerKind::Ordinary, &[Deletion::new("root.sg.d2.s1", 4, 2, 9)]);
    layout.write_data_file(0, TARGET, b"first sourcesecond source");
}

fn legacy_deletions() -> Vec<Deletion> {
    vec![
        Deletion::new("root.sg.d1.s1", 0, 100, 200),
        Deletion::new("root.sg.d1,x.s2", 16, 150, 160),
    ]
}

#[test]
fn lost_sources_migrate_legacy_ledger() {
    let layout = TestLayout::new();
    stage(&layout);
    std::fs::remove_file(layout.path(0, S1)).unwrap();
    let ledger = layout.write_legacy_ledger(0, &legacy_deletions());
    let log = layout.write_legacy_log(0, &[S1, S2], Some(TARGET));

    let (registry, report) = layout.restart();
    assert_eq!(report.logs.len(), 1);
    assert_eq!(report.logs[0].outcome, Ok(RecoveryOutcome::SourcesCleanedUp));
    assert!(!log.exists());
    assert!(!ledger.exists());
    assert_eq!(registered_names(&registry), vec![TARGET]);
    assert_eq!(layout.read_ledger(0, TARGET), legacy_deletions());
}

#[test]
fn legacy_migration_does_not_duplicate() {
    let layout = TestLayout::new();
    stage(&layout);
    std::fs::remove_file(layout.path(0, S1)).unwrap();
    layout.write_ledger(0, TARGET, LedgerKind::Ordinary, &legacy_deletions()[..1]);
    layout.write_legacy_ledger(0, &legacy_deletions());
    layout.write_legacy_log(0, &[S1, S2], Some(TARGET));

    layout.restart();
    assert_eq!(layout.read_ledger(0, TARGET), legacy_deletions());
}

#[test]
fn legacy_abort_keeps_legacy_ledger() {
    let layout = TestLayout::new();
    layout.write_data_file(0, S1, b"first source");
    layout.write_data_file(0, S2, b"second source");
    let ledger = layout.write_legacy_ledger(0, &legacy_deletions());
    let log = layout.write_legacy_log(0, &[S1, S2], Some(TARGET));

    let task = RecoverTask::new(layout.load_registry(), Arc::new(OsFileSystem), layout.config(), log);
    assert!(task.is_legacy());
    assert_eq!(task.recover().unwrap(), RecoveryOutcome::AbortedBeforeMerge);
    assert!(ledger.exists());
    assert_eq!(registered_names(task.registry()), vec![S1, S2]);
}

#[test]
fn torn_legacy_log_is_incomplete() {
    let layout = TestLayout::new();
    stage(&layout);
    let before = layout.snapshot();
    let log = legacy_log_path(layout.root(0), layout.key());
    let text = format!(
        "source\n{}\nsource\n{}\ntarget\n{}",
        layout.path(0, S1).display(),
        layout.path(0, S2).display(),
        layout.path(0, TARGET).display(),
    );
    std::fs::write(&log, text).unwrap();

    let task = RecoverTask::new(layout.load_registry(), Arc::new(OsFileSystem), layout.config(), log.clone());
    let parsed = task.analyze();
    assert!(parsed.legacy);
    assert!(parsed.truncated);
    assert_eq!(parsed.sources.len(), 2);
    assert!(parsed.targets.is_empty());

    assert_eq!(task.recover().unwrap(), RecoveryOutcome::IncompleteLog);
    assert!(!log.exists());
    assert_eq!(layout.snapshot(), before);
}

#[test]
fn corrupt_legacy_ledger_is_fatal() {
    let layout = TestLayout::new();
    stage(&layout);
    std::fs::remove_file(layout.path(0, S1)).unwrap();
    let ledger = layout.group_dir(0).join(tsmerge_core::DEFAULT_LEGACY_MODS_FILE);
    std::fs::write(&ledger, "DELETION,broken\n").unwrap();
    let log = layout.write_legacy_log(0, &[S1, S2], Some(TARGET));

    let task = RecoverTask::new(layout.load_registry(), Arc::new(OsFileSystem), layout.config(), log.clone());
    let err = task.recover().unwrap_err();
    assert!(matches!(err, CoreError::LegacyMigration { .. }), "{err}");
    assert!(log.exists());
    assert!(ledger.exists());
    assert!(!task.registry().is_compaction_allowed());
}

#[test]
fn legacy_logs_are_recovered_first() {
    let layout = TestLayout::new();
    stage(&layout);
    let current = layout.write_current_log(0, &["7-7-0-0.tsfile"], None);
    let legacy = layout.write_legacy_log(0, &[S1, S2], None);

    let (_, report) = layout.restart();
    let order: Vec<_> = report.logs.iter().map(|l| l.log.clone()).collect();
    assert_eq!(order, vec![legacy, current]);
    assert!(report.logs.iter().all(|l| l.outcome == Ok(RecoveryOutcome::IncompleteLog)));
}
