//! Fault injection: failures that cannot be resolved open the circuit
//! breaker and keep the log; failures that can be resolved are.

use std::sync::Arc;
use tsmerge_core::{
    CompactionTask, CoreError, Deletion, ForwardCompactionTask, ForwardOutcome, LedgerKind,
    RecoverTask, RecoveryOutcome, TaskQueue,
};
use tsmerge_storage::FileSystem;
use tsmerge_testkit::prelude::*;

const S1: &str = "1-1-0-0.tsfile";
const S2: &str = "2-2-0-0.tsfile";
const TARGET: &str = "1-1-1-0.tsfile";
const TEMP_TARGET: &str = "1-1-1-0.tsfile.target";

fn stage_sources(layout: &TestLayout) {
    layout.write_data_file(0, S1, b"first source");
    layout.write_data_file(0, S2, b"second source");
    layout.write_ledger(0, S1, LedgerKind::Ordinary, &[Deletion::new("root.sg.d1.s1", 0, 1, 5)]);
    layout.delete_during_compaction(0, S2, &Deletion::new("root.sg.d2.s1", 4, 2, 9));
}

fn faulty() -> (Arc<FaultyFileSystem>, Arc<parking_lot::Mutex<FaultConfig>>) {
    let fs = Arc::new(FaultyFileSystem::new());
    let cfg = fs.cfg();
    (fs, cfg)
}

fn forward(layout: &TestLayout, fs: Arc<dyn FileSystem>) -> ForwardCompactionTask {
    let registry = layout.load_registry();
    let config = layout.config();
    let sources = ForwardCompactionTask::select_candidates(&registry, &config).unwrap();
    ForwardCompactionTask::new(registry, fs, config, sources)
}

#[test]
fn failed_cleanup_keeps_log_and_retries() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    layout.write_data_file(0, TARGET, b"first sourcesecond source");
    std::fs::remove_file(layout.path(0, S1)).unwrap();
    let log = layout.write_current_log(0, &[S1, S2], Some(TEMP_TARGET));

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Remove, S2);
    let task = RecoverTask::new(layout.load_registry(), fs, layout.config(), log.clone());

    let err = task.recover().unwrap_err();
    assert!(matches!(err, CoreError::FilesystemMutation { .. }), "{err}");
    assert!(log.exists());
    assert!(!task.registry().is_compaction_allowed());

    cfg.lock().clear();
    assert_eq!(task.recover().unwrap(), RecoveryOutcome::SourcesCleanedUp);
    assert!(!log.exists());

    let (registry, report) = layout.restart();
    assert!(report.logs.is_empty());
    assert!(registry.is_compaction_allowed());
    assert_eq!(registered_names(&registry), vec![TARGET]);
}

#[test]
fn failed_log_delete_disables_but_reports_outcome() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    layout.write_data_file(0, TARGET, b"first sourcesecond source");
    let log = layout.write_current_log(0, &[S1, S2], Some(TEMP_TARGET));

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Remove, ".inner-compaction.log");
    let task = RecoverTask::new(layout.load_registry(), fs, layout.config(), log.clone());

    assert_eq!(task.recover().unwrap(), RecoveryOutcome::Committed);
    assert!(log.exists());
    assert!(!task.registry().is_compaction_allowed());

    let (registry, report) = layout.restart();
    assert_eq!(report.logs[0].outcome, Ok(RecoveryOutcome::SourcesCleanedUp));
    assert!(!log.exists());
    assert_eq!(registered_names(&registry), vec![TARGET]);
}

#[test]
fn startup_failure_leaves_registry_disabled() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    layout.write_data_file(0, TARGET, b"first sourcesecond source");
    layout.write_raw(0, "5-5-1-0.tsfile.target", b"orphan");
    layout.write_current_log(0, &[S1, S2], Some(TEMP_TARGET));

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Remove, S1);
    let (registry, report) = layout.restart_with(fs);

    assert!(report.logs[0].outcome.is_err());
    assert!(!registry.is_compaction_allowed());
    assert_eq!(report.orphans_removed, 0);
    assert!(layout.path(0, "5-5-1-0.tsfile.target").exists());
}

#[test]
fn merge_failure_aborts_forward_task() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    let before = layout.snapshot();

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Write, ".target");
    let task = forward(&layout, fs);

    assert_eq!(task.run().unwrap(), ForwardOutcome::Aborted);
    assert!(task.registry().is_compaction_allowed());
    assert!(task.is_valid_to_run());
    assert_eq!(layout.snapshot(), before.without_suffix(".compaction.mods"));
}

#[test]
fn sidecar_failure_rolls_back_forward_task() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    let before = layout.snapshot();

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Write, ".resource");
    let task = forward(&layout, fs);

    assert_eq!(task.run().unwrap(), ForwardOutcome::RolledBack);
    assert!(task.registry().is_compaction_allowed());
    assert_eq!(registered_names(task.registry()), vec![S1, S2]);
    assert_eq!(layout.snapshot(), before.without_suffix(".compaction.mods"));
}

#[test]
fn persistent_delete_failure_is_finished_by_restart() {
    let layout = TestLayout::new();
    stage_sources(&layout);

    let (fs, cfg) = faulty();
    cfg.lock().fail(FsOp::Remove, S1);
    let task = forward(&layout, fs);

    let err = task.run().unwrap_err();
    assert!(matches!(err, CoreError::FilesystemMutation { .. }), "{err}");
    assert!(!task.registry().is_compaction_allowed());
    assert!(layout.path(0, "1-1-1-0.inner-compaction.log").exists());

    let (registry, report) = layout.restart();
    assert_eq!(report.logs[0].outcome, Ok(RecoveryOutcome::Committed));
    assert!(registry.is_compaction_allowed());
    assert_eq!(registered_names(&registry), vec![TARGET]);
    assert!(!layout.path(0, S1).exists());
    assert_eq!(layout.read_ledger(0, TARGET).len(), 2);
}

#[test]
fn disabled_registry_rejects_forward_work() {
    let layout = TestLayout::new();
    stage_sources(&layout);
    let task = forward(&layout, Arc::new(tsmerge_storage::OsFileSystem));
    task.registry().set_allow_compaction(false);

    assert!(!task.is_valid_to_run());
    assert!(matches!(task.run(), Err(CoreError::CompactionDisabled { .. })));

    let queue = TaskQueue::new();
    assert!(queue.submit(CompactionTask::Forward(task)));
    assert!(queue.next_runnable().is_none());
    assert!(queue.is_empty());
}
