//! Crash recovery testing for tsmerge.
//!
//! This module simulates a process kill at every point where a forward
//! compaction leaves observable state on disk, restarts, and verifies that
//! recovery lands on exactly one of two states: the compaction never happened
//! or it fully committed.
//!
//! ## Test Strategy
//!
//! 1. **Kill at a checkpoint** - [`CrashMatrix`] halts the task after each
//!    [`CompactionCheckpoint`] and compares the recovered disk with
//!    references produced by a clean run
//! 2. **Torn log write** - [`CrashableBackend`] cuts a log record short
//! 3. **Repeated recovery** - a second restart must find nothing to do
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tsmerge_testkit::crash::CrashMatrix;
//!
//! let matrix = CrashMatrix::new(3);
//! let results = matrix.run();
//! assert!(results.iter().all(|r| r.passed), "{}", CrashMatrix::summary(&results));
//! ```

use crate::fixtures::{registered_names, DiskSnapshot, TestLayout};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tsmerge_core::{
    CompactionCheckpoint, Deletion, ForwardCompactionTask, ForwardOutcome, COMPACTION_MODS_SUFFIX,
};
use tsmerge_storage::{FileSystem, OsFileSystem, StorageBackend, StorageError, StorageResult};

/// State a crashed compaction must be recovered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedState {
    /// Sources intact and registered, no target artifacts.
    NeverHappened,
    /// Target registered with merged ledgers, sources gone.
    Committed,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// State recovery had to reach.
    pub expected: ExpectedState,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, expected: ExpectedState) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: ExpectedState, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected,
            error: Some(error.to_string()),
        }
    }
}

/// A storage backend wrapper that can simulate crashes.
///
/// Once the byte budget is exhausted the record being appended is cut short
/// and every later append fails, as if the process had died mid-write.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: Arc<AtomicBool>,
    fail_on_sync: AtomicBool,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: Arc::new(AtomicBool::new(false)),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Sets the backend to crash after writing the specified number of bytes.
    pub fn crash_after(&self, bytes: usize) {
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush and sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        self.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Flag that stays readable after the backend is boxed and moved away.
    pub fn crash_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.crashed)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::new(io::ErrorKind::Other, format!("simulated crash during {what}")))
    }
}

impl StorageBackend for CrashableBackend {
    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.crash("write"));
        }
        if current + data.len() > threshold {
            let partial = threshold - current;
            let _ = self.inner.append(&data[..partial]);
            let _ = self.inner.flush();
            return Err(self.crash("partial write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }
}

/// Kills a forward compaction at every checkpoint and checks recovery.
#[derive(Debug, Clone)]
pub struct CrashMatrix {
    sources: usize,
    roots: usize,
}

/// Disk and registry state produced by a clean run, used as the oracle.
struct Reference {
    never_happened: DiskSnapshot,
    never_happened_names: Vec<String>,
    committed: DiskSnapshot,
    committed_names: Vec<String>,
}

impl CrashMatrix {
    /// A matrix over a compaction of `sources` files on one root.
    ///
    /// At least two sources are staged, the smallest run worth compacting.
    pub fn new(sources: usize) -> Self {
        Self {
            sources: sources.max(2),
            roots: 1,
        }
    }

    /// Spreads the sources round-robin over `roots` storage roots.
    pub fn roots(mut self, roots: usize) -> Self {
        self.roots = roots.max(1);
        self
    }

    /// The state a kill right after `checkpoint` must recover to.
    ///
    /// Until the sidecar is durable the target cannot validate, so recovery
    /// rolls back; from then on it commits.
    pub fn expected(checkpoint: CompactionCheckpoint) -> ExpectedState {
        match checkpoint {
            CompactionCheckpoint::LogOpened
            | CompactionCheckpoint::SourcesLogged
            | CompactionCheckpoint::TempTargetWritten
            | CompactionCheckpoint::TargetLogged
            | CompactionCheckpoint::TargetPromoted => ExpectedState::NeverHappened,
            _ => ExpectedState::Committed,
        }
    }

    /// Runs every checkpoint of the matrix.
    pub fn run(&self) -> Vec<CrashRecoveryResult> {
        let reference = self.reference();
        CompactionCheckpoint::sequence(self.sources)
            .into_iter()
            .map(|cp| self.run_point(cp, &reference))
            .collect()
    }

    /// Runs a single checkpoint.
    pub fn run_checkpoint(&self, checkpoint: CompactionCheckpoint) -> CrashRecoveryResult {
        self.run_point(checkpoint, &self.reference())
    }

    /// Names of the staged sources.
    pub fn source_names(&self) -> Vec<String> {
        (1..=self.sources).map(|i| format!("{i}-{i}-0-0.tsfile")).collect()
    }

    /// Writes the sources, their sidecars and ledgers into `layout`.
    ///
    /// Every source has one committed deletion; every other source also has
    /// one deletion that arrived while it was being compacted.
    pub fn stage(&self, layout: &TestLayout) {
        for (i, name) in self.source_names().iter().enumerate() {
            let root = i % self.roots;
            let data = vec![b'a' + (i % 26) as u8; 16 + i];
            layout.write_data_file(root, name, &data);
            layout.write_ledger(
                root,
                name,
                tsmerge_core::LedgerKind::Ordinary,
                &[Deletion::new(format!("root.sg.d{i}.s0"), 0, 0, i as i64)],
            );
            if i % 2 == 1 {
                layout.delete_during_compaction(
                    root,
                    name,
                    &Deletion::new(format!("root.sg.d{i}.s1"), 8, 10, 20),
                );
            }
        }
    }

    /// Summarizes results, one line per checkpoint.
    pub fn summary(results: &[CrashRecoveryResult]) -> String {
        let mut out = String::new();
        for r in results {
            out.push_str(&format!(
                "[{}] {} -> {:?}",
                if r.passed { "PASS" } else { "FAIL" },
                r.description,
                r.expected
            ));
            if let Some(e) = &r.error {
                out.push_str(&format!(": {e}"));
            }
            out.push('\n');
        }
        out
    }

    fn task(&self, layout: &TestLayout) -> ForwardCompactionTask {
        let registry = layout.load_registry();
        let config = layout.config().max_source_files(self.sources);
        let sources = ForwardCompactionTask::select_candidates(&registry, &config)
            .expect("Staged sources must be selectable");
        ForwardCompactionTask::new(registry, Arc::new(OsFileSystem), config, sources)
    }

    fn reference(&self) -> Reference {
        let layout = TestLayout::with_roots(self.roots);
        self.stage(&layout);
        let never_happened = layout.snapshot().without_suffix(COMPACTION_MODS_SUFFIX);
        let never_happened_names = registered_names(&layout.load_registry());

        let task = self.task(&layout);
        match task.run() {
            Ok(ForwardOutcome::Committed(_)) => {}
            other => panic!("Reference compaction did not commit: {other:?}"),
        }
        Reference {
            never_happened,
            never_happened_names,
            committed: layout.snapshot(),
            committed_names: registered_names(task.registry()),
        }
    }

    fn run_point(&self, checkpoint: CompactionCheckpoint, reference: &Reference) -> CrashRecoveryResult {
        let description = format!("crash after {checkpoint}");
        let expected = Self::expected(checkpoint);
        match self.check_point(checkpoint, expected, reference) {
            Ok(()) => CrashRecoveryResult::pass(&description, expected),
            Err(e) => CrashRecoveryResult::fail(&description, expected, &e),
        }
    }

    fn check_point(
        &self,
        checkpoint: CompactionCheckpoint,
        expected: ExpectedState,
        reference: &Reference,
    ) -> Result<(), String> {
        let layout = TestLayout::with_roots(self.roots);
        self.stage(&layout);

        match self.task(&layout).halt_after(checkpoint).run() {
            Err(e) if e.is_simulated_crash() => {}
            other => return Err(format!("task did not halt: {other:?}")),
        }

        let (registry, report) = layout.restart();
        if report.logs.len() != 1 {
            return Err(format!("expected one leftover log, found {}", report.logs.len()));
        }
        if let Some(failed) = report.logs.iter().find(|l| l.outcome.is_err()) {
            return Err(format!("recovery failed: {:?}", failed.outcome));
        }
        if !registry.is_compaction_allowed() {
            return Err("registry disabled after recovery".into());
        }

        let (want_disk, want_names) = match expected {
            ExpectedState::NeverHappened => {
                (&reference.never_happened, &reference.never_happened_names)
            }
            ExpectedState::Committed => (&reference.committed, &reference.committed_names),
        };
        let disk = layout.snapshot();
        let diff = want_disk.diff(&disk);
        if !diff.is_empty() {
            return Err(format!("disk differs: {}\n{}", diff.join(", "), disk.to_json()));
        }
        let names = registered_names(&registry);
        if &names != want_names {
            return Err(format!("registry holds {names:?}, expected {want_names:?}"));
        }

        let (_, again) = layout.restart();
        if !again.logs.is_empty() || layout.snapshot() != disk {
            return Err("second restart changed state".into());
        }
        Ok(())
    }
}

/// Writes a log through a [`CrashableBackend`] that dies after `budget` bytes.
///
/// Returns whether the crash fired.
pub fn write_torn_log(
    layout: &TestLayout,
    sources: &[&str],
    target: &str,
    budget: usize,
) -> bool {
    use tsmerge_core::log::current_log_name;
    use tsmerge_core::{CompactionLogWriter, TsFileName, TEMP_TARGET_SUFFIX};

    let final_name = target.strip_suffix(TEMP_TARGET_SUFFIX).unwrap_or(target);
    let stem = TsFileName::parse(final_name)
        .map(|n| n.stem())
        .unwrap_or_else(|_| "0-0-1-0".into());
    let path = layout.partition_dir(0).join(current_log_name(&stem));
    let inner = OsFileSystem
        .open_backend(&path)
        .expect("Failed to open log backend");
    let backend = CrashableBackend::new(inner);
    backend.crash_after(budget);
    let crashed = backend.crash_flag();

    let mut writer = CompactionLogWriter::with_backend(path, Box::new(backend), true);
    let ids: Vec<_> = sources.iter().map(|s| layout.id(s)).collect();
    let _ = writer
        .log_sources(&ids)
        .and_then(|()| writer.log_target(&layout.id(target)));
    crashed.load(Ordering::SeqCst)
}
