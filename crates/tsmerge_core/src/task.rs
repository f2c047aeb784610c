//! Compaction task variants and a deduplicating run queue.

use crate::error::CoreResult;
use crate::forward::{ForwardCompactionTask, ForwardOutcome};
use crate::recover::{RecoverTask, RecoveryOutcome};
use crate::registry::FileSetRegistry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A unit of work for the compaction scheduler.
#[derive(Debug)]
pub enum CompactionTask {
    /// Merge selected files.
    Forward(ForwardCompactionTask),
    /// Resolve a leftover compaction log.
    Recover(RecoverTask),
}

/// Result of running a [`CompactionTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Outcome of a forward task.
    Forward(ForwardOutcome),
    /// Outcome of a recovery task.
    Recover(RecoveryOutcome),
}

impl CompactionTask {
    /// The registry the task works on.
    #[must_use]
    pub fn registry(&self) -> &Arc<FileSetRegistry> {
        match self {
            Self::Forward(t) => t.registry(),
            Self::Recover(t) => t.registry(),
        }
    }

    /// Whether the task may start now.
    #[must_use]
    pub fn is_valid_to_run(&self) -> bool {
        match self {
            Self::Forward(t) => t.is_valid_to_run(),
            Self::Recover(t) => t.is_valid_to_run(),
        }
    }

    /// Whether `other` is a duplicate. Tasks of different kinds never are.
    #[must_use]
    pub fn same_task(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Forward(a), Self::Forward(b)) => a.same_task(b),
            (Self::Recover(a), Self::Recover(b)) => a.same_task(b),
            _ => false,
        }
    }

    /// Runs the task.
    ///
    /// # Errors
    ///
    /// Returns the task's unresolved failure.
    pub fn run(&self) -> CoreResult<TaskOutcome> {
        match self {
            Self::Forward(t) => t.run().map(TaskOutcome::Forward),
            Self::Recover(t) => t.recover().map(TaskOutcome::Recover),
        }
    }

    fn is_recover(&self) -> bool {
        matches!(self, Self::Recover(_))
    }
}

/// FIFO of pending tasks. Recovery tasks are queued ahead of forward tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<CompactionTask>>,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` unless an equivalent task is already pending.
    ///
    /// Returns false for a duplicate.
    pub fn submit(&self, task: CompactionTask) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|queued| queued.same_task(&task)) {
            debug!(registry = %task.registry().key(), "[Compaction] duplicate task dropped");
            return false;
        }
        if task.is_recover() {
            let at = tasks
                .iter()
                .position(|t| !t.is_recover())
                .unwrap_or(tasks.len());
            tasks.insert(at, task);
        } else {
            tasks.push_back(task);
        }
        true
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Pops the next task that is valid to run, discarding stale ones.
    pub fn next_runnable(&self) -> Option<CompactionTask> {
        let mut tasks = self.tasks.lock();
        while let Some(task) = tasks.pop_front() {
            if task.is_valid_to_run() {
                return Some(task);
            }
            debug!(
                registry = %task.registry().key(),
                "[Compaction] task is no longer valid to run, skipped"
            );
        }
        None
    }

    /// Runs every runnable task in order and returns their results.
    pub fn drain(&self) -> Vec<CoreResult<TaskOutcome>> {
        let mut results = Vec::new();
        while let Some(task) = self.next_runnable() {
            results.push(task.run());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::identifier::FileIdentifier;
    use crate::types::{RegistryKey, SequenceClass};
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tsmerge_storage::{FileSystem, OsFileSystem};

    fn registry() -> Arc<FileSetRegistry> {
        Arc::new(FileSetRegistry::new(RegistryKey::new(
            "root.sg",
            "0",
            0,
            SequenceClass::Sequence,
        )))
    }

    fn recover(registry: &Arc<FileSetRegistry>, log: PathBuf) -> CompactionTask {
        CompactionTask::Recover(RecoverTask::new(
            Arc::clone(registry),
            Arc::new(OsFileSystem),
            CompactionConfig::new().data_dirs(vec!["/data".into()]),
            log,
        ))
    }

    fn forward(registry: &Arc<FileSetRegistry>, names: &[&str]) -> CompactionTask {
        let sources = names
            .iter()
            .map(|n| FileIdentifier::new(registry.key(), *n))
            .collect();
        CompactionTask::Forward(ForwardCompactionTask::new(
            Arc::clone(registry),
            Arc::new(OsFileSystem) as Arc<dyn FileSystem>,
            CompactionConfig::new(),
            sources,
        ))
    }

    #[test]
    fn duplicates_are_dropped() {
        let reg = registry();
        let queue = TaskQueue::new();
        assert!(queue.submit(recover(&reg, "/a.log".into())));
        assert!(!queue.submit(recover(&reg, "/a.log".into())));
        assert!(queue.submit(recover(&reg, "/b.log".into())));
        assert!(queue.submit(forward(&reg, &["1-1-0-0.tsfile"])));
        assert!(!queue.submit(forward(&reg, &["1-1-0-0.tsfile"])));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn recovery_runs_before_forward() {
        let reg = registry();
        let queue = TaskQueue::new();
        queue.submit(forward(&reg, &["1-1-0-0.tsfile"]));
        queue.submit(recover(&reg, "/a.log".into()));

        let tasks = queue.tasks.lock();
        assert!(tasks[0].is_recover());
        assert!(!tasks[1].is_recover());
    }

    #[test]
    fn stale_tasks_are_skipped() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let queue = TaskQueue::new();
        let live = dir.path().join("live.inner-compaction.log");
        std::fs::write(&live, b"").unwrap();

        queue.submit(recover(&reg, dir.path().join("gone.inner-compaction.log")));
        queue.submit(recover(&reg, live.clone()));
        queue.submit(forward(&reg, &["1-1-0-0.tsfile"]));

        let next = queue.next_runnable().unwrap();
        match next {
            CompactionTask::Recover(t) => assert_eq!(t.log_path(), live),
            CompactionTask::Forward(_) => panic!("expected the live recovery task"),
        }
        // The forward task's source is not registered.
        assert!(queue.next_runnable().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_runs_everything_runnable() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let queue = TaskQueue::new();
        let log = dir.path().join("x.inner-compaction.log");
        std::fs::write(&log, b"").unwrap();
        queue.submit(recover(&reg, log.clone()));

        let results = queue.drain();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].as_ref().unwrap(),
            &TaskOutcome::Recover(RecoveryOutcome::IncompleteLog)
        );
        assert!(!log.exists());
    }
}
