//! Batch-wide progress state.
//!
//! [`ProgressTracker`] is the only owner of the counters and collections
//! describing a run. Workers report through [`ProgressTracker::start`] and
//! [`ProgressTracker::finish`]; readers only ever see owned
//! [`ProgressSnapshot`] copies. Every operation holds the lock for a short,
//! await-free critical section.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::task::{self, Task, TaskKey};

/// How a task ended, as far as progress accounting is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Retries exhausted.
    Failed,
    /// The run was cancelled before the task could finish.
    Cancelled,
}

#[derive(Debug)]
struct ProgressState {
    total_files: usize,
    total_bytes: u64,
    completed: usize,
    succeeded: usize,
    finished_bytes: u64,
    // key -> size, so finish can account bytes without trusting the caller
    in_progress: BTreeMap<TaskKey, u64>,
    errored: Vec<TaskKey>,
    cancelled: Vec<TaskKey>,
}

/// Point-in-time, internally consistent copy of the progress state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_files: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub in_progress: Vec<TaskKey>,
    pub total_bytes: u64,
    pub finished_bytes: u64,
    pub errored: Vec<TaskKey>,
    pub cancelled: Vec<TaskKey>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Tasks neither finished nor currently running.
    pub fn pending(&self) -> usize {
        self.total_files
            .saturating_sub(self.completed)
            .saturating_sub(self.in_progress.len())
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total_files
    }

    /// Completed fraction of files, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_files == 0 {
            1.0
        } else {
            self.completed as f64 / self.total_files as f64
        }
    }

    /// Time left, extrapolated from the byte rate observed so far.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let elapsed = self.elapsed.as_secs_f64();
        if self.finished_bytes == 0 || elapsed <= 0.0 {
            return None;
        }
        let rate = self.finished_bytes as f64 / elapsed;
        let remaining = self.total_bytes.saturating_sub(self.finished_bytes) as f64;
        Duration::try_from_secs_f64(remaining / rate).ok()
    }
}

#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    started_at: Instant,
}

impl ProgressTracker {
    /// Creates a tracker whose totals are fixed to `tasks`.
    pub fn for_tasks(tasks: &[Task]) -> Self {
        Self::with_totals(tasks.len(), task::total_bytes(tasks))
    }

    pub fn with_totals(total_files: usize, total_bytes: u64) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                total_files,
                total_bytes,
                completed: 0,
                succeeded: 0,
                finished_bytes: 0,
                in_progress: BTreeMap::new(),
                errored: Vec::new(),
                cancelled: Vec::new(),
            }),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // The state stays consistent between statements, so a panic elsewhere
        // while holding the lock does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `task` as uploading. Returns `false` if it already was.
    pub fn start(&self, task: &Task) -> bool {
        let mut state = self.lock();
        if state.in_progress.contains_key(task.key()) {
            drop(state);
            warn!(file = %task.key(), "task started twice, ignoring");
            return false;
        }
        state.in_progress.insert(task.key().clone(), task.size());
        true
    }

    /// Records the terminal outcome of a started task.
    ///
    /// Returns `false`, leaving all counters untouched, when `key` is not in
    /// progress (never started, or already finished).
    pub fn finish(&self, key: &TaskKey, outcome: Outcome) -> bool {
        let mut state = self.lock();
        let Some(size) = state.in_progress.remove(key) else {
            drop(state);
            warn!(file = %key, "finish for a task that is not in progress, ignoring");
            return false;
        };
        state.record(key, size, outcome);
        true
    }

    /// Records a task that the run was cancelled before starting.
    pub fn abandon(&self, task: &Task) -> bool {
        self.settle_unstarted(task, Outcome::Cancelled)
    }

    /// Records a task that was refused without being attempted.
    pub fn reject(&self, task: &Task) -> bool {
        self.settle_unstarted(task, Outcome::Failed)
    }

    fn settle_unstarted(&self, task: &Task, outcome: Outcome) -> bool {
        let mut state = self.lock();
        if state.in_progress.contains_key(task.key()) {
            drop(state);
            warn!(file = %task.key(), ?outcome, "task is running, ignoring");
            return false;
        }
        if state.completed >= state.total_files {
            drop(state);
            warn!(file = %task.key(), ?outcome, "outcome beyond the task total, ignoring");
            return false;
        }
        state.record(task.key(), task.size(), outcome);
        true
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        ProgressSnapshot {
            total_files: state.total_files,
            completed: state.completed,
            succeeded: state.succeeded,
            in_progress: state.in_progress.keys().cloned().collect(),
            total_bytes: state.total_bytes,
            finished_bytes: state.finished_bytes,
            errored: state.errored.clone(),
            cancelled: state.cancelled.clone(),
            elapsed: self.started_at.elapsed(),
        }
    }
}

impl ProgressState {
    fn record(&mut self, key: &TaskKey, size: u64, outcome: Outcome) {
        debug_assert!(self.completed < self.total_files, "more completions than tasks");
        self.completed += 1;
        self.finished_bytes = self.finished_bytes.saturating_add(size);
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.errored.push(key.clone()),
            Outcome::Cancelled => self.cancelled.push(key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(name: &str, size: u64) -> Task {
        Task::new(TaskKey::new(format!("/batch/{name}")), size)
    }

    #[test]
    fn start_and_finish_update_counters() {
        let tasks = vec![task("a", 10), task("b", 20), task("c", 30)];
        let tracker = ProgressTracker::for_tasks(&tasks);

        assert!(tracker.start(&tasks[0]));
        assert!(tracker.start(&tasks[1]));
        let snap = tracker.snapshot();
        assert_eq!(snap.in_progress.len(), 2);
        assert_eq!(snap.pending(), 1);
        assert_eq!(snap.total_bytes, 60);

        assert!(tracker.finish(tasks[0].key(), Outcome::Succeeded));
        assert!(tracker.finish(tasks[1].key(), Outcome::Failed));
        assert!(tracker.abandon(&tasks[2]));

        let snap = tracker.snapshot();
        assert!(snap.is_done());
        assert!(snap.in_progress.is_empty());
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.errored, vec![tasks[1].key().clone()]);
        assert_eq!(snap.cancelled, vec![tasks[2].key().clone()]);
        assert_eq!(snap.finished_bytes, 60);
    }

    #[test]
    fn duplicate_start_and_finish_are_ignored() {
        let tasks = vec![task("a", 5)];
        let tracker = ProgressTracker::for_tasks(&tasks);

        assert!(tracker.start(&tasks[0]));
        assert!(!tracker.start(&tasks[0]));
        assert!(tracker.finish(tasks[0].key(), Outcome::Failed));
        assert!(!tracker.finish(tasks[0].key(), Outcome::Failed));

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.finished_bytes, 5);
        assert_eq!(snap.errored.len(), 1);
    }

    #[test]
    fn finish_without_start_is_ignored() {
        let tasks = vec![task("a", 5)];
        let tracker = ProgressTracker::for_tasks(&tasks);

        assert!(!tracker.finish(tasks[0].key(), Outcome::Succeeded));
        assert_eq!(tracker.snapshot().completed, 0);
    }

    #[test]
    fn same_file_name_in_different_folders_does_not_collide() {
        let a = Task::new(TaskKey::new("/x/report.pdf"), 1);
        let b = Task::new(TaskKey::new("/y/report.pdf"), 1);
        let tracker = ProgressTracker::for_tasks(&[a.clone(), b.clone()]);

        assert!(tracker.start(&a));
        assert!(tracker.start(&b));
        assert_eq!(tracker.snapshot().in_progress.len(), 2);
    }

    #[test]
    fn eta_extrapolates_byte_rate() {
        let snap = ProgressSnapshot {
            total_files: 4,
            completed: 1,
            succeeded: 1,
            in_progress: Vec::new(),
            total_bytes: 400,
            finished_bytes: 100,
            errored: Vec::new(),
            cancelled: Vec::new(),
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(snap.estimated_remaining(), Some(Duration::from_secs(30)));
        assert!((snap.fraction() - 0.25).abs() < f64::EPSILON);

        let idle = ProgressSnapshot {
            finished_bytes: 0,
            ..snap
        };
        assert_eq!(idle.estimated_remaining(), None);
    }

    #[test]
    fn rejected_task_counts_as_errored() {
        let tasks = vec![task("a", 5), task("b", 7)];
        let tracker = ProgressTracker::for_tasks(&tasks);

        assert!(tracker.start(&tasks[0]));
        assert!(!tracker.reject(&tasks[0]));
        assert!(tracker.reject(&tasks[1]));

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.errored, vec![tasks[1].key().clone()]);
        assert_eq!(snap.finished_bytes, 7);
    }

    #[test]
    fn eta_beyond_duration_range_is_unknown() {
        let snap = ProgressSnapshot {
            total_files: 2,
            completed: 0,
            succeeded: 0,
            in_progress: Vec::new(),
            total_bytes: u64::MAX,
            finished_bytes: 1,
            errored: Vec::new(),
            cancelled: Vec::new(),
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(snap.estimated_remaining(), None);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let tasks: Vec<_> = (0..400).map(|i| task(&format!("f{i}"), i)).collect();
        let tracker = Arc::new(ProgressTracker::for_tasks(&tasks));
        let expected_bytes: u64 = (0..400).sum();

        std::thread::scope(|s| {
            for chunk in tasks.chunks(50) {
                let tracker = &tracker;
                s.spawn(move || {
                    for t in chunk {
                        assert!(tracker.start(t));
                        let _ = tracker.snapshot();
                        assert!(tracker.finish(t.key(), Outcome::Succeeded));
                    }
                });
            }
        });

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 400);
        assert_eq!(snap.succeeded, 400);
        assert_eq!(snap.finished_bytes, expected_bytes);
        assert!(snap.in_progress.is_empty());
    }
}
