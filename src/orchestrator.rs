//! The bounded upload worker pool.
//!
//! Every task goes through the same lifecycle: wait for a pool slot, mark it
//! started, run the retry-wrapped upload, record the outcome, release the
//! slot. The slot and the outcome recording are tied to an [`InFlight`]
//! guard, so both happen exactly once even when a worker is aborted or
//! panics.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::progress::{Outcome, ProgressTracker};
use crate::retry::{RetryPolicy, TerminalError};
use crate::task::Task;
use crate::upload::Uploader;

/// Default time in-flight uploads get to finish once a run is cancelled.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A task that did not upload, with the reason.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: Task,
    pub error: TerminalError,
}

/// Result of a whole run. An empty `failures` list means every file uploaded.
#[derive(Debug)]
pub struct RunReport {
    pub succeeded: usize,
    pub failures: Vec<TaskFailure>,
    /// Whether the deadline or the caller cancelled the run.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures not caused by cancellation: exhausted retries and refused duplicates.
    pub fn exhausted(&self) -> impl Iterator<Item = &TaskFailure> {
        self.failures.iter().filter(|f| !f.error.is_cancellation())
    }

    /// Failures caused by the run being cancelled.
    pub fn interrupted(&self) -> impl Iterator<Item = &TaskFailure> {
        self.failures.iter().filter(|f| f.error.is_cancellation())
    }
}

/// Outcomes collected from all workers of one run.
#[derive(Default)]
struct Ledger {
    succeeded: AtomicUsize,
    failures: Mutex<Vec<TaskFailure>>,
}

impl Ledger {
    fn push_failure(&self, failure: TaskFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}

/// One started task. Owns its pool slot; records the task's terminal outcome
/// before the slot is released, including when dropped unsettled.
struct InFlight {
    task: Task,
    tracker: Arc<ProgressTracker>,
    ledger: Arc<Ledger>,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn settle(mut self, result: Result<(), TerminalError>) {
        self.record(result);
        self.settled = true;
    }

    fn record(&self, result: Result<(), TerminalError>) {
        let outcome = match &result {
            Ok(()) => Outcome::Succeeded,
            Err(e) if e.is_cancellation() => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        };
        self.tracker.finish(self.task.key(), outcome);

        match result {
            Ok(()) => {
                self.ledger.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => self.ledger.push_failure(TaskFailure {
                task: self.task.clone(),
                error,
            }),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            warn!(file = %self.task.key(), "upload worker stopped before finishing");
            self.record(Err(TerminalError::Aborted {
                file: self.task.path().to_path_buf(),
            }));
        }
    }
}

pub struct Orchestrator<U> {
    uploader: Arc<U>,
    policy: RetryPolicy,
    concurrency: usize,
    deadline: Option<Duration>,
    shutdown_grace: Duration,
}

impl<U: Uploader + 'static> Orchestrator<U> {
    /// `concurrency` is clamped to at least one slot.
    pub fn new(uploader: Arc<U>, policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            uploader,
            policy,
            concurrency: concurrency.max(1),
            deadline: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Run-wide deadline, measured from the start of [`Orchestrator::run`].
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Uploads every task and waits until each one is terminal.
    ///
    /// `tracker` must have been created for exactly these tasks. Firing
    /// `cancel` has the same effect as the deadline expiring.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        self.run_inner(tasks, tracker, cancel)
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        tasks: Vec<Task>,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let run_cancel = cancel.child_token();
        info!(
            files = tasks.len(),
            concurrency = self.concurrency,
            deadline = ?self.deadline,
            "starting run"
        );

        let deadline_timer = self.deadline.map(|deadline| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                info!("deadline reached, cancelling run");
                token.cancel();
            })
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let ledger = Arc::new(Ledger::default());
        let mut workers = JoinSet::new();

        // One upload per key; later copies fail without being attempted
        let mut seen = BTreeSet::new();
        let (tasks, duplicates): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|task| seen.insert(task.key().clone()));
        for task in duplicates {
            reject(task, &tracker, &ledger);
        }
        let mut tasks = tasks.into_iter();

        // --- Dispatch ---
        for task in tasks.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = run_cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                abandon(task, &tracker, &ledger);
                break;
            };

            if !tracker.start(&task) {
                // Unreachable after deduplication; still account for the task
                error!(file = %task.key(), "task already in progress, not uploading");
                ledger.push_failure(TaskFailure {
                    error: TerminalError::DuplicateKey {
                        file: task.path().to_path_buf(),
                    },
                    task,
                });
                continue;
            }
            let guard = InFlight {
                task,
                tracker: tracker.clone(),
                ledger: ledger.clone(),
                settled: false,
                _permit: permit,
            };
            workers.spawn(
                drive(self.uploader.clone(), self.policy, guard, run_cancel.clone())
                    .in_current_span(),
            );

            while let Some(joined) = workers.try_join_next() {
                log_join_error(joined);
            }
        }

        // Whatever was never dispatched ends here
        for task in tasks {
            abandon(task, &tracker, &ledger);
        }

        // --- Barrier ---
        let mut abort_at: Option<Instant> = None;
        let mut aborted = false;
        loop {
            let grace_expired = async move {
                match abort_at {
                    Some(at) if !aborted => tokio::time::sleep_until(at).await,
                    _ => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(joined) => log_join_error(joined),
                    None => break,
                },
                _ = run_cancel.cancelled(), if abort_at.is_none() => {
                    info!(
                        in_flight = workers.len(),
                        grace = ?self.shutdown_grace,
                        "run cancelled, waiting for in-flight uploads"
                    );
                    abort_at = Some(Instant::now() + self.shutdown_grace);
                }
                _ = grace_expired => {
                    warn!(remaining = workers.len(), "shutdown grace expired, aborting uploads");
                    workers.abort_all();
                    aborted = true;
                }
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        let failures =
            std::mem::take(&mut *ledger.failures.lock().unwrap_or_else(PoisonError::into_inner));
        let report = RunReport {
            succeeded: ledger.succeeded.load(Ordering::Relaxed),
            failures,
            cancelled: run_cancel.is_cancelled(),
            elapsed: started.elapsed(),
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            elapsed = ?report.elapsed,
            "run finished"
        );
        report
    }
}

async fn drive<U: Uploader>(
    uploader: Arc<U>,
    policy: RetryPolicy,
    guard: InFlight,
    cancel: CancellationToken,
) {
    let task = &guard.task;
    let result = policy
        .execute(task.path(), &cancel, || uploader.upload(task.path(), task.query()))
        .await;
    guard.settle(result);
}

fn abandon(task: Task, tracker: &ProgressTracker, ledger: &Ledger) {
    tracker.abandon(&task);
    ledger.push_failure(TaskFailure {
        error: TerminalError::NotStarted {
            file: task.path().to_path_buf(),
        },
        task,
    });
}

fn reject(task: Task, tracker: &ProgressTracker, ledger: &Ledger) {
    error!(file = %task.key(), "duplicate task key, not uploading");
    tracker.reject(&task);
    ledger.push_failure(TaskFailure {
        error: TerminalError::DuplicateKey {
            file: task.path().to_path_buf(),
        },
        task,
    });
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("upload worker panicked: {e}");
        }
    }
}
