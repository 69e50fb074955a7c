//! Parallel trial execution
//!
//! [`TaskExecutor`] is a fixed pool of worker threads fed through a bounded
//! channel. Every run is independent and single-threaded; parallelism only
//! exists across runs. [`TrialWorker`] drives a batch of repetitions through
//! the pool, folding results as they arrive and stopping early once the
//! tracked averages are precise.

use crate::cg_error::SimError;
use crate::cg_statistics::{AvgEvaluator, IncrementalStats};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job<T> = Box<dyn FnOnce() -> Result<T, SimError> + Send + 'static>;

struct Queued<T> {
    task: usize,
    epoch: u64,
    job: Job<T>,
}

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed { task: usize, value: T },
    Failed { task: usize, reason: String },
}

impl<T> TaskOutcome<T> {
    pub fn task(&self) -> usize {
        match self {
            TaskOutcome::Completed { task, .. } | TaskOutcome::Failed { task, .. } => *task,
        }
    }

    pub fn into_result(self) -> Result<T, SimError> {
        match self {
            TaskOutcome::Completed { value, .. } => Ok(value),
            TaskOutcome::Failed { task, reason } => Err(SimError::TaskFailed { task, reason }),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Bumped by `cancel_batch`; jobs of older epochs are skipped
    epoch: AtomicU64,
    submitted: AtomicUsize,
    submitters: AtomicUsize,
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ============================================================================
// Submitter
// ============================================================================

/// Cloneable handle that feeds jobs to an executor from another thread.
/// While any submitter is alive, `consume` waits for results instead of
/// reporting an over-consumption.
pub struct TaskSubmitter<T> {
    jobs: Sender<Queued<T>>,
    shared: Arc<Shared>,
}

impl<T> TaskSubmitter<T> {
    fn new(jobs: Sender<Queued<T>>, shared: Arc<Shared>) -> Self {
        shared.submitters.fetch_add(1, Ordering::SeqCst);
        Self { jobs, shared }
    }

    /// Queues a job, blocking while the queue is full. Returns its task id.
    pub fn submit<F>(&self, job: F) -> Result<usize, SimError>
    where
        F: FnOnce() -> Result<T, SimError> + Send + 'static,
    {
        let task = self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        let queued = Queued {
            task,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            job: Box::new(job),
        };
        self.jobs
            .send(queued)
            .map_err(|_| SimError::Executor("executor has shut down".into()))?;
        Ok(task)
    }
}

impl<T> Clone for TaskSubmitter<T> {
    fn clone(&self) -> Self {
        Self::new(self.jobs.clone(), Arc::clone(&self.shared))
    }
}

impl<T> Drop for TaskSubmitter<T> {
    fn drop(&mut self) {
        self.shared.submitters.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct TaskExecutor<T: Send + 'static> {
    submitter: Option<TaskSubmitter<T>>,
    /// Kept to drain queued jobs on cancellation
    queue: Receiver<Queued<T>>,
    results: Receiver<(u64, TaskOutcome<T>)>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    consumed: usize,
}

impl<T: Send + 'static> TaskExecutor<T> {
    /// Spawns `cores` workers sharing a queue of at most `max_queued` jobs
    pub fn new(cores: usize, max_queued: usize) -> Result<Self, SimError> {
        if cores == 0 {
            return Err(SimError::InvalidConfig("executor needs at least one core".into()));
        }
        let (job_tx, job_rx) = channel::bounded::<Queued<T>>(max_queued.max(1));
        let (result_tx, result_rx) = channel::unbounded();
        let shared = Arc::new(Shared::default());

        let mut workers = Vec::with_capacity(cores);
        for id in 0..cores {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("cg-worker-{id}"))
                .spawn(move || Self::worker_loop(&jobs, &results, &shared))
                .map_err(|e| SimError::Executor(format!("spawning worker {id}: {e}")))?;
            workers.push(handle);
        }
        debug!("task executor started: {} workers, queue {}", cores, max_queued);

        Ok(Self {
            submitter: Some(TaskSubmitter::new(job_tx, Arc::clone(&shared))),
            queue: job_rx,
            results: result_rx,
            workers,
            shared,
            consumed: 0,
        })
    }

    fn worker_loop(jobs: &Receiver<Queued<T>>, results: &Sender<(u64, TaskOutcome<T>)>, shared: &Shared) {
        while let Ok(Queued { task, epoch, job }) = jobs.recv() {
            if epoch != shared.epoch.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => TaskOutcome::Completed { task, value },
                Ok(Err(e)) => {
                    error!("task {} failed: {}", task, e);
                    TaskOutcome::Failed { task, reason: e.to_string() }
                }
                Err(payload) => {
                    let reason = panic_reason(payload);
                    error!("task {} panicked: {}", task, reason);
                    TaskOutcome::Failed { task, reason }
                }
            };
            if results.send((epoch, outcome)).is_err() {
                break;
            }
        }
    }

    /// Handle for submitting from another thread
    pub fn submitter(&self) -> Result<TaskSubmitter<T>, SimError> {
        self.submitter
            .clone()
            .ok_or_else(|| SimError::Executor("executor has shut down".into()))
    }

    pub fn submit<F>(&self, job: F) -> Result<usize, SimError>
    where
        F: FnOnce() -> Result<T, SimError> + Send + 'static,
    {
        match &self.submitter {
            Some(submitter) => submitter.submit(job),
            None => Err(SimError::Executor("executor has shut down".into())),
        }
    }

    pub fn submitted(&self) -> usize {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Blocks for the next outcome of the current batch
    pub fn consume(&mut self) -> Result<TaskOutcome<T>, SimError> {
        // the executor's own submitter is not an outside producer
        let outside = self.shared.submitters.load(Ordering::SeqCst)
            - usize::from(self.submitter.is_some());
        if self.consumed >= self.submitted() && outside == 0 {
            return Err(SimError::Executor(format!(
                "consume called with all {} submitted results already consumed",
                self.consumed
            )));
        }
        loop {
            let (epoch, outcome) = self
                .results
                .recv()
                .map_err(|_| SimError::Executor("all workers exited".into()))?;
            if epoch == self.shared.epoch.load(Ordering::SeqCst) {
                self.consumed += 1;
                return Ok(outcome);
            }
        }
    }

    /// Drops queued jobs and discards the results of jobs still running.
    /// Returns how many submitted tasks will never be consumed.
    pub fn cancel_batch(&mut self) -> usize {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        while self.queue.try_recv().is_ok() {}
        let submitted = self.submitted();
        let discarded = submitted.saturating_sub(self.consumed);
        self.consumed = submitted;
        if discarded > 0 {
            debug!("cancelled batch, {} tasks discarded", discarded);
        }
        discarded
    }

    /// Closes the queue. With `wait`, blocks until every worker has exited.
    pub fn shutdown(&mut self, wait: bool) {
        self.submitter = None;
        let workers = std::mem::take(&mut self.workers);
        if wait {
            for handle in workers {
                if handle.join().is_err() {
                    warn!("worker thread panicked outside a task");
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for TaskExecutor<T> {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

// ============================================================================
// Trial Worker
// ============================================================================

/// Folds trial results and exposes the statistics that decide early stopping
pub trait TrialAggregate<T> {
    fn fold(&mut self, value: T);

    fn tracked(&self) -> Vec<&IncrementalStats>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrialReport {
    pub completed: usize,
    pub failed: usize,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
pub struct TrialWorker {
    cores: usize,
    max_queued: usize,
    evaluator: Option<AvgEvaluator>,
}

impl TrialWorker {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: cores.max(1),
            max_queued: 2 * cores.max(1),
            evaluator: None,
        }
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued.max(1);
        self
    }

    /// Stops the batch once every tracked statistic satisfies `evaluator`
    pub fn with_evaluator(mut self, evaluator: AvgEvaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    fn is_precise<T>(&self, aggregate: &impl TrialAggregate<T>) -> bool {
        let Some(evaluator) = &self.evaluator else {
            return false;
        };
        let tracked = aggregate.tracked();
        !tracked.is_empty() && tracked.iter().all(|stats| evaluator.is_precise(stats))
    }

    /// Runs `trial(0..repetitions)` on the pool, folding every completed
    /// result into `aggregate`. Failed trials are counted and skipped.
    pub fn run<T, F, A>(&self, repetitions: usize, trial: F, aggregate: &mut A) -> Result<TrialReport, SimError>
    where
        T: Send + 'static,
        F: Fn(usize) -> Result<T, SimError> + Send + Sync + 'static,
        A: TrialAggregate<T>,
    {
        let mut executor = TaskExecutor::<T>::new(self.cores, self.max_queued)?;
        let trial = Arc::new(trial);
        let stop = AtomicBool::new(false);
        let mut report = TrialReport::default();

        let submitter = executor.submitter()?;
        let outcome: Result<(), SimError> = thread::scope(|scope| {
            let feeder = scope.spawn(|| {
                let submitter = submitter;
                for i in 0..repetitions {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let trial = Arc::clone(&trial);
                    submitter.submit(move || trial(i))?;
                }
                Ok::<(), SimError>(())
            });

            let consumed = (|| {
                for _ in 0..repetitions {
                    match executor.consume()? {
                        TaskOutcome::Completed { value, .. } => {
                            aggregate.fold(value);
                            report.completed += 1;
                        }
                        TaskOutcome::Failed { task, reason } => {
                            warn!("trial {} skipped: {}", task, reason);
                            report.failed += 1;
                        }
                    }
                    if self.is_precise(aggregate) {
                        report.stopped_early = report.completed + report.failed < repetitions;
                        break;
                    }
                }
                Ok::<(), SimError>(())
            })();
            stop.store(true, Ordering::SeqCst);
            let fed = feeder
                .join()
                .map_err(|_| SimError::Executor("submitter thread panicked".into()))?;
            consumed.and(fed)
        });
        outcome?;

        executor.cancel_batch();
        executor.shutdown(true);
        info!(
            "trials finished: {} completed, {} failed{}",
            report.completed,
            report.failed,
            if report.stopped_early { ", stopped early" } else { "" }
        );
        Ok(report)
    }
}
