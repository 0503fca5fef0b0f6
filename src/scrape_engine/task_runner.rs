//! Bounded-concurrency batch execution
//!
//! Every item is spawned up front; a semaphore of size `concurrency` decides
//! how many run at once. Results come back tagged with the index of the item
//! that produced them, in completion order, and are sorted by index before
//! they are returned.
//!
//! With `continue_on_error = false` the first failure stops scheduling:
//! tasks still waiting for a permit resolve as [`TaskError::Cancelled`],
//! tasks already running are allowed to finish, and the batch returns
//! [`BatchAborted`] carrying everything collected so far.

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cancellation::CancellationSignal;
use crate::driver::DriverError;

/// Why a single task did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    /// The page was torn down underneath the task, e.g. by a restart
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Never started because the batch was stopped
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Classify a processor error, recognising page-closed artifacts
    #[must_use]
    pub fn from_processor(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<DriverError>() {
            Some(driver) if driver.is_cancellation_artifact() => Self::Interrupted(driver.to_string()),
            _ => Self::Failed(format!("{error:#}")),
        }
    }

    /// Page torn down mid-task: an expected race, not a genuine failure
    #[must_use]
    pub fn is_artifact(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// Outcome of one item
#[derive(Debug, Clone)]
pub struct TaskResult<T, R> {
    /// Position of the item in the submitted batch
    pub index: usize,
    pub item: T,
    pub outcome: Result<R, TaskError>,
}

impl<T, R> TaskResult<T, R> {
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub concurrency: usize,
}

/// Everything a batch produced
#[derive(Debug)]
pub struct BatchOutcome<T, R> {
    /// Successful tasks, ordered by index
    pub results: Vec<TaskResult<T, R>>,
    /// Failed tasks, ordered by index
    pub errors: Vec<TaskResult<T, R>>,
    pub summary: BatchSummary,
}

impl<T, R> BatchOutcome<T, R> {
    /// Successful values in submission order
    #[must_use]
    pub fn values(&self) -> Vec<&R> {
        self.results.iter().filter_map(|r| r.outcome.as_ref().ok()).collect()
    }

    /// Failures that are not cancellation artifacts
    #[must_use]
    pub fn genuine_errors(&self) -> usize {
        self.errors
            .iter()
            .filter(|r| r.outcome.as_ref().err().is_some_and(|e| !e.is_artifact()))
            .count()
    }

    /// All task results merged back into submission order
    #[must_use]
    pub fn into_ordered(self) -> Vec<TaskResult<T, R>> {
        let mut all = self.results;
        all.extend(self.errors);
        all.sort_by_key(|r| r.index);
        all
    }
}

/// Returned when `continue_on_error` is false and a task failed
#[derive(Debug)]
pub struct BatchAborted<T, R> {
    /// Index of the first failing task
    pub index: usize,
    pub error: TaskError,
    pub outcome: BatchOutcome<T, R>,
}

impl<T, R> fmt::Display for BatchAborted<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch stopped at task {}: {} ({} of {} succeeded)",
            self.index, self.error, self.outcome.summary.successful, self.outcome.summary.total
        )
    }
}

impl<T: fmt::Debug, R: fmt::Debug> std::error::Error for BatchAborted<T, R> {}

/// Per-call options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub continue_on_error: bool,
    pub log_progress: bool,
    /// Label attached to log lines, e.g. the stage name
    pub context: String,
    /// Shared signal; once tripped no further tasks start
    pub cancellation: Option<CancellationSignal>,
    /// Upper bound on a single task, permit wait excluded
    pub task_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            log_progress: false,
            context: "batch".to_string(),
            cancellation: None,
            task_timeout: None,
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    #[must_use]
    pub fn stop_on_error(mut self) -> Self {
        self.continue_on_error = false;
        self
    }

    #[must_use]
    pub fn with_progress(mut self) -> Self {
        self.log_progress = true;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

async fn tripped(signal: Option<CancellationSignal>) -> String {
    match signal {
        Some(signal) => {
            signal.cancelled().await;
            signal.reason().unwrap_or_else(|| "cancelled".to_string())
        }
        None => std::future::pending().await,
    }
}

fn cancelled_reason(signals: [Option<&CancellationSignal>; 2]) -> Option<String> {
    signals
        .into_iter()
        .flatten()
        .find(|s| s.is_cancelled())
        .map(|s| s.reason().unwrap_or_else(|| "cancelled".to_string()))
}

/// Runs batches with a fixed concurrency limit
#[derive(Debug, Clone, Copy)]
pub struct ParallelTaskRunner {
    concurrency: usize,
}

impl ParallelTaskRunner {
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `processor` over every item.
    ///
    /// `processor` receives the item and its index. Errors it returns are
    /// captured per task; only `continue_on_error = false` turns a task error
    /// into a batch error.
    pub async fn run<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        options: RunOptions,
    ) -> Result<BatchOutcome<T, R>, BatchAborted<T, R>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let context = options.context.clone();

        if options.log_progress {
            info!("[{context}] starting {total} tasks with concurrency {}", self.concurrency);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let processor = Arc::new(processor);
        let stop = CancellationSignal::new();
        let mut pending = FuturesUnordered::new();

        for (index, item) in items.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&processor);
            let stop = stop.clone();
            let external = options.cancellation.clone();
            let task_timeout = options.task_timeout;

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    reason = tripped(Some(stop.clone())) => return Err(TaskError::Cancelled(reason)),
                    reason = tripped(external.clone()) => return Err(TaskError::Cancelled(reason)),
                    permit = semaphore.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return Err(TaskError::Cancelled("runner closed".to_string()));
                };
                if let Some(reason) = cancelled_reason([Some(&stop), external.as_ref()]) {
                    return Err(TaskError::Cancelled(reason));
                }

                let work = processor(item, index);
                let result = match task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => return Err(TaskError::TimedOut(limit)),
                    },
                    None => work.await,
                };
                result.map_err(|e| TaskError::from_processor(&e))
            });
            pending.push(handle.map(move |joined| (index, joined)));
        }

        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut first_error: Option<(usize, TaskError)> = None;
        let mut completed = 0usize;
        let step = (total / 10).max(1);

        while let Some((index, joined)) = pending.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(TaskError::Panicked(e.to_string())),
                Err(e) => Err(TaskError::Cancelled(e.to_string())),
            };
            let Some(item) = slots.get_mut(index).and_then(Option::take) else {
                continue;
            };

            match &outcome {
                Ok(_) => {}
                Err(err @ TaskError::Cancelled(_)) => {
                    debug!("[{context}] task {index} skipped: {err}");
                }
                Err(err) if err.is_artifact() => {
                    debug!("[{context}] task {index} {err}");
                }
                Err(err) => {
                    warn!("[{context}] task {index} failed: {err}");
                    if !options.continue_on_error && first_error.is_none() {
                        first_error = Some((index, err.clone()));
                        stop.cancel(format!("task {index} failed"));
                    }
                }
            }

            let result = TaskResult { index, item, outcome };
            if result.success() {
                results.push(result);
            } else {
                errors.push(result);
            }

            completed += 1;
            if options.log_progress && (completed % step == 0 || completed == total) {
                info!(
                    "[{context}] progress {completed}/{total} ({} ok, {} failed)",
                    results.len(),
                    errors.len()
                );
            }
        }

        results.sort_by_key(|r| r.index);
        errors.sort_by_key(|r| r.index);

        let summary = BatchSummary {
            total,
            successful: results.len(),
            failed: errors.len(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            concurrency: self.concurrency,
        };
        if options.log_progress {
            info!(
                "[{context}] finished: {}/{} succeeded in {}ms",
                summary.successful, summary.total, summary.duration_ms
            );
        }

        let outcome = BatchOutcome {
            results,
            errors,
            summary,
        };
        match first_error {
            Some((index, error)) => Err(BatchAborted { index, error, outcome }),
            None => Ok(outcome),
        }
    }
}
