//! Scheduler lifecycle: owns the queue, the worker pool and the collaborators.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobtrack_core::JobId;

use super::completion::CompletionHandler;
use super::queue::{QueueSnapshot, WorkQueue};
use super::retry::RetryScheduler;
use super::stats::{SchedulerStats, StatsHandle};
use super::submission::{SubmissionService, SubmitError};
use super::types::{CompletionSink, FailureCause, Outcome, TaskResult, UserData};
use super::worker::{WorkerContext, spawn_pool};
use crate::config::{ConfigError, SchedulerConfig};
use crate::remote::{StatusProbe, Submitter};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler has been stopped")]
    Stopped,

    #[error("no tokio runtime available to run workers")]
    NoRuntime,

    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The task was discarded without a result (a worker died while holding it).
    #[error("result of job {job_id} was lost")]
    ResultLost { job_id: JobId },
}

/// What `stop()` did.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Tasks finalized as `Failed` with cause `Shutdown`.
    pub drained: usize,
    pub workers_joined: usize,
    pub worker_panics: usize,
    pub stats: SchedulerStats,
}

/// Point-in-time scheduler status.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub name: String,
    pub running: bool,
    pub workers: usize,
    pub queue: QueueSnapshot,
    pub stats: SchedulerStats,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Tracks remote batch jobs from submission to a delivered result.
///
/// Several schedulers can live in one process; they share nothing.
///
/// Dropping a running scheduler cancels its workers without delivering
/// results for tasks still tracked. Call [`Scheduler::stop`] to finalize them.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<WorkQueue>,
    stats: StatsHandle,
    submission: SubmissionService,
    completion: CompletionHandler,
    workers: WorkerContext,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        submitter: Arc<dyn Submitter>,
        probe: Arc<dyn StatusProbe>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new(config.capacity()?));
        let stats = StatsHandle::default();
        let completion = CompletionHandler::new(queue.clone(), stats.clone());
        let retry = RetryScheduler::new(
            config.retry_policy(),
            queue.clone(),
            completion.clone(),
            stats.clone(),
        );
        let submission = SubmissionService::new(
            submitter,
            queue.clone(),
            stats.clone(),
            config.submit_timeout,
        );
        let workers = WorkerContext {
            queue: queue.clone(),
            probe,
            retry,
            completion: completion.clone(),
            stats: stats.clone(),
            poll_interval: config.poll_interval,
            probe_timeout: config.probe_timeout,
        };

        Ok(Self {
            config,
            queue,
            stats,
            submission,
            completion,
            workers,
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker pool on the current tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running(_) => return Err(SchedulerError::AlreadyRunning),
            Lifecycle::Stopped => return Err(SchedulerError::Stopped),
            Lifecycle::Idle => {}
        }

        let handles = spawn_pool(&runtime, &self.workers, self.config.workers, &self.shutdown);
        *lifecycle = Lifecycle::Running(handles);

        info!(
            scheduler = %self.config.name,
            workers = self.config.workers,
            capacity = self.queue.capacity(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the workers and finalize every task still tracked.
    ///
    /// Each remaining task receives a `Failed` result with cause `Shutdown`,
    /// so every admitted task gets exactly one result. Later submissions fail
    /// with [`SubmitError::Closed`].
    pub async fn stop(&self) -> Result<ShutdownReport, SchedulerError> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        let handles = match previous {
            Lifecycle::Stopped => return Err(SchedulerError::Stopped),
            Lifecycle::Idle => Vec::new(),
            Lifecycle::Running(handles) => handles,
        };

        self.shutdown.cancel();

        let mut workers_joined = 0;
        let mut worker_panics = 0;
        for handle in handles {
            match handle.await {
                Ok(()) => workers_joined += 1,
                Err(e) => {
                    worker_panics += 1;
                    error!(scheduler = %self.config.name, error = %e, "worker terminated abnormally");
                }
            }
        }

        let remaining = self.queue.close_and_drain();
        let drained = remaining.len();
        if drained > 0 {
            warn!(scheduler = %self.config.name, drained, "finalizing tracked tasks on shutdown");
        }
        for task in remaining {
            self.completion
                .finalize(task, Outcome::Failed(FailureCause::Shutdown));
        }

        let stats = self.stats.snapshot();
        info!(
            scheduler = %self.config.name,
            drained,
            completed = stats.completed,
            failed = stats.failed,
            "scheduler stopped"
        );

        Ok(ShutdownReport {
            drained,
            workers_joined,
            worker_panics,
            stats,
        })
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Submit a job; its result goes to `sink` once it reaches a terminal state.
    ///
    /// Submissions are accepted before `start()`; they are probed once workers run.
    pub async fn submit(
        &self,
        descriptor: &str,
        user_data: UserData,
        sink: CompletionSink,
    ) -> Result<JobId, SubmitError> {
        self.submission.submit(descriptor, user_data, sink).await
    }

    /// Submit a job and wait for its result.
    pub async fn submit_and_wait(
        &self,
        descriptor: &str,
        user_data: UserData,
    ) -> Result<TaskResult, SchedulerError> {
        let (sink, handle) = CompletionSink::channel();
        let job_id = self.submit(descriptor, user_data, sink).await?;
        handle
            .wait()
            .await
            .ok_or(SchedulerError::ResultLost { job_id })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            name: self.config.name.clone(),
            running: self.is_running(),
            workers: self.config.workers,
            queue: self.queue.snapshot(),
            stats: self.stats.snapshot(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("lifecycle", &*self.lifecycle())
            .finish_non_exhaustive()
    }
}
