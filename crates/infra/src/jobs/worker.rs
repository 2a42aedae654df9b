//! Worker loop: probes tracked tasks and routes each probe result.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobtrack_core::TaskStatus;

use super::completion::CompletionHandler;
use super::queue::WorkQueue;
use super::retry::RetryScheduler;
use super::stats::StatsHandle;
use super::types::{FailureCause, Outcome, TaskRecord, panic_message};
use crate::remote::{RemoteError, StatusProbe};

/// Everything a worker needs; cloned once per worker in the pool.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub queue: Arc<WorkQueue>,
    pub probe: Arc<dyn StatusProbe>,
    pub retry: RetryScheduler,
    pub completion: CompletionHandler,
    pub stats: StatsHandle,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

/// Spawn `workers` loops on `runtime`.
pub(crate) fn spawn_pool(
    runtime: &Handle,
    ctx: &WorkerContext,
    workers: usize,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|index| {
            let worker = Worker {
                index,
                ctx: ctx.clone(),
                shutdown: shutdown.clone(),
            };
            runtime.spawn(worker.run())
        })
        .collect()
}

struct Worker {
    index: usize,
    ctx: WorkerContext,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!(worker = self.index, "worker started");

        let poll = self.ctx.poll_interval;
        let start = Instant::now().checked_add(poll).unwrap_or_else(Instant::now);
        let mut tick = tokio::time::interval_at(start, poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Registered before reading the deadline so an earlier retry
            // deferred by another worker in between still wakes this one.
            let rescheduled = self.ctx.queue.rescheduled();
            let next_due = self.ctx.queue.next_due();

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.ctx.queue.arrived() => self.drain_arrivals().await,
                _ = sleep_until(next_due) => self.drain_arrivals().await,
                _ = rescheduled => continue,
                _ = tick.tick() => {
                    self.drain_arrivals().await;
                    self.sweep_backlog().await;
                }
            }
        }

        info!(worker = self.index, "worker stopped");
    }

    /// Probe every fresh arrival and every retry that came due.
    async fn drain_arrivals(&self) {
        while !self.shutdown.is_cancelled() {
            let Some(task) = self.ctx.queue.take_arrival() else {
                break;
            };
            self.process(task).await;
        }
    }

    /// Probe each task that was parked in the backlog before this sweep began.
    async fn sweep_backlog(&self) {
        let cutoff = Instant::now();
        while !self.shutdown.is_cancelled() {
            let Some(task) = self.ctx.queue.take_backlog_before(cutoff) else {
                break;
            };
            self.process(task).await;
        }
    }

    async fn process(&self, mut task: TaskRecord) {
        let timeout = self.ctx.probe_timeout;
        let query = AssertUnwindSafe(self.ctx.probe.query(task.id())).catch_unwind();
        let probed = match tokio::time::timeout(timeout, query).await {
            Ok(Ok(probed)) => probed,
            Ok(Err(payload)) => {
                let msg = panic_message(payload.as_ref());
                error!(worker = self.index, job_id = %task.id(), panic = %msg, "status probe panicked");
                Err(RemoteError::Panicked(msg))
            }
            Err(_) => Err(RemoteError::Timeout(timeout)),
        };

        self.ctx.stats.update(|s| {
            s.probes += 1;
            if probed.is_err() {
                s.probe_errors += 1;
            }
        });

        let report = match probed {
            Ok(report) => report,
            Err(e) => {
                debug!(worker = self.index, job_id = %task.id(), error = %e, "probe failed");
                self.ctx.retry.schedule_retry(task, e);
                return;
            }
        };

        debug!(
            worker = self.index,
            job_id = %task.id(),
            status = %report.status,
            "probe result"
        );

        match report.status {
            TaskStatus::Completed => self
                .ctx
                .completion
                .finalize(task, Outcome::Completed(report.payload)),
            TaskStatus::Failed => self.ctx.completion.finalize(
                task,
                Outcome::Failed(FailureCause::remote_failed(report.payload)),
            ),
            status @ (TaskStatus::Pending | TaskStatus::Running) => {
                if let Err(e) = task.observe(status) {
                    error!(job_id = %task.id(), error = %e, "rejected status update");
                }
                self.ctx.queue.requeue(task);
                self.ctx.stats.update(|s| s.requeued += 1);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
