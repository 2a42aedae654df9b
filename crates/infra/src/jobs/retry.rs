//! Retry policy and scheduling after transient probe failures.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::completion::CompletionHandler;
use super::queue::WorkQueue;
use super::stats::StatsHandle;
use super::types::{FailureCause, Outcome, TaskRecord};
use crate::remote::RemoteError;

/// Exponential backoff without jitter: the k-th retry waits `2^k` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed probe (0 = fail on first error).
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on any single backoff delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor).min(Self::MAX_DELAY)
    }

    /// Whether a task with `retry_count` failures may be retried again.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }
}

/// What [`RetryScheduler::schedule_retry`] did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted { retries: u32 },
}

/// Puts failed tasks into the queue's delay heap or finalizes them.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Arc<WorkQueue>,
    completion: CompletionHandler,
    stats: StatsHandle,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        queue: Arc<WorkQueue>,
        completion: CompletionHandler,
        stats: StatsHandle,
    ) -> Self {
        Self {
            policy,
            queue,
            completion,
            stats,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handle a checked-out task whose probe failed with `cause`.
    pub fn schedule_retry(&self, mut task: TaskRecord, cause: RemoteError) -> RetryDecision {
        let attempt = task.record_probe_failure();

        if !self.policy.allows(attempt) {
            let retries = self.policy.max_retries;
            warn!(
                job_id = %task.id(),
                retries,
                error = %cause,
                "retries exhausted"
            );
            self.completion.finalize(
                task,
                Outcome::Failed(FailureCause::RetryExhausted {
                    retries,
                    last_error: cause,
                }),
            );
            return RetryDecision::Exhausted { retries };
        }

        let delay = self.policy.delay_for_retry(attempt);
        debug!(
            job_id = %task.id(),
            retry = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "retry scheduled"
        );
        self.queue.defer(task, Instant::now() + delay);
        self.stats.update(|s| s.retries_scheduled += 1);

        RetryDecision::Scheduled { attempt, delay }
    }
}
