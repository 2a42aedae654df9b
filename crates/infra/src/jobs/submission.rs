//! Job submission: validate, create the remote job, start tracking it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use jobtrack_core::{DomainError, JobDescriptor, JobId};

use super::queue::{EnqueueError, WorkQueue};
use super::stats::StatsHandle;
use super::types::{CompletionSink, TaskRecord, UserData};
use crate::remote::{RemoteError, Submitter};

/// Why a submission was refused. Every variant is reported synchronously.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The descriptor is malformed; the remote service was not contacted.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] DomainError),

    /// The remote service did not create a job.
    #[error("remote submission failed: {0}")]
    Submission(RemoteError),

    /// The remote job exists but could not be tracked.
    #[error("work queue full (capacity {capacity}); remote job {job_id} is not tracked")]
    QueueFull { job_id: JobId, capacity: usize },

    /// The scheduler was stopped. Carries the remote id if a job was created anyway.
    #[error("scheduler is stopped{}", .job_id.as_ref().map(|id| format!("; remote job {id} is not tracked")).unwrap_or_default())]
    Closed { job_id: Option<JobId> },
}

impl SubmitError {
    /// Remote job created but left untracked, if any.
    pub fn orphaned_job(&self) -> Option<&JobId> {
        match self {
            SubmitError::QueueFull { job_id, .. } => Some(job_id),
            SubmitError::Closed { job_id } => job_id.as_ref(),
            _ => None,
        }
    }
}

/// Front door of the scheduler.
#[derive(Clone)]
pub struct SubmissionService {
    submitter: Arc<dyn Submitter>,
    queue: Arc<WorkQueue>,
    stats: StatsHandle,
    submit_timeout: Duration,
}

impl SubmissionService {
    pub fn new(
        submitter: Arc<dyn Submitter>,
        queue: Arc<WorkQueue>,
        stats: StatsHandle,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            submitter,
            queue,
            stats,
            submit_timeout,
        }
    }

    /// Create one remote job for `descriptor` and admit it for tracking.
    ///
    /// No deduplication: submitting the same descriptor twice creates two jobs.
    pub async fn submit(
        &self,
        descriptor: &str,
        user_data: UserData,
        sink: CompletionSink,
    ) -> Result<JobId, SubmitError> {
        let descriptor = JobDescriptor::parse(descriptor)?;

        if self.queue.is_closed() {
            return Err(SubmitError::Closed { job_id: None });
        }

        let raw_id = tokio::time::timeout(self.submit_timeout, self.submitter.submit(&descriptor))
            .await
            .map_err(|_| SubmitError::Submission(RemoteError::Timeout(self.submit_timeout)))?
            .map_err(|e| {
                warn!(source = %descriptor, error = %e, "remote submission failed");
                SubmitError::Submission(e)
            })?;

        let job_id = JobId::new(raw_id).map_err(|e| {
            SubmitError::Submission(RemoteError::malformed(format!("submit returned {e}")))
        })?;

        let task = TaskRecord::new(job_id.clone(), descriptor, user_data, sink);
        match self.queue.try_enqueue(task) {
            Ok(()) => {
                self.stats.update(|s| s.submitted += 1);
                info!(job_id = %job_id, "submission accepted");
                Ok(job_id)
            }
            Err(EnqueueError::Full(_)) => {
                let capacity = self.queue.capacity();
                self.stats.update(|s| s.rejected_full += 1);
                error!(job_id = %job_id, capacity, "work queue full, remote job left untracked");
                Err(SubmitError::QueueFull { job_id, capacity })
            }
            Err(EnqueueError::Closed(_)) => {
                error!(job_id = %job_id, "scheduler stopped during submission, remote job left untracked");
                Err(SubmitError::Closed {
                    job_id: Some(job_id),
                })
            }
        }
    }
}

impl std::fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionService")
            .field("queue", &self.queue)
            .field("submit_timeout", &self.submit_timeout)
            .finish_non_exhaustive()
    }
}
