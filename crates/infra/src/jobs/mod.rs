//! Remote job tracking with bounded queueing, retry and backoff.
//!
//! ## Design
//!
//! - Every admitted task holds one queue slot until its result is delivered
//! - Pending/running jobs are re-probed on every poll tick
//! - Probe failures back off exponentially (`2^k` units) up to a retry budget
//! - Each task's result is delivered exactly once, including on shutdown
//!
//! ## Components
//!
//! - `SubmissionService`: validates, creates the remote job, admits the task
//! - `WorkQueue`: slot-reserving queue with a backlog and a retry delay heap
//! - worker loop: probes tasks and routes each result
//! - `RetryScheduler`: backoff and retry exhaustion
//! - `CompletionHandler`: builds the `TaskResult` and hands it to the sink
//! - `Scheduler`: owns all of the above and the worker pool

pub mod completion;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod submission;
pub mod types;
mod worker;

pub use completion::CompletionHandler;
pub use queue::{EnqueueError, QueueSnapshot, WorkQueue};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStatus, ShutdownReport};
pub use stats::{SchedulerStats, StatsHandle};
pub use submission::{SubmissionService, SubmitError};
pub use types::{
    CompletionCallback, CompletionHandle, CompletionSink, DeliveryError, FailureCause,
    FinalStatus, Outcome, TaskRecord, TaskResult, UserData,
};
