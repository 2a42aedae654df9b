//! Finalization of tasks that reached a terminal outcome.

use std::sync::Arc;

use tracing::{info, warn};

use super::queue::WorkQueue;
use super::stats::StatsHandle;
use super::types::{FailureCause, FinalStatus, Outcome, TaskRecord};

/// Turns a checked-out task into its result and hands it to the task's sink.
///
/// The record is consumed, so a task can be finalized at most once.
#[derive(Debug, Clone)]
pub struct CompletionHandler {
    queue: Arc<WorkQueue>,
    stats: StatsHandle,
}

impl CompletionHandler {
    pub fn new(queue: Arc<WorkQueue>, stats: StatsHandle) -> Self {
        Self { queue, stats }
    }

    /// Deliver the result and give back the task's queue slot.
    ///
    /// Delivery errors are logged and counted; the task is finalized regardless.
    pub fn finalize(&self, task: TaskRecord, outcome: Outcome) {
        let (result, sink) = task.into_result(outcome);
        let job_id = result.id.clone();
        let status = result.status;
        let cause = result.error.clone();

        info!(
            job_id = %job_id,
            status = %status,
            probe_failures = result.probe_failures,
            elapsed_ms = result.elapsed.as_millis() as u64,
            error = cause.as_ref().map(tracing::field::display),
            "task finalized"
        );

        let delivered = sink.deliver(result);

        self.stats.update(|s| {
            match status {
                FinalStatus::Completed => s.completed += 1,
                FinalStatus::Failed => s.failed += 1,
            }
            match cause {
                Some(FailureCause::RetryExhausted { .. }) => s.retries_exhausted += 1,
                Some(FailureCause::Shutdown) => s.shutdown_failures += 1,
                _ => {}
            }
            if delivered.is_err() {
                s.delivery_errors += 1;
            }
        });

        if let Err(e) = delivered {
            warn!(job_id = %job_id, error = %e, "result delivery failed");
        }

        self.queue.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{CompletionSink, UserData};
    use crate::remote::RemoteError;
    use jobtrack_core::{JobDescriptor, JobId};
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::sync::Mutex;

    fn setup() -> (Arc<WorkQueue>, StatsHandle, CompletionHandler) {
        let queue = Arc::new(WorkQueue::new(NonZeroUsize::new(2).unwrap()));
        let stats = StatsHandle::default();
        let handler = CompletionHandler::new(queue.clone(), stats.clone());
        (queue, stats, handler)
    }

    fn admit(queue: &WorkQueue, sink: CompletionSink) -> TaskRecord {
        let task = TaskRecord::new(
            JobId::new("job-7").unwrap(),
            JobDescriptor::parse("https://files.example.com/in.json").unwrap(),
            UserData::new(),
            sink,
        );
        queue.try_enqueue(task).unwrap();
        queue.try_dequeue().unwrap()
    }

    #[test]
    fn finalize_delivers_and_releases_slot() {
        let (queue, stats, handler) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            CompletionSink::callback(move |result| {
                seen.lock().unwrap().push(result);
                Ok(())
            })
        };

        let task = admit(&queue, sink);
        assert_eq!(queue.snapshot().in_flight, 1);
        handler.finalize(task, Outcome::Completed(Some(json!("P"))));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, Some(json!("P")));
        assert_eq!(queue.snapshot().tracked, 0);
        assert_eq!(stats.snapshot().completed, 1);
    }

    #[test]
    fn callback_errors_are_counted_not_propagated() {
        let (queue, stats, handler) = setup();
        let task = admit(
            &queue,
            CompletionSink::callback(|_| anyhow::bail!("sink offline")),
        );

        handler.finalize(
            task,
            Outcome::Failed(FailureCause::RetryExhausted {
                retries: 3,
                last_error: RemoteError::transport("reset"),
            }),
        );

        let snap = stats.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retries_exhausted, 1);
        assert_eq!(snap.delivery_errors, 1);
        assert_eq!(queue.snapshot().tracked, 0);
    }
}
