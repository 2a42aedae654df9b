//! Core task types: the in-flight record, its final result, and completion sinks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use jobtrack_core::{DomainError, DomainResult, JobDescriptor, JobId, TaskStatus};

use crate::remote::RemoteError;

/// Caller-supplied key/value data carried through to the result unchanged.
pub type UserData = serde_json::Map<String, JsonValue>;

/// Terminal status of a finalized task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Completed,
    Failed,
}

impl From<FinalStatus> for TaskStatus {
    fn from(value: FinalStatus) -> Self {
        match value {
            FinalStatus::Completed => TaskStatus::Completed,
            FinalStatus::Failed => TaskStatus::Failed,
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        TaskStatus::from(*self).fmt(f)
    }
}

/// Why a task finished as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    /// The remote service reported the job as failed.
    #[error("remote job failed: {}", .detail.as_deref().unwrap_or("no detail reported"))]
    RemoteFailed { detail: Option<String> },

    /// Probing kept failing until the retry budget ran out.
    #[error("retries exhausted after {retries} retries: {last_error}")]
    RetryExhausted { retries: u32, last_error: RemoteError },

    /// The scheduler stopped while the task was still tracked.
    #[error("scheduler shut down before the job reached a terminal state")]
    Shutdown,
}

impl FailureCause {
    /// Build a `RemoteFailed` cause from the payload a probe returned.
    pub fn remote_failed(payload: Option<JsonValue>) -> Self {
        let detail = match payload {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Self::RemoteFailed { detail }
    }
}

/// How a task ended, as handed to the completion handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Option<JsonValue>),
    Failed(FailureCause),
}

/// Immutable result delivered exactly once per tracked task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub id: JobId,
    pub status: FinalStatus,
    /// Remote result payload; `None` for failures.
    pub payload: Option<JsonValue>,
    pub error: Option<FailureCause>,
    pub user_data: UserData,
    pub source: JobDescriptor,
    /// Number of failed probes over the task's lifetime.
    pub probe_failures: u32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Time from record creation to finalization.
    pub elapsed: Duration,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == FinalStatus::Completed
    }
}

/// Completion callback. Errors are logged; they never undo finalization.
pub type CompletionCallback = Box<dyn FnOnce(TaskResult) -> anyhow::Result<()> + Send + 'static>;

/// Where a task's result goes once it is finalized.
pub enum CompletionSink {
    /// Invoke a closure with the result.
    Callback(CompletionCallback),
    /// Send the result to an awaiting [`CompletionHandle`].
    Channel(oneshot::Sender<TaskResult>),
    /// Drop the result (fire-and-forget submissions).
    Ignore,
}

impl CompletionSink {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(TaskResult) -> anyhow::Result<()> + Send + 'static,
    {
        Self::Callback(Box::new(f))
    }

    /// Create a channel sink and the handle that resolves with its result.
    pub fn channel() -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (Self::Channel(tx), CompletionHandle { rx })
    }

    pub(crate) fn deliver(self, result: TaskResult) -> Result<(), DeliveryError> {
        match self {
            CompletionSink::Callback(f) => match catch_unwind(AssertUnwindSafe(|| f(result))) {
                Ok(outcome) => outcome.map_err(DeliveryError::Callback),
                Err(payload) => Err(DeliveryError::Panicked(panic_message(payload.as_ref()))),
            },
            CompletionSink::Channel(tx) => tx
                .send(result)
                .map_err(|_| DeliveryError::ReceiverDropped),
            CompletionSink::Ignore => Ok(()),
        }
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionSink::Callback(_) => f.write_str("CompletionSink::Callback"),
            CompletionSink::Channel(_) => f.write_str("CompletionSink::Channel"),
            CompletionSink::Ignore => f.write_str("CompletionSink::Ignore"),
        }
    }
}

/// Failure to hand a result to its sink.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("completion callback failed: {0:#}")]
    Callback(anyhow::Error),

    #[error("completion callback panicked: {0}")]
    Panicked(String),

    #[error("completion receiver was dropped")]
    ReceiverDropped,
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Awaitable side of [`CompletionSink::channel`].
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<TaskResult>,
}

impl CompletionHandle {
    /// Wait for the task's result.
    ///
    /// Returns `None` only if the task was discarded without finalization,
    /// which happens when a running scheduler is dropped instead of stopped.
    pub async fn wait(self) -> Option<TaskResult> {
        self.rx.await.ok()
    }
}

/// In-memory state of one tracked remote job.
///
/// A record only ever holds a non-terminal status: reaching `Completed` or
/// `Failed` consumes it through [`TaskRecord::into_result`].
#[derive(Debug)]
pub struct TaskRecord {
    id: JobId,
    source: JobDescriptor,
    submitted_at: DateTime<Utc>,
    created: Instant,
    status: TaskStatus,
    retry_count: u32,
    user_data: UserData,
    sink: CompletionSink,
}

impl TaskRecord {
    pub fn new(id: JobId, source: JobDescriptor, user_data: UserData, sink: CompletionSink) -> Self {
        Self {
            id,
            source,
            submitted_at: Utc::now(),
            created: Instant::now(),
            status: TaskStatus::Pending,
            retry_count: 0,
            user_data,
            sink,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn source(&self) -> &JobDescriptor {
        &self.source
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Record a non-terminal status reported by a probe.
    pub fn observe(&mut self, status: TaskStatus) -> DomainResult<()> {
        if status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "task {} can only become {status} through finalization",
                self.id
            )));
        }
        if !self.status.can_transition_to(status) {
            return Err(DomainError::invariant(format!(
                "task {} cannot move from {} to {status}",
                self.id, self.status
            )));
        }
        self.status = status;
        Ok(())
    }

    /// Count one failed probe and return the new retry count.
    pub fn record_probe_failure(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Consume the record into its result and the sink that must receive it.
    pub fn into_result(self, outcome: Outcome) -> (TaskResult, CompletionSink) {
        let (status, payload, error) = match outcome {
            Outcome::Completed(payload) => (FinalStatus::Completed, payload, None),
            Outcome::Failed(cause) => (FinalStatus::Failed, None, Some(cause)),
        };

        let result = TaskResult {
            elapsed: self.created.elapsed(),
            id: self.id,
            status,
            payload,
            error,
            user_data: self.user_data,
            source: self.source,
            probe_failures: self.retry_count,
            submitted_at: self.submitted_at,
            finished_at: Utc::now(),
        };

        (result, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(sink: CompletionSink) -> TaskRecord {
        let mut user_data = UserData::new();
        user_data.insert("k".into(), json!("v"));
        TaskRecord::new(
            JobId::new("job-1").unwrap(),
            JobDescriptor::parse("https://files.example.com/in.json").unwrap(),
            user_data,
            sink,
        )
    }

    #[test]
    fn new_record_defaults() {
        let task = record(CompletionSink::Ignore);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.retry_count(), 0);
        assert_eq!(task.user_data().get("k"), Some(&json!("v")));
    }

    #[test]
    fn observe_accepts_only_non_terminal_statuses() {
        let mut task = record(CompletionSink::Ignore);
        task.observe(TaskStatus::Running).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        task.observe(TaskStatus::Pending).unwrap();

        let err = task.observe(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn retry_count_only_increases() {
        let mut task = record(CompletionSink::Ignore);
        assert_eq!(task.record_probe_failure(), 1);
        assert_eq!(task.record_probe_failure(), 2);
        assert_eq!(task.retry_count(), 2);
    }

    #[test]
    fn into_result_copies_record_fields() {
        let mut task = record(CompletionSink::Ignore);
        task.record_probe_failure();

        let (result, _sink) = task.into_result(Outcome::Completed(Some(json!({"n": 3}))));
        assert!(result.is_success());
        assert_eq!(result.id.as_str(), "job-1");
        assert_eq!(result.payload, Some(json!({"n": 3})));
        assert_eq!(result.error, None);
        assert_eq!(result.probe_failures, 1);
        assert_eq!(result.user_data.get("k"), Some(&json!("v")));
        assert!(result.finished_at >= result.submitted_at);
    }

    #[test]
    fn failed_outcome_drops_payload() {
        let task = record(CompletionSink::Ignore);
        let (result, _sink) = task.into_result(Outcome::Failed(FailureCause::Shutdown));
        assert_eq!(result.status, FinalStatus::Failed);
        assert_eq!(result.payload, None);
        assert_eq!(result.error, Some(FailureCause::Shutdown));
    }

    #[test]
    fn remote_failed_detail_extraction() {
        assert_eq!(
            FailureCause::remote_failed(Some(json!("quota exceeded"))),
            FailureCause::RemoteFailed {
                detail: Some("quota exceeded".into())
            }
        );
        assert_eq!(
            FailureCause::remote_failed(Some(JsonValue::Null)),
            FailureCause::RemoteFailed { detail: None }
        );
        assert_eq!(
            FailureCause::remote_failed(Some(json!({"code": 7}))).to_string(),
            "remote job failed: {\"code\":7}"
        );
        assert_eq!(
            FailureCause::RemoteFailed { detail: None }.to_string(),
            "remote job failed: no detail reported"
        );
    }

    #[test]
    fn callback_sink_reports_callback_errors() {
        let sink = CompletionSink::callback(|_result| anyhow::bail!("downstream unavailable"));
        let (result, _) = record(CompletionSink::Ignore).into_result(Outcome::Completed(None));

        let err = sink.deliver(result).unwrap_err();
        assert!(matches!(err, DeliveryError::Callback(_)));
        assert_eq!(
            err.to_string(),
            "completion callback failed: downstream unavailable"
        );
    }

    #[test]
    fn callback_panics_become_delivery_errors() {
        let sink = CompletionSink::callback(|result| panic!("bad result {}", result.id));
        let (result, _) = record(CompletionSink::Ignore).into_result(Outcome::Completed(None));

        let err = sink.deliver(result).unwrap_err();
        assert!(matches!(err, DeliveryError::Panicked(ref msg) if msg == "bad result job-1"));
        assert_eq!(
            err.to_string(),
            "completion callback panicked: bad result job-1"
        );
    }

    #[tokio::test]
    async fn channel_sink_resolves_handle() {
        let (sink, handle) = CompletionSink::channel();
        let (result, sink_from_record) = record(sink).into_result(Outcome::Completed(None));
        sink_from_record.deliver(result).unwrap();

        let delivered = handle.wait().await.unwrap();
        assert_eq!(delivered.id.as_str(), "job-1");
    }

    #[tokio::test]
    async fn dropped_channel_sink_resolves_to_none() {
        let (sink, handle) = CompletionSink::channel();
        drop(sink);
        assert!(handle.wait().await.is_none());
    }
}
