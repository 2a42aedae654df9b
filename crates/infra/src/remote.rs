//! Ports to the remote compute service.
//!
//! The scheduler never speaks a vendor protocol itself. It depends on two
//! collaborators: a [`Submitter`] that creates a remote job and a
//! [`StatusProbe`] that reports on it. Vendor adapters implement these.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use jobtrack_core::{JobDescriptor, JobId, TaskStatus};

/// Failure talking to the remote service.
///
/// Every variant is treated as transient by the probing path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed remote response: {0}")]
    Malformed(String),

    /// The collaborator panicked while handling the call.
    #[error("remote call panicked: {0}")]
    Panicked(String),
}

impl RemoteError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub status: TaskStatus,
    /// Result payload (when `Completed`) or failure detail (when `Failed`).
    pub payload: Option<JsonValue>,
}

impl ProbeReport {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            payload: None,
        }
    }

    pub fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            payload: None,
        }
    }

    pub fn completed(payload: JsonValue) -> Self {
        Self {
            status: TaskStatus::Completed,
            payload: Some(payload),
        }
    }

    pub fn failed(detail: Option<JsonValue>) -> Self {
        Self {
            status: TaskStatus::Failed,
            payload: detail,
        }
    }

    /// Build a report from a raw wire status string.
    ///
    /// Unknown status strings are a malformed response, which the worker
    /// retries like any other transient error.
    pub fn from_wire(status: &str, payload: Option<JsonValue>) -> Result<Self, RemoteError> {
        let status = status
            .parse::<TaskStatus>()
            .map_err(|e| RemoteError::malformed(e.to_string()))?;
        Ok(Self { status, payload })
    }
}

/// Creates remote asynchronous jobs.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Create one remote job for `descriptor` and return its raw job id.
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, RemoteError>;
}

/// Queries the state of remote jobs. Must be non-destructive.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn query(&self, job_id: &JobId) -> Result<ProbeReport, RemoteError>;
}
