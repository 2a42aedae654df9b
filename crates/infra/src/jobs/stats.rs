//! Scheduler runtime counters.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Counters shared by the submission path, workers and the completion handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub rejected_full: u64,
    pub probes: u64,
    pub probe_errors: u64,
    pub requeued: u64,
    pub retries_scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries_exhausted: u64,
    pub shutdown_failures: u64,
    pub delivery_errors: u64,
}

impl SchedulerStats {
    pub fn finalized(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Cloneable handle to one scheduler's counters.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<Mutex<SchedulerStats>>);

impl StatsHandle {
    pub fn update(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    pub fn snapshot(&self) -> SchedulerStats {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
