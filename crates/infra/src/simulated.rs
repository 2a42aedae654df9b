//! In-process stand-in for the remote compute service.
//!
//! Every job created through a [`SimulatedRemote`] walks the same probe
//! script; once a job has consumed the script its last step repeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::time::Instant;
use uuid::Uuid;

use jobtrack_core::{JobDescriptor, JobId};

use crate::remote::{ProbeReport, RemoteError, StatusProbe, Submitter};

/// One scripted probe answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStep {
    Report(ProbeReport),
    Error(RemoteError),
}

impl ProbeStep {
    pub fn pending() -> Self {
        Self::Report(ProbeReport::pending())
    }

    pub fn running() -> Self {
        Self::Report(ProbeReport::running())
    }

    pub fn completed(payload: JsonValue) -> Self {
        Self::Report(ProbeReport::completed(payload))
    }

    pub fn failed(detail: Option<JsonValue>) -> Self {
        Self::Report(ProbeReport::failed(detail))
    }

    pub fn error(err: RemoteError) -> Self {
        Self::Error(err)
    }
}

#[derive(Debug, Default)]
struct JobTrace {
    probes: usize,
    probed_at: Vec<Instant>,
    source: Option<String>,
}

/// Simulated remote implementing both [`Submitter`] and [`StatusProbe`].
#[derive(Debug)]
pub struct SimulatedRemote {
    script: Vec<ProbeStep>,
    latency: Duration,
    failing_submits: AtomicU32,
    submits: AtomicUsize,
    jobs: Mutex<HashMap<JobId, JobTrace>>,
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRemote {
    /// A remote whose jobs report `Completed` on the first probe.
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            latency: Duration::ZERO,
            failing_submits: AtomicU32::new(0),
            submits: AtomicUsize::new(0),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_script(mut self, script: Vec<ProbeStep>) -> Self {
        self.script = script;
        self
    }

    /// Delay applied to every submit and probe call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` submissions fail with a transport error.
    pub fn fail_next_submits(&self, n: u32) {
        self.failing_submits.store(n, Ordering::SeqCst);
    }

    /// Number of submit calls received, failed ones included.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self, job_id: &JobId) -> usize {
        self.lock().get(job_id).map_or(0, |t| t.probes)
    }

    /// When each probe of `job_id` arrived, in order.
    pub fn probe_instants(&self, job_id: &JobId) -> Vec<Instant> {
        self.lock()
            .get(job_id)
            .map(|t| t.probed_at.clone())
            .unwrap_or_default()
    }

    /// Descriptor the job was created from.
    pub fn source_of(&self, job_id: &JobId) -> Option<String> {
        self.lock().get(job_id).and_then(|t| t.source.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobTrace>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn step(&self, job_id: &JobId, index: usize) -> ProbeStep {
        match self.script.get(index).or_else(|| self.script.last()) {
            Some(step) => step.clone(),
            None => ProbeStep::completed(json!({ "job_id": job_id.as_str() })),
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Submitter for SimulatedRemote {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, RemoteError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let fail = self
            .failing_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(RemoteError::transport("simulated submit failure"));
        }

        let raw = format!("sim-{}", Uuid::now_v7());
        let job_id = JobId::new(raw.as_str()).map_err(|e| RemoteError::malformed(e.to_string()))?;
        self.lock().insert(
            job_id,
            JobTrace {
                source: Some(descriptor.to_string()),
                ..JobTrace::default()
            },
        );
        Ok(raw)
    }
}

#[async_trait]
impl StatusProbe for SimulatedRemote {
    async fn query(&self, job_id: &JobId) -> Result<ProbeReport, RemoteError> {
        let index = {
            let mut jobs = self.lock();
            let trace = jobs.get_mut(job_id).ok_or_else(|| RemoteError::Rejected {
                status: 404,
                message: format!("unknown job {job_id}"),
            })?;
            trace.probed_at.push(Instant::now());
            trace.probes += 1;
            trace.probes - 1
        };

        self.simulate_latency().await;

        match self.step(job_id, index) {
            ProbeStep::Report(report) => Ok(report),
            ProbeStep::Error(err) => Err(err),
        }
    }
}
