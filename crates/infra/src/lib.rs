//! Infrastructure layer: the job tracking engine, remote ports and configuration.

pub mod config;
pub mod jobs;
pub mod remote;
pub mod simulated;

pub use config::{ConfigError, SchedulerConfig};
pub use jobs::{CompletionSink, Scheduler, SchedulerError, SubmitError, TaskResult, UserData};
pub use remote::{ProbeReport, RemoteError, StatusProbe, Submitter};
pub use simulated::{ProbeStep, SimulatedRemote};
