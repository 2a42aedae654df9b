use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use jobtrack_infra::jobs::{CompletionSink, Scheduler, UserData};
use jobtrack_infra::remote::RemoteError;
use jobtrack_infra::simulated::{ProbeStep, SimulatedRemote};
use jobtrack_infra::SchedulerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobtrack_observability::init();

    let config = SchedulerConfig::from_env()
        .context("loading scheduler configuration")?
        .with_name("jobtrack-sim");

    let jobs: usize = match std::env::var("JOBTRACK_SIM_JOBS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("JOBTRACK_SIM_JOBS={raw:?} is not a number"))?,
        Err(_) => 5,
    };

    let remote = Arc::new(
        SimulatedRemote::new()
            .with_latency(Duration::from_millis(50))
            .with_script(vec![
                ProbeStep::pending(),
                ProbeStep::running(),
                ProbeStep::error(RemoteError::transport("connection reset")),
                ProbeStep::completed(json!({ "embeddings": 128 })),
            ]),
    );

    let scheduler = Scheduler::new(config, remote.clone(), remote)?;
    scheduler.start()?;

    let mut handles = Vec::with_capacity(jobs);
    for i in 0..jobs {
        let mut user_data = UserData::new();
        user_data.insert("batch".to_string(), json!(i));

        let (sink, handle) = CompletionSink::channel();
        let descriptor = format!("https://files.example.com/batch/texts_{i}.json");
        match scheduler.submit(&descriptor, user_data, sink).await {
            Ok(job_id) => handles.push((job_id, handle)),
            Err(e) => tracing::error!(error = %e, descriptor, "submission rejected"),
        }
    }

    for (job_id, handle) in handles {
        match handle.wait().await {
            Some(result) => tracing::info!(
                job_id = %result.id,
                status = %result.status,
                payload = ?result.payload,
                error = result.error.as_ref().map(tracing::field::display),
                user_data = ?result.user_data,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "job finished"
            ),
            None => tracing::warn!(job_id = %job_id, "job result lost"),
        }
    }

    let status = scheduler.status();
    tracing::info!(status = %serde_json::to_string(&status)?, "final scheduler status");

    let report = scheduler.stop().await?;
    tracing::info!(
        drained = report.drained,
        completed = report.stats.completed,
        failed = report.stats.failed,
        "simulation finished"
    );
    Ok(())
}
