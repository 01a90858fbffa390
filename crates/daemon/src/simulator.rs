//! Stand-in for the execution substrate: walks jobs through their states.

use std::sync::Arc;
use std::time::Duration;

use qualification_controller::store::{LabelSelector, ObjectStore};
use qualification_core::model::{ExecutionJob, JobState};
use qualification_core::now_ms;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// State a job moves to on the next tick, if any.
pub fn next_state(state: JobState) -> Option<JobState> {
    match state {
        JobState::Triggered => Some(JobState::Pending),
        JobState::Pending => Some(JobState::Success),
        _ => None,
    }
}

/// Advances every active job in `namespace` by one state per tick.
pub fn spawn(
    jobs: Arc<dyn ObjectStore<ExecutionJob>>,
    namespace: String,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick);
        loop {
            ticker.tick().await;
            if let Err(e) = advance(jobs.as_ref(), &namespace).await {
                warn!(error = %e, "simulator tick failed");
            }
        }
    })
}

async fn advance(
    jobs: &dyn ObjectStore<ExecutionJob>,
    namespace: &str,
) -> Result<(), qualification_controller::StoreError> {
    for mut job in jobs.list(namespace, &LabelSelector::everything()).await? {
        let Some(next) = next_state(job.status.state) else {
            continue;
        };
        job.status.state = next;
        if next.is_terminal() {
            job.status.completion_time_ms = Some(now_ms());
        }
        let name = job.metadata.name.clone();
        match jobs.update(job).await {
            Ok(_) => info!(job = %name, state = ?next, "simulated job progress"),
            // Someone else moved it; the next tick sees the fresh copy.
            Err(e) if e.is_conflict() || e.is_not_found() => debug!(job = %name, error = %e, "skipped"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
