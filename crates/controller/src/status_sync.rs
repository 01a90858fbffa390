//! Propagates execution job state into the owning run.

use std::sync::Arc;

use async_trait::async_trait;
use qualification_core::condition;
use qualification_core::merge::apply_job_status;
use qualification_core::meta::RUN_NAME_LABEL;
use qualification_core::model::{ExecutionJob, QualificationRun};
use qualification_core::{now_ms, ObjectKey, Resource};
use tracing::{debug, info};

use crate::backoff::retry_on_conflict;
use crate::config::ControllerConfig;
use crate::error::ReconcileError;
use crate::runtime::Reconciler;
use crate::store::{ObjectStore, WatchEvent};

/// Reconciles [`ExecutionJob`]s by copying their status into the entries of
/// the owning run that they back and recomputing `AllJobsFinished`.
pub struct StatusSyncer {
    runs: Arc<dyn ObjectStore<QualificationRun>>,
    jobs: Arc<dyn ObjectStore<ExecutionJob>>,
    config: ControllerConfig,
}

impl StatusSyncer {
    /// Creates a syncer over the given stores.
    pub fn new(
        runs: Arc<dyn ObjectStore<QualificationRun>>,
        jobs: Arc<dyn ObjectStore<ExecutionJob>>,
        config: ControllerConfig,
    ) -> Self {
        Self { runs, jobs, config }
    }

    /// Selects job notifications to reconcile: updates of jobs bound to a
    /// run, in the namespace.
    pub fn job_event_key(namespace: &str, event: &WatchEvent<ExecutionJob>) -> Option<ObjectKey> {
        match event {
            WatchEvent::Modified { new, .. }
                if new.metadata.namespace == namespace
                    && new.metadata.labels.contains_key(RUN_NAME_LABEL) =>
            {
                Some(new.key())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Reconciler for StatusSyncer {
    fn name(&self) -> &'static str {
        "status-syncer"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let job = match self.jobs.get(key).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                debug!("job no longer exists");
                return Ok(());
            }
            Err(e) => return Err(ReconcileError::fetch(format!("job {key}"), e)),
        };
        let Some(run_name) = job.metadata.label(RUN_NAME_LABEL) else {
            return Err(ReconcileError::Terminal(format!(
                "job {key} has no {RUN_NAME_LABEL} label"
            )));
        };
        let run_key = ObjectKey::new(&key.namespace, run_name);

        match self.runs.get(&run_key).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::Terminal(format!(
                    "run {run_key} owning job {key} no longer exists"
                )));
            }
            Err(e) => return Err(ReconcileError::fetch(format!("run {run_key}"), e)),
        }

        let runs = &self.runs;
        let (job_ref, run_key_ref) = (&job, &run_key);
        let result = retry_on_conflict(self.config.conflict_retries, move || async move {
            let mut run = runs.get(run_key_ref).await?;
            let before = run.status.clone();
            apply_job_status(&mut run.status, job_ref);
            let finished = condition::all_jobs_finished(&run.status.jobs, now_ms());
            condition::set_condition(&mut run.status.conditions, finished);
            if run.status == before {
                return Ok(false);
            }
            runs.update(run).await?;
            Ok(true)
        })
        .await;

        match result {
            Ok(true) => info!(run = %run_key, state = ?job.status.state, "updated run status"),
            Ok(false) => debug!(run = %run_key, "run status is up to date"),
            Err(e) => return Err(ReconcileError::update(format!("run {run_key}"), e)),
        }
        Ok(())
    }
}
