//! Wires both controllers to their stores, watches and workers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use qualification_core::meta::RUN_NAME_LABEL;
use qualification_core::model::{ExecutionJob, QualificationRun};
use qualification_core::Resource;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::builder::JobBuilder;
use crate::config::{ConfigError, ControllerConfig};
use crate::error::StoreError;
use crate::resolver::ConfigResolver;
use crate::run_controller::RunController;
use crate::runtime::{Controller, WorkQueue};
use crate::status_sync::StatusSyncer;
use crate::store::{LabelSelector, ObjectStore};

/// Runs the run controller and the status syncer side by side.
pub struct Manager {
    config: ControllerConfig,
    runs: Arc<dyn ObjectStore<QualificationRun>>,
    jobs: Arc<dyn ObjectStore<ExecutionJob>>,
    resolver: Arc<dyn ConfigResolver>,
    builder: Arc<dyn JobBuilder>,
}

impl Manager {
    /// Validates the configuration and assembles a manager.
    pub fn new(
        config: ControllerConfig,
        runs: Arc<dyn ObjectStore<QualificationRun>>,
        jobs: Arc<dyn ObjectStore<ExecutionJob>>,
        resolver: Arc<dyn ConfigResolver>,
        builder: Arc<dyn JobBuilder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            runs,
            jobs,
            resolver,
            builder,
        })
    }

    /// Runs both controllers until `shutdown` completes, then drains workers.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let cfg = &self.config;
        let run_controller = Arc::new(Controller::new(
            Arc::new(RunController::new(
                Arc::clone(&self.runs),
                Arc::clone(&self.jobs),
                Arc::clone(&self.resolver),
                Arc::clone(&self.builder),
                cfg.clone(),
            )),
            cfg.requeue_base_delay,
            cfg.requeue_max_delay,
        ));
        let syncer = Arc::new(Controller::new(
            Arc::new(StatusSyncer::new(
                Arc::clone(&self.runs),
                Arc::clone(&self.jobs),
                cfg.clone(),
            )),
            cfg.requeue_base_delay,
            cfg.requeue_max_delay,
        ));

        // Subscribe before the first list so nothing falls in between.
        let mut background = Vec::new();
        let ns = cfg.namespace.clone();
        background.push(run_controller.watch(self.runs.watch(), move |e| {
            RunController::run_event_key(&ns, e)
        }));
        let ns = cfg.namespace.clone();
        background.push(run_controller.watch(self.jobs.watch(), move |e| {
            RunController::job_event_key(&ns, e)
        }));
        let ns = cfg.namespace.clone();
        background.push(syncer.watch(self.jobs.watch(), move |e| {
            StatusSyncer::job_event_key(&ns, e)
        }));
        background.push(spawn_resync(
            Arc::clone(&self.runs),
            Arc::clone(&self.jobs),
            cfg.namespace.clone(),
            cfg.resync_interval,
            run_controller.queue(),
            syncer.queue(),
        ));

        let mut workers = run_controller.spawn_workers(cfg.workers);
        workers.extend(syncer.spawn_workers(cfg.workers));
        info!(namespace = %cfg.namespace, workers = cfg.workers, "controllers started");

        shutdown.await;

        info!("shutting down controllers");
        run_controller.queue().shutdown().await;
        syncer.queue().shutdown().await;
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }
        for task in background {
            task.abort();
        }
    }
}

/// Periodically lists everything in the namespace and queues it, recovering
/// from missed notifications. The first pass runs immediately.
fn spawn_resync(
    runs: Arc<dyn ObjectStore<QualificationRun>>,
    jobs: Arc<dyn ObjectStore<ExecutionJob>>,
    namespace: String,
    period: Duration,
    run_queue: Arc<WorkQueue>,
    job_queue: Arc<WorkQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        loop {
            tick.tick().await;
            if let Err(e) =
                resync(runs.as_ref(), jobs.as_ref(), &namespace, &run_queue, &job_queue).await
            {
                warn!(error = %e, "resync failed");
            }
        }
    })
}

async fn resync(
    runs: &dyn ObjectStore<QualificationRun>,
    jobs: &dyn ObjectStore<ExecutionJob>,
    namespace: &str,
    run_queue: &WorkQueue,
    job_queue: &WorkQueue,
) -> Result<(), StoreError> {
    let all = LabelSelector::everything();
    let listed_runs = runs.list(namespace, &all).await?;
    let listed_jobs = jobs.list(namespace, &all).await?;
    let bound_jobs: Vec<&ExecutionJob> = listed_jobs
        .iter()
        .filter(|j| j.metadata.labels.contains_key(RUN_NAME_LABEL))
        .collect();
    debug!(runs = listed_runs.len(), jobs = bound_jobs.len(), "resync");
    for run in &listed_runs {
        run_queue.add(run.key()).await;
    }
    for job in bound_jobs {
        job_queue.add(job.key()).await;
    }
    Ok(())
}
