//! Expands qualification runs into execution jobs and gates their deletion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use qualification_core::condition::{self, Condition};
use qualification_core::merge::{merge_run_status, MergeAnomaly};
use qualification_core::meta::{
    AGGREGATION_ID_LABEL, DEPENDENT_JOBS_FINALIZER, JOB_NAME_ANNOTATION, JOB_NAME_HASH_LABEL,
    RUN_NAME_LABEL,
};
use qualification_core::model::{
    ExecutionJob, ExecutionJobDocument, ExecutionJobStatus, JobState, QualificationRun,
    ReleaseJobSpec, RunJobStatus, TestSelector,
};
use qualification_core::{naming, new_ulid, now_ms, ObjectKey, ObjectMeta, Resource};
use tracing::{debug, error, info, warn};

use crate::backoff::{poll_until, retry_on_conflict, PollError};
use crate::builder::{AggregatorRequest, BuildRequest, JobBuilder, PullRequestContext};
use crate::config::ControllerConfig;
use crate::error::{ReconcileError, StoreError};
use crate::resolver::{BuildConfiguration, ConfigResolver};
use crate::runtime::Reconciler;
use crate::store::{LabelSelector, ObjectStore, WatchEvent};

/// Existing jobs of a run keyed by their name-hash label.
type JobsByHash<'a> = HashMap<&'a str, &'a ExecutionJob>;

/// Why a job could not be materialized.
enum CreateFailure {
    Rejected(StoreError),
    NotVisible { job: String, error: PollError },
}

impl CreateFailure {
    fn into_status(self, job_name: &str) -> RunJobStatus {
        match self {
            Self::Rejected(e) => {
                RunJobStatus::error(job_name, None, format!("failed to create job: {e}"))
            }
            Self::NotVisible { job, error } => RunJobStatus::error(
                job_name,
                Some(job.clone()),
                format!("created job {job} did not become visible: {error}"),
            ),
        }
    }

    /// Entry of an aggregator whose member `member` could not be
    /// materialized. The member is never recorded as the backing job; the
    /// next pass finds it by hash.
    fn into_member_status(self, job_name: &str, member: &str) -> RunJobStatus {
        let description = match self {
            Self::Rejected(e) => format!("failed to create aggregated job {member}: {e}"),
            Self::NotVisible { job, error } => {
                format!("created aggregated job {member} ({job}) did not become visible: {error}")
            }
        };
        RunJobStatus::error(job_name, None, description)
    }
}

/// Reconciles [`QualificationRun`]s.
///
/// A live run has every requested job materialized exactly once and its
/// outcome recorded in `status.jobs` together with `AllJobsTriggered`. A run
/// being deleted keeps the dependent-jobs finalizer until all of its jobs are
/// terminal.
pub struct RunController {
    runs: Arc<dyn ObjectStore<QualificationRun>>,
    jobs: Arc<dyn ObjectStore<ExecutionJob>>,
    resolver: Arc<dyn ConfigResolver>,
    builder: Arc<dyn JobBuilder>,
    config: ControllerConfig,
}

impl RunController {
    /// Creates a controller over the given stores and collaborators.
    pub fn new(
        runs: Arc<dyn ObjectStore<QualificationRun>>,
        jobs: Arc<dyn ObjectStore<ExecutionJob>>,
        resolver: Arc<dyn ConfigResolver>,
        builder: Arc<dyn JobBuilder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            runs,
            jobs,
            resolver,
            builder,
            config,
        }
    }

    /// Selects run notifications to reconcile: creations and updates in the
    /// namespace. Updates carry deletion requests and status writes.
    pub fn run_event_key(namespace: &str, event: &WatchEvent<QualificationRun>) -> Option<ObjectKey> {
        match event {
            WatchEvent::Added(run) | WatchEvent::Modified { new: run, .. }
                if run.metadata.namespace == namespace =>
            {
                Some(run.key())
            }
            _ => None,
        }
    }

    /// Maps a job reaching a terminal state to its owning run, so a pending
    /// deletion is re-evaluated even for jobs without a status entry.
    pub fn job_event_key(namespace: &str, event: &WatchEvent<ExecutionJob>) -> Option<ObjectKey> {
        let WatchEvent::Modified { old, new } = event else {
            return None;
        };
        if new.metadata.namespace != namespace
            || !old.status.state.is_active()
            || !new.status.state.is_terminal()
        {
            return None;
        }
        new.metadata
            .label(RUN_NAME_LABEL)
            .map(|run| ObjectKey::new(namespace, run))
    }

    async fn list_jobs(&self, run: &QualificationRun) -> Result<Vec<ExecutionJob>, ReconcileError> {
        let selector = LabelSelector::matching(RUN_NAME_LABEL, &run.metadata.name);
        self.jobs
            .list(&run.metadata.namespace, &selector)
            .await
            .map_err(|e| ReconcileError::list(format!("jobs of run {}", run.key()), e))
    }

    async fn reconcile_jobs(&self, run: &QualificationRun) -> Result<(), ReconcileError> {
        let existing = self.list_jobs(run).await?;
        let by_hash: JobsByHash<'_> = existing
            .iter()
            .filter_map(|job| job.metadata.label(JOB_NAME_HASH_LABEL).map(|h| (h, job)))
            .collect();
        let recorded: HashMap<&str, &RunJobStatus> = run
            .status
            .jobs
            .iter()
            .map(|j| (j.job_name.as_str(), j))
            .collect();

        let mut computed = BTreeMap::new();
        for spec in &run.spec.jobs.jobs {
            let job_name = spec.job_name();
            if computed.contains_key(&job_name) {
                continue;
            }
            let status = match recorded.get(job_name.as_str()) {
                Some(status) if status.status.state != JobState::Error => (*status).clone(),
                _ => match by_hash.get(naming::job_name_hash(&job_name).as_str()) {
                    Some(job) => {
                        info!(job_name, job = %job.metadata.name, "adopting existing job");
                        RunJobStatus::for_job(&job_name, job)
                    }
                    None => self.trigger(run, spec, &job_name, &by_hash).await,
                },
            };
            computed.insert(job_name, status);
        }

        let triggered = condition::all_jobs_triggered(computed.values(), now_ms());
        self.write_status(&run.key(), &computed, triggered).await
    }

    async fn trigger(
        &self,
        run: &QualificationRun,
        spec: &ReleaseJobSpec,
        job_name: &str,
        by_hash: &JobsByHash<'_>,
    ) -> RunJobStatus {
        let selector = spec.selector();
        let base = naming::base_metadata(&run.spec.pull_requests);
        let config = match self.resolver.resolve_config(&base, &selector).await {
            Ok(config) => config,
            Err(e) => {
                error!(job_name, error = %e, "failed to resolve configuration");
                return RunJobStatus::error(
                    job_name,
                    None,
                    format!("failed to resolve configuration: {e}"),
                );
            }
        };

        if spec.aggregated_count > 0 {
            return self
                .trigger_aggregated(run, spec, job_name, &config, &selector, by_hash)
                .await;
        }

        let request = BuildRequest {
            config: &config,
            selector: &selector,
            context: PullRequestContext::for_run(&run.spec),
            run_name: &run.metadata.name,
            aggregated_index: None,
        };
        let built = match self.builder.build_job(&request) {
            Ok(built) => built,
            Err(e) => {
                error!(job_name, error = %e, "failed to build job");
                return RunJobStatus::error(job_name, None, format!("failed to build job: {e}"));
            }
        };

        let job = self.new_job(run, job_name, built.document, None);
        match self.create_and_wait(job).await {
            Ok(created) => {
                info!(job_name, job = %created.metadata.name, submitted = %built.job_name, "triggered job");
                RunJobStatus::for_job(job_name, &created)
            }
            Err(failure) => {
                let status = failure.into_status(job_name);
                error!(job_name, error = ?status.status.description, "failed to trigger job");
                status
            }
        }
    }

    async fn trigger_aggregated(
        &self,
        run: &QualificationRun,
        spec: &ReleaseJobSpec,
        job_name: &str,
        config: &BuildConfiguration,
        selector: &TestSelector,
        by_hash: &JobsByHash<'_>,
    ) -> RunJobStatus {
        let run_name = run.metadata.name.as_str();
        let aggregation_id = naming::aggregation_id(run_name, job_name);
        let context = PullRequestContext::for_run(&run.spec).without_payload_overrides();
        let start_time_ms = now_ms();

        for index in 0..spec.aggregated_count {
            let member = naming::aggregated_member_name(spec, index);
            if by_hash.contains_key(naming::job_name_hash(&member).as_str()) {
                debug!(job_name = %member, "aggregated job already exists");
                continue;
            }
            let request = BuildRequest {
                config,
                selector,
                context,
                run_name,
                aggregated_index: Some(index),
            };
            let built = match self.builder.build_job(&request) {
                Ok(built) => built,
                Err(e) => {
                    error!(job_name = %member, error = %e, "failed to build aggregated job");
                    return RunJobStatus::error(
                        job_name,
                        None,
                        format!("failed to build aggregated job {member}: {e}"),
                    );
                }
            };
            let job = self.new_job(run, &member, built.document, Some(&aggregation_id));
            if let Err(failure) = self.create_and_wait(job).await {
                let status = failure.into_member_status(job_name, &member);
                error!(job_name = %member, error = ?status.status.description, "failed to trigger aggregated job");
                return status;
            }
        }

        let base = naming::base_metadata(&run.spec.pull_requests);
        let verified_job_name = naming::base_job_name(spec);
        let request = AggregatorRequest {
            base: &base,
            aggregator_name: job_name,
            verified_job_name: &verified_job_name,
            aggregation_id: &aggregation_id,
            member_count: spec.aggregated_count,
            run_name,
            start_time_ms,
        };
        let built = match self.builder.build_aggregator(&request) {
            Ok(built) => built,
            Err(e) => {
                error!(job_name, error = %e, "failed to build aggregator job");
                return RunJobStatus::error(job_name, None, format!("failed to build aggregator job: {e}"));
            }
        };
        let job = self.new_job(run, job_name, built.document, Some(&aggregation_id));
        match self.create_and_wait(job).await {
            Ok(created) => {
                info!(
                    job_name,
                    job = %created.metadata.name,
                    members = spec.aggregated_count,
                    "triggered aggregated jobs"
                );
                RunJobStatus::for_job(job_name, &created)
            }
            Err(failure) => failure.into_status(job_name),
        }
    }

    fn new_job(
        &self,
        run: &QualificationRun,
        job_name: &str,
        document: ExecutionJobDocument,
        aggregation_id: Option<&str>,
    ) -> ExecutionJob {
        let name = new_ulid().to_string().to_lowercase();
        let mut metadata = ObjectMeta::named(&run.metadata.namespace, name);
        metadata
            .labels
            .insert(RUN_NAME_LABEL.to_string(), run.metadata.name.clone());
        metadata
            .labels
            .insert(JOB_NAME_HASH_LABEL.to_string(), naming::job_name_hash(job_name));
        if let Some(id) = aggregation_id {
            metadata
                .labels
                .insert(AGGREGATION_ID_LABEL.to_string(), id.to_string());
        }
        metadata
            .annotations
            .insert(JOB_NAME_ANNOTATION.to_string(), job_name.to_string());
        ExecutionJob {
            metadata,
            spec: document,
            status: ExecutionJobStatus {
                state: JobState::Triggered,
                start_time_ms: Some(now_ms()),
                ..Default::default()
            },
        }
    }

    /// Creates a job and waits, bounded, until reads observe it.
    async fn create_and_wait(&self, job: ExecutionJob) -> Result<ExecutionJob, CreateFailure> {
        let key = job.key();
        let created = self.jobs.create(job).await.map_err(CreateFailure::Rejected)?;

        let jobs = &self.jobs;
        let key = &key;
        poll_until(
            self.config.visibility_poll_interval,
            self.config.visibility_timeout,
            move || async move {
                match jobs.get(key).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .map_err(|error| CreateFailure::NotVisible {
            job: key.name.clone(),
            error,
        })?;
        Ok(created)
    }

    /// Merges the computed view into a fresh copy of the run and writes it
    /// unless nothing changed.
    async fn write_status(
        &self,
        key: &ObjectKey,
        computed: &BTreeMap<String, RunJobStatus>,
        triggered: Condition,
    ) -> Result<(), ReconcileError> {
        let runs = &self.runs;
        let result = retry_on_conflict(self.config.conflict_retries, move || {
            let triggered = triggered.clone();
            async move {
                let mut run = runs.get(key).await?;
                if run.metadata.is_deleting() {
                    return Ok(false);
                }
                let before = run.clone();
                run.metadata.add_finalizer(DEPENDENT_JOBS_FINALIZER);
                let anomalies = merge_run_status(&mut run, computed, triggered);
                log_anomalies(&anomalies);
                if run == before {
                    return Ok(false);
                }
                runs.update(run).await?;
                Ok(true)
            }
        })
        .await;

        match result {
            Ok(true) => info!("updated run status"),
            Ok(false) => debug!("run status is up to date"),
            Err(e) if e.is_not_found() => debug!("run was removed before its status was written"),
            Err(e) => return Err(ReconcileError::update(format!("run {key}"), e)),
        }
        Ok(())
    }

    async fn reconcile_deletion(&self, run: &QualificationRun) -> Result<(), ReconcileError> {
        if !run.metadata.has_finalizer(DEPENDENT_JOBS_FINALIZER) {
            debug!("run is being deleted and holds no finalizer");
            return Ok(());
        }

        let jobs = self.list_jobs(run).await?;
        let active: Vec<&ExecutionJob> = jobs
            .iter()
            .filter(|j| j.status.state.is_active())
            .collect();
        if !active.is_empty() {
            if self.config.abort_on_delete {
                for job in &active {
                    self.abort(job, &run.metadata.name).await;
                }
            }
            info!(
                active = active.len(),
                "waiting for dependent jobs to finish before releasing finalizer"
            );
            return Ok(());
        }

        let key = run.key();
        let runs = &self.runs;
        let key_ref = &key;
        let released = retry_on_conflict(self.config.conflict_retries, move || async move {
            let mut fresh = runs.get(key_ref).await?;
            if !fresh.metadata.remove_finalizer(DEPENDENT_JOBS_FINALIZER) {
                return Ok(false);
            }
            runs.update(fresh).await?;
            Ok(true)
        })
        .await;
        match released {
            Ok(true) => info!(jobs = jobs.len(), "released dependent-jobs finalizer"),
            Ok(false) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(ReconcileError::update(format!("finalizers of run {key}"), e)),
        }

        if self.config.delete_jobs_on_cleanup {
            for job in &jobs {
                match self.jobs.delete(&job.key()).await {
                    Ok(()) => debug!(job = %job.metadata.name, "deleted job"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(job = %job.metadata.name, error = %e, "failed to delete job"),
                }
            }
        }
        Ok(())
    }

    /// Moves an active job to `Aborted`. Failures are logged; the next pass
    /// tries again.
    async fn abort(&self, job: &ExecutionJob, run_name: &str) {
        let key = job.key();
        let jobs = &self.jobs;
        let key_ref = &key;
        let result = retry_on_conflict(self.config.conflict_retries, move || async move {
            let mut fresh = jobs.get(key_ref).await?;
            if fresh.status.state.is_terminal() {
                return Ok(false);
            }
            fresh.status.state = JobState::Aborted;
            fresh.status.completion_time_ms = Some(now_ms());
            fresh.status.description = Some(format!(
                "Aborted because qualification run {run_name} is being deleted"
            ));
            jobs.update(fresh).await?;
            Ok(true)
        })
        .await;
        match result {
            Ok(true) => info!(job = %key.name, "aborted job"),
            Ok(false) => {}
            Err(e) => warn!(job = %key.name, error = %e, "failed to abort job"),
        }
    }
}

fn log_anomalies(anomalies: &[MergeAnomaly]) {
    for anomaly in anomalies {
        match anomaly {
            MergeAnomaly::BackingJobMismatch {
                job_name,
                persisted,
                computed,
            } => warn!(
                job_name,
                persisted = ?persisted,
                computed = ?computed,
                "backing job changed between persisted and computed status; keeping computed"
            ),
            MergeAnomaly::MissingStatus { .. } => error!(%anomaly, "status merge invariant violated"),
        }
    }
}

#[async_trait]
impl Reconciler for RunController {
    fn name(&self) -> &'static str {
        "run-controller"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let run = match self.runs.get(key).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => {
                debug!("run no longer exists");
                return Ok(());
            }
            Err(e) => return Err(ReconcileError::fetch(format!("run {key}"), e)),
        };
        if run.metadata.is_deleting() {
            self.reconcile_deletion(&run).await
        } else {
            self.reconcile_jobs(&run).await
        }
    }
}
