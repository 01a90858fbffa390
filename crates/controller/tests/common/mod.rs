#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use qualification_controller::builder::TemplateJobBuilder;
use qualification_controller::resolver::{BuildConfiguration, StaticResolver, TestConfiguration};
use qualification_controller::store::{InMemoryStore, ObjectStore};
use qualification_controller::{ControllerConfig, RunController, StatusSyncer};
use qualification_core::meta::RUN_NAME_LABEL;
use qualification_core::model::{
    ConfigMetadata, ExecutionJob, JobSpec, JobState, PullRequest, PullRequestUnderTest,
    QualificationRun, QualificationRunSpec, QualificationRunStatus, ReleaseJobSpec,
};
use qualification_core::{ObjectKey, ObjectMeta};

pub const NS: &str = "ci";

pub fn config_metadata() -> ConfigMetadata {
    ConfigMetadata {
        org: "org".into(),
        repo: "repo".into(),
        branch: "main".into(),
        variant: None,
    }
}

pub fn release_job(test: &str) -> ReleaseJobSpec {
    ReleaseJobSpec {
        config: config_metadata(),
        test: test.into(),
        shard: None,
        aggregated_count: 0,
    }
}

pub fn job_name(test: &str) -> String {
    format!("periodic-ci-org-repo-main-{test}")
}

pub fn new_run(name: &str, jobs: Vec<ReleaseJobSpec>) -> QualificationRun {
    QualificationRun {
        metadata: ObjectMeta::named(NS, name),
        spec: QualificationRunSpec {
            pull_requests: vec![PullRequestUnderTest {
                org: "org".into(),
                repo: "repo".into(),
                base_ref: "main".into(),
                base_sha: "abc123".into(),
                pull_request: Some(PullRequest {
                    number: 100,
                    author: "dev".into(),
                    sha: "def456".into(),
                    title: "Fix the thing".into(),
                }),
            }],
            jobs: JobSpec {
                jobs,
                ..Default::default()
            },
            ..Default::default()
        },
        status: QualificationRunStatus::default(),
    }
}

fn resolver() -> StaticResolver {
    let tests = ["e2e-aws", "e2e-gcp", "e2e-metal"]
        .into_iter()
        .map(|name| TestConfiguration {
            name: name.into(),
            timeout_secs: None,
            cluster: None,
            env: BTreeMap::new(),
        })
        .collect();
    StaticResolver::new([BuildConfiguration {
        metadata: config_metadata(),
        canonical_go_repository: None,
        tests,
    }])
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        namespace: NS.into(),
        workers: 2,
        visibility_poll_interval: Duration::from_millis(5),
        visibility_timeout: Duration::from_millis(50),
        requeue_base_delay: Duration::from_millis(5),
        requeue_max_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

pub struct Harness {
    pub runs: Arc<InMemoryStore<QualificationRun>>,
    pub jobs: Arc<InMemoryStore<ExecutionJob>>,
    pub resolver: Arc<StaticResolver>,
    pub builder: Arc<TemplateJobBuilder>,
    pub config: ControllerConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self {
            runs: Arc::new(InMemoryStore::new()),
            jobs: Arc::new(InMemoryStore::new()),
            resolver: Arc::new(resolver()),
            builder: Arc::new(TemplateJobBuilder::default()),
            config,
        }
    }

    pub fn run_controller(&self) -> RunController {
        RunController::new(
            self.runs.clone(),
            self.jobs.clone(),
            self.resolver.clone(),
            self.builder.clone(),
            self.config.clone(),
        )
    }

    pub fn syncer(&self) -> StatusSyncer {
        StatusSyncer::new(self.runs.clone(), self.jobs.clone(), self.config.clone())
    }

    pub async fn create_run(&self, name: &str, tests: &[&str]) -> ObjectKey {
        let jobs = tests.iter().map(|t| release_job(t)).collect();
        self.create(new_run(name, jobs)).await
    }

    pub async fn create(&self, run: QualificationRun) -> ObjectKey {
        self.runs.create(run).await.unwrap().metadata.key()
    }

    pub async fn run(&self, key: &ObjectKey) -> QualificationRun {
        self.runs.get(key).await.unwrap()
    }

    /// Every job bound to a run, regardless of visibility.
    pub async fn jobs_of(&self, run_name: &str) -> Vec<ExecutionJob> {
        self.jobs
            .objects()
            .await
            .into_iter()
            .filter(|j| j.metadata.label(RUN_NAME_LABEL) == Some(run_name))
            .collect()
    }

    /// Moves the job backing `job_name` of a run to `state`, as the execution
    /// substrate would.
    pub async fn set_state(&self, run: &ObjectKey, job_name: &str, state: JobState) -> ObjectKey {
        let current = self.run(run).await;
        let entry = current
            .status
            .job(job_name)
            .unwrap_or_else(|| panic!("no status for {job_name}"));
        let key = ObjectKey::new(NS, entry.execution_job.clone().unwrap());
        let mut job = self.jobs.get(&key).await.unwrap();
        job.status.state = state;
        self.jobs.update(job).await.unwrap();
        key
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
