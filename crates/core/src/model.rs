//! Persisted object shapes: qualification runs and execution jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{ObjectMeta, Resource};
use crate::naming;

/// Execution state of a job, as reported by the execution substrate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the substrate to accept the job.
    Scheduling,
    /// Accepted, not yet running.
    #[default]
    Triggered,
    /// Running.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with a test failure.
    Failure,
    /// Finished with an infrastructure or configuration error.
    Error,
    /// Stopped before finishing.
    Aborted,
}

impl JobState {
    /// True for states that represent in-flight work.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Scheduling | Self::Triggered | Self::Pending)
    }

    /// True for states that represent completion.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Last observed state of an execution job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionJobStatus {
    /// Current state.
    #[serde(default)]
    pub state: JobState,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<i64>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time_ms: Option<i64>,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Link to logs or results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ExecutionJobStatus {
    /// A terminal `Error` status with a description.
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            state: JobState::Error,
            description: Some(description.into()),
            ..Default::default()
        }
    }
}

/// A pull request merged on top of its base for testing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    /// Pull request number.
    pub number: u64,
    /// Author login.
    pub author: String,
    /// Head revision.
    pub sha: String,
    /// Title.
    #[serde(default)]
    pub title: String,
}

/// A repository base, optionally with a pull request on top.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestUnderTest {
    /// Organization.
    pub org: String,
    /// Repository.
    pub repo: String,
    /// Base branch.
    pub base_ref: String,
    /// Base revision.
    pub base_sha: String,
    /// Pull request; absent when testing the base alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequest>,
}

/// Identity of a build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigMetadata {
    /// Organization.
    pub org: String,
    /// Repository.
    pub repo: String,
    /// Branch.
    pub branch: String,
    /// Configuration variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Shard placement of a test split across several jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shard {
    /// 1-based shard index.
    pub index: u32,
    /// Total shards.
    pub count: u32,
}

/// One requested release job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseJobSpec {
    /// Configuration the test is defined in.
    #[serde(flatten)]
    pub config: ConfigMetadata,
    /// Test name within the configuration.
    pub test: String,
    /// Shard placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<Shard>,
    /// Number of aggregated member jobs; zero for a plain job.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub aggregated_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ReleaseJobSpec {
    /// Deterministic name used as the idempotency key for this job.
    pub fn job_name(&self) -> String {
        naming::derived_job_name(self)
    }

    /// Selector handed to the config resolver.
    pub fn selector(&self) -> TestSelector {
        TestSelector {
            config: self.config.clone(),
            test: self.test.clone(),
        }
    }
}

/// A test within a specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TestSelector {
    /// Configuration identity.
    #[serde(flatten)]
    pub config: ConfigMetadata,
    /// Test name.
    pub test: String,
}

/// Which job-selection configuration produced the job list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSource {
    /// Product version stream.
    #[serde(default)]
    pub ocp: String,
    /// Release name.
    #[serde(default)]
    pub release: String,
    /// Specifier within the release, e.g. `informing`.
    #[serde(default)]
    pub specifier: String,
    /// Revision of the selection configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// The ordered list of jobs to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    /// Where the list came from.
    #[serde(default)]
    pub source: JobSource,
    /// Requested jobs, in order.
    #[serde(default)]
    pub jobs: Vec<ReleaseJobSpec>,
}

/// Replaces one image of the payload with a tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageTagOverride {
    /// Image name in the payload.
    pub name: String,
    /// Tag to use instead.
    pub tag: String,
}

/// Adjustments to the payload the jobs test against.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadOverrides {
    /// Alternate base payload pull-spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_pull_spec: Option<String>,
    /// Per-image tag overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_tag_overrides: Vec<ImageTagOverride>,
}

/// Immutable request of a qualification run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualificationRunSpec {
    /// Pull requests under test.
    #[serde(default)]
    pub pull_requests: Vec<PullRequestUnderTest>,
    /// Jobs to run.
    pub jobs: JobSpec,
    /// Payload to upgrade from, for upgrade tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_payload_base: Option<String>,
    /// Payload adjustments.
    #[serde(default)]
    pub payload_overrides: PayloadOverrides,
}

/// Recorded status of one requested job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunJobStatus {
    /// Derived job name.
    pub job_name: String,
    /// Name of the backing execution job, if one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_job: Option<String>,
    /// Last observed state.
    #[serde(default)]
    pub status: ExecutionJobStatus,
}

impl RunJobStatus {
    /// Status entry for a job that could not be triggered.
    pub fn error(
        job_name: impl Into<String>,
        execution_job: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            execution_job,
            status: ExecutionJobStatus::error(description),
        }
    }

    /// Status entry mirroring an existing execution job.
    pub fn for_job(job_name: impl Into<String>, job: &ExecutionJob) -> Self {
        Self {
            job_name: job_name.into(),
            execution_job: Some(job.metadata.name.clone()),
            status: job.status.clone(),
        }
    }
}

/// Status of a qualification run, written only by the controllers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualificationRunStatus {
    /// Aggregate conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// One entry per requested job, in request order.
    #[serde(default)]
    pub jobs: Vec<RunJobStatus>,
}

impl QualificationRunStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Looks up a job entry by derived name.
    pub fn job(&self, job_name: &str) -> Option<&RunJobStatus> {
        self.jobs.iter().find(|j| j.job_name == job_name)
    }
}

/// User-declared request to run a battery of jobs against pull requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualificationRun {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Request.
    pub spec: QualificationRunSpec,
    /// Progress.
    #[serde(default)]
    pub status: QualificationRunStatus,
}

impl Resource for QualificationRun {
    const KIND: &'static str = "QualificationRun";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A source checkout: base plus merged pull requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Refs {
    /// Organization.
    pub org: String,
    /// Repository.
    pub repo: String,
    /// Base branch.
    pub base_ref: String,
    /// Base revision.
    pub base_sha: String,
    /// Checkout path alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_alias: Option<String>,
    /// Pull requests merged on top.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<PullRequest>,
}

/// Description of what an execution job runs. Opaque to the controllers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionJobDocument {
    /// Name the job is submitted under.
    pub job: String,
    /// Build cluster to run on.
    pub cluster: String,
    /// Hard timeout.
    pub timeout_secs: u64,
    /// Environment passed to the job.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Sources to check out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<Refs>,
}

/// A materialized unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionJob {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// What to run.
    pub spec: ExecutionJobDocument,
    /// Progress, written by the execution substrate.
    #[serde(default)]
    pub status: ExecutionJobStatus,
}

impl Resource for ExecutionJob {
    const KIND: &'static str = "ExecutionJob";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
