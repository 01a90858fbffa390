//! Turning a resolved configuration into an execution job document.

use std::collections::BTreeMap;
use std::time::Duration;

use qualification_core::model::{
    ConfigMetadata, ExecutionJobDocument, PayloadOverrides, PullRequestUnderTest,
    QualificationRunSpec, Refs, TestSelector,
};
use qualification_core::naming;
use thiserror::Error;

use crate::resolver::BuildConfiguration;

/// Env var carrying the payload the jobs test.
pub const ENV_RELEASE_IMAGE_LATEST: &str = "RELEASE_IMAGE_LATEST";
/// Env var carrying the payload upgrade tests start from.
pub const ENV_RELEASE_IMAGE_INITIAL: &str = "RELEASE_IMAGE_INITIAL";
/// Prefix of per-image tag override env vars.
pub const ENV_OVERRIDE_IMAGE_PREFIX: &str = "OVERRIDE_IMAGE_";
/// Env var making per-run inputs distinct across runs of the same test.
pub const ENV_UNIQUE_HASH_INPUT: &str = "UNIQUE_HASH_INPUT";
/// Env var distinguishing the members of an aggregated job.
pub const ENV_TARGET_ADDITIONAL_SUFFIX: &str = "TARGET_ADDITIONAL_SUFFIX";

/// Pull request and payload inputs of a job.
#[derive(Debug, Clone, Copy)]
pub struct PullRequestContext<'a> {
    /// Sources under test.
    pub pull_requests: &'a [PullRequestUnderTest],
    /// Payload upgrade tests start from.
    pub initial_payload_base: Option<&'a str>,
    /// Payload adjustments; aggregated members run without them.
    pub payload_overrides: Option<&'a PayloadOverrides>,
}

impl<'a> PullRequestContext<'a> {
    /// Context of a run's plain jobs.
    pub fn for_run(spec: &'a QualificationRunSpec) -> Self {
        Self {
            pull_requests: &spec.pull_requests,
            initial_payload_base: spec.initial_payload_base.as_deref(),
            payload_overrides: Some(&spec.payload_overrides),
        }
    }

    /// Same sources, default payload.
    pub fn without_payload_overrides(self) -> Self {
        Self {
            initial_payload_base: None,
            payload_overrides: None,
            ..self
        }
    }
}

/// Inputs of [`JobBuilder::build_job`].
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Resolved configuration with the selected test injected.
    pub config: &'a BuildConfiguration,
    /// Selected test.
    pub selector: &'a TestSelector,
    /// Sources and payload.
    pub context: PullRequestContext<'a>,
    /// Owning run, for per-run inputs.
    pub run_name: &'a str,
    /// Member index when building one job of an aggregated set.
    pub aggregated_index: Option<u32>,
}

/// Inputs of [`JobBuilder::build_aggregator`].
#[derive(Debug, Clone, Copy)]
pub struct AggregatorRequest<'a> {
    /// Sources under test.
    pub base: &'a ConfigMetadata,
    /// Derived name of the aggregator.
    pub aggregator_name: &'a str,
    /// Base name shared by the aggregated members.
    pub verified_job_name: &'a str,
    /// Label value shared by members and aggregator.
    pub aggregation_id: &'a str,
    /// Number of members.
    pub member_count: u32,
    /// Owning run.
    pub run_name: &'a str,
    /// When the members were started.
    pub start_time_ms: i64,
}

/// A built job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltJob {
    /// What to run.
    pub document: ExecutionJobDocument,
    /// Human-readable name the job is submitted under.
    pub job_name: String,
}

/// Failure to build a job document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The resolved configuration lacks the selected test.
    #[error("test '{0}' not found in resolved configuration")]
    TestNotFound(String),
    /// The inputs cannot be rendered into a document.
    #[error("failed to render job: {0}")]
    Render(String),
}

/// Deterministically builds execution job documents.
pub trait JobBuilder: Send + Sync {
    /// Builds the document of a plain or aggregated member job.
    fn build_job(&self, request: &BuildRequest<'_>) -> Result<BuiltJob, BuildError>;

    /// Builds the document of the job that aggregates member results.
    fn build_aggregator(&self, request: &AggregatorRequest<'_>) -> Result<BuiltJob, BuildError>;
}

/// Routes tests whose name contains `contains` to `cluster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRule {
    /// Substring of the test name.
    pub contains: String,
    /// Target build cluster.
    pub cluster: String,
}

impl ClusterRule {
    fn new(contains: &str, cluster: &str) -> Self {
        Self {
            contains: contains.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

/// Reference [`JobBuilder`] producing documents from configuration and
/// routing rules.
#[derive(Debug, Clone)]
pub struct TemplateJobBuilder {
    /// Cluster used when nothing else applies.
    pub default_cluster: String,
    /// Ordered name-based routing; first match wins.
    pub cluster_rules: Vec<ClusterRule>,
    /// Timeout of tests that do not set one.
    pub job_timeout: Duration,
    /// Minimum timeout when several pull requests are tested together.
    pub multi_ref_timeout: Duration,
    /// Timeout of aggregator jobs.
    pub aggregator_timeout: Duration,
}

impl Default for TemplateJobBuilder {
    fn default() -> Self {
        Self {
            default_cluster: "build03".to_string(),
            cluster_rules: vec![
                ClusterRule::new("vsphere", "vsphere02"),
                ClusterRule::new("metal", "build05"),
                ClusterRule::new("telco5g", "build05"),
                ClusterRule::new("e2e-agent", "build05"),
            ],
            job_timeout: Duration::from_secs(6 * 3600),
            multi_ref_timeout: Duration::from_secs(8 * 3600),
            aggregator_timeout: Duration::from_secs(8 * 3600),
        }
    }
}

impl TemplateJobBuilder {
    fn cluster_for(&self, test: &str, pinned: Option<&str>) -> String {
        if let Some(cluster) = pinned {
            return cluster.to_string();
        }
        self.cluster_rules
            .iter()
            .find(|rule| test.contains(&rule.contains))
            .map(|rule| rule.cluster.clone())
            .unwrap_or_else(|| self.default_cluster.clone())
    }
}

/// Groups pull requests into one checkout per `org/repo`, sorted.
fn refs_for(prs: &[PullRequestUnderTest], path_alias: Option<&str>) -> Vec<Refs> {
    let mut grouped: BTreeMap<(&str, &str), Refs> = BTreeMap::new();
    for pr in prs {
        let refs = grouped
            .entry((pr.org.as_str(), pr.repo.as_str()))
            .or_insert_with(|| Refs {
                org: pr.org.clone(),
                repo: pr.repo.clone(),
                base_ref: pr.base_ref.clone(),
                base_sha: pr.base_sha.clone(),
                path_alias: None,
                pulls: Vec::new(),
            });
        refs.pulls.extend(pr.pull_request.clone());
    }
    let mut refs: Vec<Refs> = grouped.into_values().collect();
    if let [only] = refs.as_mut_slice() {
        only.path_alias = path_alias.map(str::to_string);
    }
    refs
}

fn override_env_name(image: &str) -> String {
    format!(
        "{ENV_OVERRIDE_IMAGE_PREFIX}{}",
        image.to_ascii_uppercase().replace(['-', '.'], "_")
    )
}

impl JobBuilder for TemplateJobBuilder {
    fn build_job(&self, request: &BuildRequest<'_>) -> Result<BuiltJob, BuildError> {
        let test_name = &request.selector.test;
        let test = request
            .config
            .test(test_name)
            .ok_or_else(|| BuildError::TestNotFound(test_name.clone()))?;
        let prs = request.context.pull_requests;

        let mut env = test.env.clone();
        env.insert(ENV_UNIQUE_HASH_INPUT.to_string(), request.run_name.to_string());
        if let Some(overrides) = request.context.payload_overrides {
            if let Some(pull_spec) = &overrides.base_pull_spec {
                env.insert(ENV_RELEASE_IMAGE_LATEST.to_string(), pull_spec.clone());
            }
            for image in &overrides.image_tag_overrides {
                if image.name.is_empty() {
                    return Err(BuildError::Render(format!(
                        "image tag override '{}' has no image name",
                        image.tag
                    )));
                }
                env.insert(override_env_name(&image.name), image.tag.clone());
            }
        }
        if let Some(initial) = request.context.initial_payload_base {
            env.insert(ENV_RELEASE_IMAGE_INITIAL.to_string(), initial.to_string());
        }
        if let Some(index) = request.aggregated_index {
            env.insert(ENV_TARGET_ADDITIONAL_SUFFIX.to_string(), index.to_string());
        }

        let mut timeout = test
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.job_timeout);
        if prs.len() > 1 {
            timeout = timeout.max(self.multi_ref_timeout);
        }

        let job_name = naming::submitted_job_name(request.selector, prs);
        Ok(BuiltJob {
            document: ExecutionJobDocument {
                job: job_name.clone(),
                cluster: self.cluster_for(test_name, test.cluster.as_deref()),
                timeout_secs: timeout.as_secs(),
                env,
                refs: refs_for(prs, request.config.canonical_go_repository.as_deref()),
            },
            job_name,
        })
    }

    fn build_aggregator(&self, request: &AggregatorRequest<'_>) -> Result<BuiltJob, BuildError> {
        if request.member_count == 0 {
            return Err(BuildError::Render(format!(
                "aggregator {} has no members",
                request.aggregator_name
            )));
        }
        let env = BTreeMap::from([
            (
                "VERIFICATION_JOB_NAME".to_string(),
                request.verified_job_name.to_string(),
            ),
            ("AGGREGATION_ID".to_string(), request.aggregation_id.to_string()),
            ("JOB_START_TIME".to_string(), request.start_time_ms.to_string()),
            ("MEMBER_COUNT".to_string(), request.member_count.to_string()),
            (
                "EXPLICIT_GCS_PREFIX".to_string(),
                format!(
                    "logs/{}/{}",
                    request.aggregator_name, request.aggregation_id
                ),
            ),
            (ENV_UNIQUE_HASH_INPUT.to_string(), request.run_name.to_string()),
        ]);
        Ok(BuiltJob {
            document: ExecutionJobDocument {
                job: request.aggregator_name.to_string(),
                cluster: self.default_cluster.clone(),
                timeout_secs: self.aggregator_timeout.as_secs(),
                env,
                refs: Vec::new(),
            },
            job_name: request.aggregator_name.to_string(),
        })
    }
}
