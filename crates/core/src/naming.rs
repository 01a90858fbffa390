//! Deterministic job identity.
//!
//! Every function here is pure: the same inputs always yield the same names
//! and hashes, which is what makes repeated reconciliation idempotent.

use sha2::{Digest, Sha224};

use crate::model::{ConfigMetadata, PullRequestUnderTest, ReleaseJobSpec, TestSelector};

/// Prefix of the derived name of jobs that mimic periodic release jobs.
pub const PERIODIC_PREFIX: &str = "periodic-ci";
/// Prefix of the derived name of an aggregator job.
pub const AGGREGATOR_PREFIX: &str = "aggregator";

/// Name of the release job a spec mimics, ignoring aggregation.
pub fn base_job_name(spec: &ReleaseJobSpec) -> String {
    let ConfigMetadata {
        org,
        repo,
        branch,
        variant,
    } = &spec.config;
    let mut name = format!("{PERIODIC_PREFIX}-{org}-{repo}-{branch}");
    if let Some(variant) = variant.as_deref().filter(|v| !v.is_empty()) {
        name.push('-');
        name.push_str(variant);
    }
    name.push('-');
    name.push_str(&spec.test);
    if let Some(shard) = spec.shard {
        name.push_str(&format!("-{}of{}", shard.index, shard.count));
    }
    name
}

/// Name under which a spec's status is recorded.
///
/// Aggregated specs are tracked through their aggregator job.
pub fn derived_job_name(spec: &ReleaseJobSpec) -> String {
    let base = base_job_name(spec);
    if spec.aggregated_count > 0 {
        format!("{AGGREGATOR_PREFIX}-{base}")
    } else {
        base
    }
}

/// Derived name of the `index`th member of an aggregated spec.
pub fn aggregated_member_name(spec: &ReleaseJobSpec, index: u32) -> String {
    format!("{}-{index}", base_job_name(spec))
}

/// Content hash of a derived job name: hex SHA-224, 56 characters, always a
/// valid label value.
pub fn job_name_hash(job_name: &str) -> String {
    hex::encode(Sha224::digest(job_name.as_bytes()))
}

/// Identifier shared by the members and the aggregator of one aggregated spec.
pub fn aggregation_id(run_name: &str, derived_name: &str) -> String {
    job_name_hash(&format!("{run_name}{derived_name}"))
}

/// Name a job is submitted under: the refs under test, then variant and test.
pub fn submitted_job_name(selector: &TestSelector, prs: &[PullRequestUnderTest]) -> String {
    let mut parts: Vec<String> = prs
        .iter()
        .map(|pr| match &pr.pull_request {
            Some(pull) => format!("{}-{}-{}", pr.org, pr.repo, pull.number),
            None => format!("{}-{}", pr.org, pr.repo),
        })
        .collect();
    if let Some(variant) = selector.config.variant.as_deref().filter(|v| !v.is_empty()) {
        parts.push(variant.to_string());
    }
    parts.push(selector.test.clone());
    parts.join("-")
}

/// Configuration identity of the sources under test.
///
/// Several pull requests yield comma-joined fields.
pub fn base_metadata(prs: &[PullRequestUnderTest]) -> ConfigMetadata {
    let join = |f: fn(&PullRequestUnderTest) -> &str| {
        prs.iter().map(f).collect::<Vec<_>>().join(",")
    };
    ConfigMetadata {
        org: join(|pr| pr.org.as_str()),
        repo: join(|pr| pr.repo.as_str()),
        branch: join(|pr| pr.base_ref.as_str()),
        variant: None,
    }
}
