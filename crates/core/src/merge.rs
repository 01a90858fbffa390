//! Status merge rule shared by both controllers.
//!
//! The run controller and the status syncer both write `status.jobs`. Each
//! side computes its view from a possibly stale read; these functions fold a
//! freshly computed view into a freshly read run so that either write order
//! converges.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::condition::{self, Condition};
use crate::model::{ExecutionJob, JobState, QualificationRun, QualificationRunStatus, RunJobStatus};

/// Marker prefix of statuses produced by an internal invariant violation.
pub const BUG_MARKER: &str = "BUG:";

/// Something the merge resolved that should not normally happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAnomaly {
    /// Persisted and computed entries point at different execution jobs.
    BackingJobMismatch {
        /// Derived job name.
        job_name: String,
        /// Backing job in the persisted entry.
        persisted: Option<String>,
        /// Backing job in the computed entry (the one kept).
        computed: Option<String>,
    },
    /// A requested job had no entry on either side.
    MissingStatus {
        /// Derived job name.
        job_name: String,
    },
}

impl fmt::Display for MergeAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackingJobMismatch {
                job_name,
                persisted,
                computed,
            } => write!(
                f,
                "job '{job_name}' backed by {persisted:?} in persisted status but {computed:?} in computed status"
            ),
            Self::MissingStatus { job_name } => {
                write!(f, "job '{job_name}' not present in persisted nor computed status")
            }
        }
    }
}

/// Resolves one job's entry from the persisted and computed views.
pub fn reconcile_job_status(
    job_name: &str,
    persisted: Option<&RunJobStatus>,
    computed: Option<&RunJobStatus>,
) -> (RunJobStatus, Option<MergeAnomaly>) {
    match (persisted, computed) {
        (None, None) => {
            let anomaly = MergeAnomaly::MissingStatus {
                job_name: job_name.to_string(),
            };
            let status =
                RunJobStatus::error(job_name, None, format!("{BUG_MARKER} {anomaly}"));
            (status, Some(anomaly))
        }
        (Some(only), None) | (None, Some(only)) => (only.clone(), None),
        (Some(persisted), Some(computed)) => {
            if persisted.execution_job.is_none() && computed.execution_job.is_some() {
                // A failed expansion that has since been materialized.
                (computed.clone(), None)
            } else if persisted.execution_job != computed.execution_job {
                let anomaly = MergeAnomaly::BackingJobMismatch {
                    job_name: job_name.to_string(),
                    persisted: persisted.execution_job.clone(),
                    computed: computed.execution_job.clone(),
                };
                (computed.clone(), Some(anomaly))
            } else if persisted.status.state == JobState::Error {
                (computed.clone(), None)
            } else {
                (persisted.clone(), None)
            }
        }
    }
}

/// Folds a computed per-job view and condition into a run.
///
/// `status.jobs` is rebuilt in request order, one entry per distinct derived
/// name; entries for names no longer requested are dropped.
pub fn merge_run_status(
    run: &mut QualificationRun,
    computed: &BTreeMap<String, RunJobStatus>,
    condition: Condition,
) -> Vec<MergeAnomaly> {
    let persisted: BTreeMap<&str, &RunJobStatus> = run
        .status
        .jobs
        .iter()
        .map(|j| (j.job_name.as_str(), j))
        .collect();

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(run.spec.jobs.jobs.len());
    let mut anomalies = Vec::new();
    for spec in &run.spec.jobs.jobs {
        let name = spec.job_name();
        if !seen.insert(name.clone()) {
            continue;
        }
        let (status, anomaly) =
            reconcile_job_status(&name, persisted.get(name.as_str()).copied(), computed.get(&name));
        anomalies.extend(anomaly);
        jobs.push(status);
    }

    run.status.jobs = jobs;
    condition::set_condition(&mut run.status.conditions, condition);
    anomalies
}

/// Copies an execution job's status into every entry it backs.
///
/// Returns true if any entry changed.
pub fn apply_job_status(status: &mut QualificationRunStatus, job: &ExecutionJob) -> bool {
    let mut changed = false;
    for entry in status
        .jobs
        .iter_mut()
        .filter(|e| e.execution_job.as_deref() == Some(job.metadata.name.as_str()))
    {
        if entry.status != job.status {
            entry.status = job.status.clone();
            changed = true;
        }
    }
    changed
}
