//! Aggregate run conditions.

use serde::{Deserialize, Serialize};

use crate::model::{JobState, RunJobStatus};

/// Condition type: every requested job was triggered.
pub const ALL_JOBS_TRIGGERED: &str = "AllJobsTriggered";
/// Condition type: no requested job is still running.
pub const ALL_JOBS_FINISHED: &str = "AllJobsFinished";
/// Reason of a false `AllJobsTriggered`.
pub const REASON_WITH_ERRORS: &str = "WithErrors";
/// Reason of a false `AllJobsFinished`.
pub const REASON_JOBS_RUNNING: &str = "JobsRunning";

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Satisfied.
    True,
    /// Not satisfied.
    False,
    /// Not yet evaluated.
    Unknown,
}

/// A typed observation about a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    /// Condition type, unique within a run.
    #[serde(rename = "type")]
    pub type_: String,
    /// Value.
    pub status: ConditionStatus,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// When `status` last changed.
    pub last_transition_time_ms: i64,
}

impl Condition {
    fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: String,
        now_ms: i64,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time_ms: now_ms,
        }
    }
}

/// `AllJobsTriggered`: false with reason `WithErrors` when any entry is in
/// `Error`, listing the failed jobs.
pub fn all_jobs_triggered<'a>(
    jobs: impl IntoIterator<Item = &'a RunJobStatus>,
    now_ms: i64,
) -> Condition {
    let failed: Vec<&str> = jobs
        .into_iter()
        .filter(|j| j.status.state == JobState::Error)
        .map(|j| j.job_name.as_str())
        .collect();
    if failed.is_empty() {
        Condition::new(
            ALL_JOBS_TRIGGERED,
            ConditionStatus::True,
            ALL_JOBS_TRIGGERED,
            "All jobs triggered successfully".to_string(),
            now_ms,
        )
    } else {
        Condition::new(
            ALL_JOBS_TRIGGERED,
            ConditionStatus::False,
            REASON_WITH_ERRORS,
            format!("Jobs triggered with errors: [{}]", failed.join(",")),
            now_ms,
        )
    }
}

/// `AllJobsFinished`: true iff no entry is in an active state; otherwise the
/// message lists the jobs still running.
pub fn all_jobs_finished(jobs: &[RunJobStatus], now_ms: i64) -> Condition {
    let running: Vec<&str> = jobs
        .iter()
        .filter(|j| j.status.state.is_active())
        .map(|j| j.job_name.as_str())
        .collect();
    if running.is_empty() {
        Condition::new(
            ALL_JOBS_FINISHED,
            ConditionStatus::True,
            ALL_JOBS_FINISHED,
            "All jobs have finished".to_string(),
            now_ms,
        )
    } else {
        Condition::new(
            ALL_JOBS_FINISHED,
            ConditionStatus::False,
            REASON_JOBS_RUNNING,
            format!("jobs [{}] still running", running.join(",")),
            now_ms,
        )
    }
}

/// Sets a condition, replacing one of the same type in place or appending.
///
/// The previous transition time is kept when the status value is unchanged,
/// so recomputing an unchanged condition never alters the run.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time_ms = existing.last_transition_time_ms;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}
