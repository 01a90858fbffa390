//! Controller configuration.

use std::time::Duration;

use thiserror::Error;

/// Settings shared by both controllers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace whose runs and jobs are reconciled.
    pub namespace: String,
    /// Concurrent reconciliations per controller.
    pub workers: usize,
    /// Attempts of a read-modify-write before a conflict is reported.
    pub conflict_retries: u32,
    /// Interval between visibility checks after creating a job.
    pub visibility_poll_interval: Duration,
    /// Deadline for a created job to become visible.
    pub visibility_timeout: Duration,
    /// First requeue delay after a failed reconciliation.
    pub requeue_base_delay: Duration,
    /// Requeue delay cap.
    pub requeue_max_delay: Duration,
    /// Period of the full relist that recovers from missed notifications.
    pub resync_interval: Duration,
    /// Abort active jobs of a run being deleted.
    pub abort_on_delete: bool,
    /// Delete a run's jobs after its finalizer is released.
    pub delete_jobs_on_cleanup: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "ci".to_string(),
            workers: 4,
            conflict_retries: 5,
            visibility_poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(5),
            requeue_base_delay: Duration::from_millis(5),
            requeue_max_delay: Duration::from_secs(1000),
            resync_interval: Duration::from_secs(600),
            abort_on_delete: true,
            delete_jobs_on_cleanup: true,
        }
    }
}

/// Invalid [`ControllerConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Namespace is empty.
    #[error("namespace must not be empty")]
    EmptyNamespace,
    /// A count that must be positive is zero.
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// Poll interval exceeds its deadline.
    #[error("visibility poll interval {interval:?} exceeds timeout {timeout:?}")]
    PollIntervalTooLong {
        /// Configured interval.
        interval: Duration,
        /// Configured timeout.
        timeout: Duration,
    },
}

impl ControllerConfig {
    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.conflict_retries == 0 {
            return Err(ConfigError::Zero("conflict_retries"));
        }
        for (name, d) in [
            ("visibility_poll_interval", self.visibility_poll_interval),
            ("requeue_base_delay", self.requeue_base_delay),
            ("resync_interval", self.resync_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.visibility_poll_interval > self.visibility_timeout {
            return Err(ConfigError::PollIntervalTooLong {
                interval: self.visibility_poll_interval,
                timeout: self.visibility_timeout,
            });
        }
        Ok(())
    }
}
