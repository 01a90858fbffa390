//! Retry primitives: requeue backoff, conflict retry, bounded polling.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::StoreError;

/// Requeue delay after `failures` consecutive failures of one key.
///
/// Doubles from `base` and saturates at `max`.
pub fn requeue_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
}

/// Runs a read-modify-write up to `attempts` times, retrying immediately
/// while it fails with a conflict.
///
/// Each attempt must re-read what it writes.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "conflict, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Failure of [`poll_until`].
#[derive(Debug, Error)]
pub enum PollError {
    /// The condition did not hold before the deadline.
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),
    /// A check failed outright.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Evaluates `check` every `interval` until it returns true, failing once
/// `timeout` has elapsed.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, StoreError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(PollError::TimedOut(timeout));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qualification_core::ObjectKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: "Test",
            key: ObjectKey::new("ci", "x"),
            expected: 1,
            current: 2,
        }
    }

    #[test]
    fn test_requeue_delay() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1);
        assert_eq!(requeue_delay(0, base, max), Duration::from_millis(5));
        assert_eq!(requeue_delay(1, base, max), Duration::from_millis(5));
        assert_eq!(requeue_delay(2, base, max), Duration::from_millis(10));
        assert_eq!(requeue_delay(4, base, max), Duration::from_millis(40));
        assert_eq!(requeue_delay(20, base, max), max);
        assert_eq!(requeue_delay(u32::MAX, base, max), max);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_recovers() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = retry_on_conflict(5, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_is_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_on_conflict(3, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(conflict())
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_on_conflict(3, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        poll_until(Duration::from_millis(1), Duration::from_secs(1), move || async move {
            Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = poll_until(Duration::from_millis(5), Duration::from_millis(20), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::TimedOut(_)));
    }
}
