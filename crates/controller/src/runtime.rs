//! Reconciliation runtime: work queue, workers and watch sources.
//!
//! A key is queued at most once and is never handed to two workers at the
//! same time. Adding a key while it is being processed marks it dirty; it is
//! queued again when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qualification_core::{ObjectKey, Resource};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::backoff::requeue_delay;
use crate::error::ReconcileError;
use crate::store::WatchEvent;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys waiting in `queue` or waiting to be re-queued after processing.
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue with per-key backoff.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    /// Creates a queue whose failed keys back off from `base_delay` to `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Queues a key unless it is already waiting.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queues a key after a delay.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Queues a key after its backoff delay and counts the failure.
    pub async fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let failures = {
            let mut state = self.state.lock().await;
            let n = state.failures.entry(key.clone()).or_default();
            *n += 1;
            *n
        };
        self.add_after(key, requeue_delay(failures, self.base_delay, self.max_delay));
    }

    /// Clears a key's failure count.
    pub async fn forget(&self, key: &ObjectKey) {
        self.state.lock().await.failures.remove(key);
    }

    /// Consecutive failures recorded for a key.
    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Waits for the next key; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key processed, re-queueing it if it was added meanwhile.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// True if no key is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }
}

/// Level-triggered reconciliation of one object kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs.
    fn name(&self) -> &'static str;

    /// Drives the object under `key` towards its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError>;
}

/// Runs a [`Reconciler`] over a [`WorkQueue`] with a fixed worker pool.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
}

impl<R: Reconciler> Controller<R> {
    /// Creates a controller with its own queue.
    pub fn new(reconciler: Arc<R>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(base_delay, max_delay),
        }
    }

    /// The controller's queue.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Feeds keys selected by `filter` from a watch into the queue.
    pub fn watch<K, F>(&self, mut events: broadcast::Receiver<WatchEvent<K>>, filter: F) -> JoinHandle<()>
    where
        K: Resource,
        F: Fn(&WatchEvent<K>) -> Option<ObjectKey> + Send + 'static,
    {
        let queue = self.queue();
        let name = self.reconciler.name();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(key) = filter(&event) {
                            queue.add(key).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(controller = name, missed, "watch lagged; relying on resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reconciles one key from the queue. Returns false once shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };
        let controller = self.reconciler.name();
        let span = info_span!("reconcile", controller, key = %key);
        async {
            info!("Starting reconciliation");
            match self.reconciler.reconcile(&key).await {
                Ok(()) => {
                    self.queue.forget(&key).await;
                    info!("Finished reconciliation");
                }
                Err(e) if e.is_terminal() => {
                    self.queue.forget(&key).await;
                    error!(error = %e, "reconciliation failed permanently");
                }
                Err(e) => {
                    error!(error = %e, "reconciliation failed");
                    self.queue.add_rate_limited(key.clone()).await;
                }
            }
        }
        .instrument(span)
        .await;
        self.queue.done(&key).await;
        true
    }

    /// Spawns `workers` tasks processing the queue until it shuts down.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|_| {
                let controller = Arc::clone(self);
                tokio::spawn(async move { while controller.process_next().await {} })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ci", name)
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(1), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_queue_dedupes() {
        let q = queue();
        q.add(key("a")).await;
        q.add(key("a")).await;
        q.add(key("b")).await;
        assert_eq!(q.len().await, 2);
        assert_eq!(q.next().await, Some(key("a")));
        assert_eq!(q.next().await, Some(key("b")));
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_key_in_flight_is_requeued_on_done() {
        let q = queue();
        q.add(key("a")).await;
        let a = q.next().await.unwrap();

        // Re-added while processing: not handed out again yet.
        q.add(key("a")).await;
        assert!(q.is_empty().await);

        q.done(&a).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.next().await, Some(key("a")));
        q.done(&a).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown().await;
        assert_eq!(waiter.await.unwrap(), None);
    }

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        terminal: bool,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> Result<(), ReconcileError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                if self.terminal {
                    return Err(ReconcileError::Terminal("broken".into()));
                }
                return Err(ReconcileError::update(
                    "thing",
                    crate::error::StoreError::Unavailable("down".into()),
                ));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_keys_are_retried_with_backoff() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            terminal: false,
        });
        let controller = Arc::new(Controller::new(
            Arc::clone(&flaky),
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let workers = controller.spawn_workers(2);
        controller.queue().add(key("a")).await;

        for _ in 0..200 {
            if flaky.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(controller.queue().failures(&key("a")).await, 0);

        controller.queue().shutdown().await;
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 1,
            terminal: true,
        });
        let controller = Arc::new(Controller::new(
            Arc::clone(&flaky),
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        controller.queue().add(key("a")).await;
        assert!(controller.process_next().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.queue().is_empty().await);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
