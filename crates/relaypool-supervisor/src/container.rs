//! Bounded container of ready workers.
//!
//! `push` never blocks: when the container is full it scans the held
//! workers and replaces the first unhealthy one. `pop` waits for a worker
//! until the caller's context finishes.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, warn};

use relaypool_core::EventKind;

use crate::context::Context;
use crate::error::SupervisorError;
use crate::events::{EventBus, PoolEvent};
use crate::worker::Worker;

/// Holder of idle workers.
#[async_trait]
pub trait Container<W: Worker>: Send + Sync {
    /// Admit a worker without blocking.
    fn push(&self, worker: W);

    /// Take a worker, waiting until one is available or `ctx` finishes.
    async fn pop(&self, ctx: &Context) -> Result<W, SupervisorError>;

    /// Remove a worker by pid.
    fn remove(&self, pid: u32);

    /// Stop handing out workers.
    fn destroy(&self);
}

/// Fixed-capacity container backed by a lock-free ring buffer.
///
/// Fast-path `push`/`pop` share the scan lock; the eviction scan holds it
/// exclusively so nothing else touches the queue while entries are
/// dequeued and requeued. Outside of scans the order is FIFO. During a scan
/// healthy entries are requeued at the tail by the scanning task itself.
pub struct BoundedVec<W> {
    workers: ArrayQueue<W>,
    scan: RwLock<()>,
    destroyed: AtomicBool,
    available: Notify,
    events: EventBus,
}

impl<W: Worker> BoundedVec<W> {
    /// Create a container holding at most `capacity` workers.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            warn!("Pool capacity of 0 requested, using 1");
        }
        Self {
            workers: ArrayQueue::new(capacity.max(1)),
            scan: RwLock::new(()),
            destroyed: AtomicBool::new(false),
            available: Notify::new(),
            events: EventBus::new(),
        }
    }

    /// Builder method to publish evictions and allocation timeouts to `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Maximum number of held workers.
    pub fn capacity(&self) -> usize {
        self.workers.capacity()
    }

    /// Number of workers currently held.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no worker is held.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns true once `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn try_pop(&self) -> Option<W> {
        let _guard = self.scan.read();
        self.workers.pop()
    }

    /// Full-container path: replace the first unhealthy worker with `worker`.
    fn evict_and_push(&self, worker: W) {
        let _guard = self.scan.write();

        // A pop may have freed a slot while we waited for the lock.
        let worker = match self.workers.push(worker) {
            Ok(()) => {
                self.available.notify_one();
                return;
            }
            Err(worker) => worker,
        };

        for _ in 0..self.workers.len() {
            let Some(existing) = self.workers.pop() else {
                break;
            };

            let status = existing.state().value();
            if status.is_usable() {
                let requeued = self.workers.push(existing);
                debug_assert!(requeued.is_ok(), "slot freed under the scan lock");
                continue;
            }

            debug!(
                pid = existing.pid(),
                state = %status,
                replacement = worker.pid(),
                "Evicting unhealthy worker"
            );
            if let Err(e) = existing.kill() {
                debug!(pid = existing.pid(), error = %e, "Failed to kill evicted worker");
            }
            self.events.publish(existing.event(EventKind::WorkerDestruct));

            let admitted = self.workers.push(worker);
            debug_assert!(admitted.is_ok(), "slot freed under the scan lock");
            self.available.notify_one();
            return;
        }

        warn!(
            pid = worker.pid(),
            capacity = self.capacity(),
            "Pool is full of healthy workers, worker not admitted"
        );
    }
}

#[async_trait]
impl<W: Worker> Container<W> for BoundedVec<W> {
    fn push(&self, worker: W) {
        let rejected = {
            let _guard = self.scan.read();
            self.workers.push(worker).err()
        };

        match rejected {
            None => self.available.notify_one(),
            Some(worker) => self.evict_and_push(worker),
        }
    }

    async fn pop(&self, ctx: &Context) -> Result<W, SupervisorError> {
        loop {
            // Register interest before looking so a concurrent push or
            // destroy can't slip by.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_destroyed() {
                return Err(SupervisorError::WatcherStopped);
            }

            if let Some(worker) = self.try_pop() {
                return Ok(worker);
            }

            tokio::select! {
                _ = &mut notified => continue,
                cause = ctx.done() => {
                    self.events.publish(
                        PoolEvent::new(EventKind::NoFreeWorkers)
                            .with_error(SupervisorError::NoFreeWorkers(cause)),
                    );
                    return Err(SupervisorError::NoFreeWorkers(cause));
                }
            }
        }
    }

    fn remove(&self, _pid: u32) {}

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use relaypool_core::{WorkerState, WorkerStatus};

    use crate::context::ContextError;
    use crate::error::ErrorKind;

    #[derive(Clone, Debug)]
    struct MockWorker {
        pid: u32,
        state: Arc<WorkerState>,
        killed: Arc<AtomicBool>,
    }

    impl MockWorker {
        fn new(pid: u32, status: WorkerStatus) -> Self {
            Self {
                pid,
                state: Arc::new(WorkerState::new(status)),
                killed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }
    }

    impl Worker for MockWorker {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn state(&self) -> &WorkerState {
            &self.state
        }

        fn kill(&self) -> Result<(), SupervisorError> {
            self.killed.store(true, Ordering::SeqCst);
            self.state.set(WorkerStatus::Killed);
            Ok(())
        }
    }

    fn quick_ctx() -> Context {
        Context::background().with_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_push_then_pop_returns_same_worker() {
        let vec = BoundedVec::new(4);
        vec.push(MockWorker::new(1, WorkerStatus::Ready));

        let worker = vec.pop(&quick_ctx()).await.unwrap();
        assert_eq!(worker.pid(), 1);
        assert!(vec.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_without_eviction() {
        let vec = BoundedVec::new(3);
        for pid in 1..=3 {
            vec.push(MockWorker::new(pid, WorkerStatus::Ready));
        }

        for pid in 1..=3 {
            assert_eq!(vec.pop(&quick_ctx()).await.unwrap().pid(), pid);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes_never_exceed_capacity() {
        let vec = Arc::new(BoundedVec::new(4));

        let mut handles = Vec::new();
        for task in 0..8u32 {
            let vec = vec.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..2000u32 {
                    // Every third worker is unhealthy so pushes into a full
                    // container keep taking the eviction path.
                    let status = if i % 3 == 0 {
                        WorkerStatus::Invalid
                    } else {
                        WorkerStatus::Ready
                    };
                    vec.push(MockWorker::new(task * 10_000 + i, status));
                    assert!(vec.len() <= 4);

                    if i % 5 == 0 {
                        let _ = vec
                            .pop(&Context::background().with_timeout(Duration::from_millis(1)))
                            .await;
                    }
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(vec.len() <= 4);
        for pid in 0..4 {
            vec.push(MockWorker::new(u32::MAX - pid, WorkerStatus::Ready));
        }
        assert_eq!(vec.len(), 4);
    }

    #[tokio::test]
    async fn test_destroy_stops_pops_regardless_of_contents() {
        let vec = BoundedVec::new(2);
        vec.push(MockWorker::new(1, WorkerStatus::Ready));
        vec.destroy();

        for _ in 0..3 {
            let err = vec.pop(&quick_ctx()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WatcherStopped);
        }
        // Held workers are not drained
        assert_eq!(vec.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_on_empty_times_out_with_no_free_workers() {
        let vec: BoundedVec<MockWorker> = BoundedVec::new(1);
        let deadline = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let err = vec
            .pop(&Context::background().with_timeout(deadline))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            SupervisorError::NoFreeWorkers(ContextError::DeadlineExceeded)
        ));
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_pop_cancelled_reports_cause() {
        let vec: BoundedVec<MockWorker> = BoundedVec::new(1);
        let ctx = Context::background();
        ctx.cancel();

        let err = vec.pop(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::NoFreeWorkers(ContextError::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_full_of_healthy_workers_rejects_new_worker() {
        let vec = BoundedVec::new(1);
        let w1 = MockWorker::new(1, WorkerStatus::Ready);
        let w2 = MockWorker::new(2, WorkerStatus::Ready);

        vec.push(w1.clone());
        vec.push(w2.clone());

        assert_eq!(vec.len(), 1);
        assert_eq!(vec.pop(&quick_ctx()).await.unwrap().pid(), 1);
        assert!(!w1.was_killed());
        assert!(!w2.was_killed());
        assert!(vec.pop(&quick_ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_eviction_replaces_first_unhealthy_worker() {
        let vec = BoundedVec::new(2);
        let w1 = MockWorker::new(1, WorkerStatus::Ready);
        let w2 = MockWorker::new(2, WorkerStatus::Invalid);
        let w3 = MockWorker::new(3, WorkerStatus::Ready);

        vec.push(w1.clone());
        vec.push(w2.clone());
        vec.push(w3.clone());

        assert!(w2.was_killed());
        assert!(!w1.was_killed());
        assert_eq!(vec.len(), 2);

        let first = vec.pop(&quick_ctx()).await.unwrap();
        let second = vec.pop(&quick_ctx()).await.unwrap();
        assert_eq!((first.pid(), second.pid()), (1, 3));
    }

    #[tokio::test]
    async fn test_eviction_and_timeout_are_published() {
        let events = EventBus::new();
        let mut rx = events.channel();
        let vec = BoundedVec::new(1).with_events(events);

        vec.push(MockWorker::new(1, WorkerStatus::Errored));
        vec.push(MockWorker::new(2, WorkerStatus::Ready));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::WorkerDestruct);

        vec.pop(&quick_ctx()).await.unwrap();
        assert!(vec.pop(&quick_ctx()).await.is_err());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::NoFreeWorkers);
        assert_eq!(
            event.error.unwrap().kind(),
            ErrorKind::NoFreeWorkers
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_eviction_sees_state_changed_while_pooled() {
        let vec = BoundedVec::new(2);
        let w1 = MockWorker::new(1, WorkerStatus::Ready);
        let w2 = MockWorker::new(2, WorkerStatus::Ready);
        vec.push(w1.clone());
        vec.push(w2.clone());

        // An external TTL check flags the first worker
        w1.state().set(WorkerStatus::Invalid);
        vec.push(MockWorker::new(3, WorkerStatus::Ready));

        assert!(w1.was_killed());
        let pids = [
            vec.pop(&quick_ctx()).await.unwrap().pid(),
            vec.pop(&quick_ctx()).await.unwrap().pid(),
        ];
        assert_eq!(pids, [2, 3]);
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let vec = Arc::new(BoundedVec::new(1));

        let waiter = {
            let vec = vec.clone();
            tokio::spawn(async move {
                vec.pop(&Context::background().with_timeout(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::task::yield_now().await;
        vec.push(MockWorker::new(9, WorkerStatus::Ready));

        assert_eq!(waiter.await.unwrap().unwrap().pid(), 9);
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_destroy() {
        let vec: Arc<BoundedVec<MockWorker>> = Arc::new(BoundedVec::new(1));

        let waiter = {
            let vec = vec.clone();
            tokio::spawn(async move {
                vec.pop(&Context::background().with_timeout(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        vec.destroy();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WatcherStopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_destroy_racing_pops_stops_every_waiter() {
        for _ in 0..50 {
            let vec: Arc<BoundedVec<MockWorker>> = Arc::new(BoundedVec::new(1));

            let waiters: Vec<_> = (0..8)
                .map(|_| {
                    let vec = vec.clone();
                    tokio::spawn(async move {
                        vec.pop(&Context::background().with_timeout(Duration::from_secs(10)))
                            .await
                    })
                })
                .collect();

            // Lands anywhere between the waiters' checks and their waits
            vec.destroy();

            for waiter in waiters {
                let err = waiter.await.unwrap().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::WatcherStopped);
            }
        }
    }

    #[tokio::test]
    async fn test_remove_is_noop() {
        let vec = BoundedVec::new(1);
        vec.push(MockWorker::new(1, WorkerStatus::Ready));
        vec.remove(1);
        assert_eq!(vec.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let vec: BoundedVec<MockWorker> = BoundedVec::new(0);
        assert_eq!(vec.capacity(), 1);
    }
}
