//! Time-based limits on worker lifetime, idle time and execution time.
//!
//! The supervisor only flags workers: a Ready worker that breaks a limit is
//! marked Invalid so the pool's next eviction scan replaces it. A Working
//! worker over its execution limit is killed outright.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use relaypool_core::{EventKind, WorkerStatus};

use crate::context::Context;
use crate::events::{EventBus, PoolEvent};
use crate::worker::WorkerProcess;

/// Limits applied to every tracked worker. `None` disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Maximum total lifetime.
    pub ttl: Option<Duration>,
    /// Maximum time spent Ready without work.
    pub idle_ttl: Option<Duration>,
    /// Maximum time spent on a single execution.
    pub exec_ttl: Option<Duration>,
}

impl TtlPolicy {
    /// Returns true if at least one limit is set.
    pub fn is_enabled(&self) -> bool {
        self.ttl.is_some() || self.idle_ttl.is_some() || self.exec_ttl.is_some()
    }

    /// Which limit, if any, a worker in `status` breaks.
    ///
    /// `age` is time since start; `in_status` is time since the last status
    /// change.
    pub fn violation(
        &self,
        status: WorkerStatus,
        age: Duration,
        in_status: Duration,
    ) -> Option<EventKind> {
        if !status.is_usable() {
            return None;
        }

        if status == WorkerStatus::Working {
            if matches!(self.exec_ttl, Some(limit) if in_status >= limit) {
                return Some(EventKind::ExecTtl);
            }
        } else if matches!(self.idle_ttl, Some(limit) if in_status >= limit) {
            return Some(EventKind::IdleTtl);
        }

        match self.ttl {
            Some(limit) if age >= limit => Some(EventKind::Ttl),
            _ => None,
        }
    }
}

/// Tracks spawned workers and enforces a `TtlPolicy` on them.
pub struct TtlSupervisor {
    policy: TtlPolicy,
    interval: Duration,
    workers: Mutex<Vec<WorkerProcess>>,
    events: EventBus,
}

impl TtlSupervisor {
    /// Create a supervisor checking every `interval`.
    pub fn new(policy: TtlPolicy, interval: Duration, events: EventBus) -> Self {
        Self {
            policy,
            interval,
            workers: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Policy being enforced.
    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Start tracking a worker.
    pub fn watch(&self, worker: WorkerProcess) {
        self.workers.lock().push(worker);
    }

    /// Snapshot of tracked workers.
    pub fn tracked(&self) -> Vec<WorkerProcess> {
        self.workers.lock().clone()
    }

    /// Number of tracked workers.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Stop tracking reaped and terminal workers. Returns how many remain.
    pub fn prune(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_reaped() && !w.state().value().is_terminal());
        workers.len()
    }

    /// Check every tracked worker once. Returns the number of violations.
    pub fn sweep(&self) -> usize {
        self.prune();
        let now = Utc::now();
        let workers = self.tracked();

        workers
            .iter()
            .filter(|worker| self.enforce(worker, now))
            .count()
    }

    fn enforce(&self, worker: &WorkerProcess, now: DateTime<Utc>) -> bool {
        let status = worker.state().value();
        let age = elapsed(worker.created(), now);
        let in_status = elapsed(worker.state().last_used(), now);

        let Some(kind) = self.policy.violation(status, age, in_status) else {
            return false;
        };

        let flagged = match (status, kind) {
            (WorkerStatus::Working, EventKind::ExecTtl) => {
                if let Err(e) = worker.kill() {
                    warn!(pid = worker.pid(), error = %e, "Failed to kill over-running worker");
                }
                true
            }
            (current, _) => worker.state().transition(current, WorkerStatus::Invalid),
        };

        // The owner changed the state under us; look again next sweep.
        if !flagged {
            return false;
        }

        info!(pid = worker.pid(), event = %kind, "Worker exceeded time limit");
        self.events.publish(PoolEvent::worker(kind, worker));
        true
    }

    /// Sweep on every interval tick until `ctx` finishes.
    pub async fn run(self: Arc<Self>, ctx: Context) {
        if !self.policy.is_enabled() {
            debug!("No worker time limits configured");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let violations = self.sweep();
                    if violations > 0 {
                        debug!(violations, "TTL sweep flagged workers");
                    }
                }
                _ = ctx.done() => break,
            }
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn sleeper(events: &EventBus) -> WorkerProcess {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        WorkerProcess::start(cmd, events.clone()).unwrap()
    }

    #[test]
    fn test_violation_rules() {
        let policy = TtlPolicy {
            ttl: Some(secs(100)),
            idle_ttl: Some(secs(10)),
            exec_ttl: Some(secs(5)),
        };

        assert_eq!(policy.violation(WorkerStatus::Ready, secs(1), secs(1)), None);
        assert_eq!(
            policy.violation(WorkerStatus::Ready, secs(20), secs(10)),
            Some(EventKind::IdleTtl)
        );
        assert_eq!(
            policy.violation(WorkerStatus::Working, secs(20), secs(6)),
            Some(EventKind::ExecTtl)
        );
        // Long idle time does not matter while working
        assert_eq!(policy.violation(WorkerStatus::Working, secs(20), secs(4)), None);
        assert_eq!(
            policy.violation(WorkerStatus::Working, secs(100), secs(1)),
            Some(EventKind::Ttl)
        );
        // Already flagged workers are left alone
        assert_eq!(policy.violation(WorkerStatus::Invalid, secs(500), secs(500)), None);
    }

    #[test]
    fn test_disabled_policy() {
        let policy = TtlPolicy::default();
        assert!(!policy.is_enabled());
        assert_eq!(policy.violation(WorkerStatus::Ready, secs(9999), secs(9999)), None);
    }

    #[tokio::test]
    async fn test_sweep_marks_ready_worker_invalid() {
        let events = EventBus::new();
        let mut rx = events.channel();
        let worker = sleeper(&events);
        worker.state().set(WorkerStatus::Ready);

        let supervisor = TtlSupervisor::new(
            TtlPolicy {
                ttl: Some(Duration::ZERO),
                ..Default::default()
            },
            secs(1),
            events,
        );
        supervisor.watch(worker.clone());

        assert_eq!(supervisor.sweep(), 1);
        assert_eq!(worker.state().value(), WorkerStatus::Invalid);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Ttl);
        assert_eq!(event.payload.unwrap(), worker);

        // Flagged once only
        assert_eq!(supervisor.sweep(), 0);

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_kills_over_running_worker() {
        let events = EventBus::new();
        let worker = sleeper(&events);
        worker.state().set(WorkerStatus::Working);

        let supervisor = TtlSupervisor::new(
            TtlPolicy {
                exec_ttl: Some(Duration::ZERO),
                ..Default::default()
            },
            secs(1),
            events,
        );
        supervisor.watch(worker.clone());

        assert_eq!(supervisor.sweep(), 1);
        worker.wait().await.unwrap();
        assert_eq!(worker.state().value(), WorkerStatus::Killed);

        // Reaped workers are dropped from tracking
        supervisor.sweep();
        assert!(supervisor.is_empty());
    }
}
