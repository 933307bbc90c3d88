//! Worker process handle.
//!
//! A `WorkerProcess` wraps one OS process, its relay connection and its
//! atomically shared state. Handles are cheap to clone; every clone refers to
//! the same process.

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use relaypool_core::{EventKind, WorkerState, WorkerStatus};

use crate::error::SupervisorError;
use crate::events::{EventBus, PoolEvent};
use crate::relay::{Frame, Relay};

/// What the pool container needs from a worker.
pub trait Worker: Clone + Send + Sync + 'static {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Shared lifecycle state.
    fn state(&self) -> &WorkerState;

    /// Force the process down without waiting for it.
    fn kill(&self) -> Result<(), SupervisorError>;

    /// Event of `kind` about this worker.
    fn event(&self, kind: EventKind) -> PoolEvent {
        PoolEvent::new(kind)
    }
}

/// Handle to a spawned worker process.
#[derive(Clone)]
pub struct WorkerProcess {
    inner: Arc<Inner>,
}

struct Inner {
    pid: u32,
    created: DateTime<Utc>,
    state: WorkerState,
    child: Mutex<Child>,
    relay: Mutex<Option<Relay>>,
    reaped: AtomicBool,
    events: EventBus,
}

impl WorkerProcess {
    /// Launch `cmd` and wrap the resulting process.
    ///
    /// The process is killed if the last handle is dropped before it was
    /// reaped.
    pub fn start(mut cmd: Command, events: EventBus) -> Result<Self, SupervisorError> {
        cmd.kill_on_drop(true);
        let child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::SpawnFailed(std::io::Error::other("process exited before start"))
        })?;

        debug!(pid, "Worker process started");

        Ok(Self {
            inner: Arc::new(Inner {
                pid,
                created: Utc::now(),
                state: WorkerState::new(WorkerStatus::Starting),
                child: Mutex::new(child),
                relay: Mutex::new(None),
                reaped: AtomicBool::new(false),
                events,
            }),
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// When the process was started.
    pub fn created(&self) -> DateTime<Utc> {
        self.inner.created
    }

    /// Shared lifecycle state.
    pub fn state(&self) -> &WorkerState {
        &self.inner.state
    }

    /// Event bus this worker reports to.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Attach the correlated relay connection.
    pub async fn attach_relay(&self, relay: Relay) {
        *self.inner.relay.lock().await = Some(relay);
    }

    /// Exclusive access to the relay connection.
    pub async fn relay(&self) -> MutexGuard<'_, Option<Relay>> {
        self.inner.relay.lock().await
    }

    /// Returns true once the process has been reaped.
    pub fn is_reaped(&self) -> bool {
        self.inner.reaped.load(Ordering::Acquire)
    }

    /// Send SIGKILL. A process that is already gone is not an error.
    pub fn kill(&self) -> Result<(), SupervisorError> {
        if self.is_reaped() {
            return Ok(());
        }
        self.inner.state.set(WorkerStatus::Killing);

        match signal::kill(Pid::from_raw(self.inner.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Kill {
                pid: self.inner.pid,
                source,
            }),
        }
    }

    /// Wait for the process to exit and reap it.
    pub async fn wait(&self) -> Result<ExitStatus, SupervisorError> {
        let status = {
            let mut child = self.inner.child.lock().await;
            child.wait().await.map_err(|source| SupervisorError::Wait {
                pid: self.inner.pid,
                source,
            })?
        };
        self.record_exit(status);
        Ok(status)
    }

    /// Check for exit without blocking. An exited process is reaped.
    pub async fn try_wait(&self) -> Result<Option<ExitStatus>, SupervisorError> {
        let status = {
            let mut child = self.inner.child.lock().await;
            child.try_wait().map_err(|source| SupervisorError::Wait {
                pid: self.inner.pid,
                source,
            })?
        };
        if let Some(status) = status {
            self.record_exit(status);
        }
        Ok(status)
    }

    fn record_exit(&self, status: ExitStatus) {
        // Only the first reaper reports the exit.
        if self.inner.reaped.swap(true, Ordering::AcqRel) {
            return;
        }

        let next = match self.inner.state.value() {
            WorkerStatus::Killing => WorkerStatus::Killed,
            WorkerStatus::Stopping => WorkerStatus::Stopped,
            _ if status.success() => WorkerStatus::Stopped,
            _ => WorkerStatus::Errored,
        };
        self.inner.state.set(next);

        debug!(pid = self.inner.pid, status = %status, state = %next, "Worker process exited");
        self.inner
            .events
            .publish(PoolEvent::worker(EventKind::WorkerProcessExit, self));
    }

    /// Kill the process and reap it, collecting both failures.
    pub async fn kill_and_wait(&self) -> Vec<Result<(), SupervisorError>> {
        vec![self.kill(), self.wait().await.map(|_| ())]
    }

    /// Round-trip one payload through the worker.
    ///
    /// Only a Ready worker accepts work. It is Working while the request is
    /// in flight and Ready again afterwards, unless its state was changed
    /// meanwhile. A relay failure leaves it Errored.
    pub async fn exec(
        &self,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let mut relay = self.relay().await;
        let Some(relay) = relay.as_mut() else {
            return Err(SupervisorError::Supervisor(format!(
                "worker {} has no relay",
                self.inner.pid
            )));
        };

        let state = &self.inner.state;
        if !state.transition(WorkerStatus::Ready, WorkerStatus::Working) {
            return Err(SupervisorError::Supervisor(format!(
                "worker {} is {}, not ready",
                self.inner.pid,
                state.value()
            )));
        }

        match relay.request(body).await {
            Ok(reply) => {
                state.register_exec();
                state.transition(WorkerStatus::Working, WorkerStatus::Ready);
                Ok(reply)
            }
            Err(e) => {
                warn!(pid = self.inner.pid, error = %e, "Worker exec failed");
                state.transition(WorkerStatus::Working, WorkerStatus::Errored);
                Err(e.into())
            }
        }
    }

    /// Ask the worker to exit over its relay, killing it after `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SupervisorError> {
        if self.is_reaped() {
            return Ok(());
        }
        self.inner.state.set(WorkerStatus::Stopping);

        if let Some(relay) = self.relay().await.as_mut() {
            if let Err(e) = relay.send(&Frame::Stop).await {
                warn!(pid = self.inner.pid, error = %e, "Failed to send stop frame");
            }
        }

        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!(pid = self.inner.pid, "Worker ignored stop request, killing");
                self.kill()?;
                self.wait().await.map(|_| ())
            }
        }
    }
}

impl Worker for WorkerProcess {
    fn pid(&self) -> u32 {
        WorkerProcess::pid(self)
    }

    fn state(&self) -> &WorkerState {
        WorkerProcess::state(self)
    }

    fn kill(&self) -> Result<(), SupervisorError> {
        WorkerProcess::kill(self)
    }

    fn event(&self, kind: EventKind) -> PoolEvent {
        PoolEvent::worker(kind, self)
    }
}

impl PartialEq for WorkerProcess {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WorkerProcess {}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.inner.pid)
            .field("state", &self.inner.state.value())
            .field("created", &self.inner.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd
    }

    #[tokio::test]
    async fn test_start_failure_is_spawn_failed() {
        let err = WorkerProcess::start(Command::new("/nonexistent/worker"), EventBus::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn test_kill_and_wait_reaps() {
        let bus = EventBus::new();
        let mut rx = bus.channel();
        let worker = WorkerProcess::start(sleeper(), bus).unwrap();
        assert_eq!(worker.state().value(), WorkerStatus::Starting);

        let results = worker.kill_and_wait().await;
        assert!(results.iter().all(Result::is_ok));
        assert!(worker.is_reaped());
        assert_eq!(worker.state().value(), WorkerStatus::Killed);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::WorkerProcessExit);
        assert_eq!(event.payload.unwrap(), worker);

        // Killing a reaped worker is a no-op
        assert!(worker.kill().is_ok());
    }

    #[tokio::test]
    async fn test_clean_exit_is_stopped() {
        let worker = WorkerProcess::start(Command::new("true"), EventBus::new()).unwrap();
        let status = worker.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(worker.state().value(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_relay_falls_back_to_kill() {
        let worker = WorkerProcess::start(sleeper(), EventBus::new()).unwrap();
        worker.stop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(worker.state().value(), WorkerStatus::Killed);
    }

    #[tokio::test]
    async fn test_exec_without_relay_fails() {
        let worker = WorkerProcess::start(sleeper(), EventBus::new()).unwrap();
        worker.state().set(WorkerStatus::Ready);

        let err = worker.exec(serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SupervisorError);
        assert_eq!(worker.state().value(), WorkerStatus::Ready);
        assert_eq!(worker.state().num_execs(), 0);

        worker.kill_and_wait().await;
    }

    #[tokio::test]
    async fn test_clones_share_identity() {
        let worker = WorkerProcess::start(sleeper(), EventBus::new()).unwrap();
        let clone = worker.clone();
        clone.state().set(WorkerStatus::Invalid);

        assert_eq!(worker, clone);
        assert_eq!(worker.state().value(), WorkerStatus::Invalid);
        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }
}
