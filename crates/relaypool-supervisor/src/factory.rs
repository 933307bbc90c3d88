//! Socket factory: spawns workers and correlates them with their relays.
//!
//! Every spawned process is expected to dial the factory's listener and
//! answer a pid handshake. A background accept loop stores each handshaken
//! connection in the relay table under the reported pid; spawn operations
//! poll the table for the pid of the process they started.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaypool_core::{EventKind, WorkerStatus};

use crate::context::{Context, ContextError};
use crate::error::SupervisorError;
use crate::events::{EventBus, Listener, PoolEvent};
use crate::relay::{Relay, RelayAddress, RelayError, RelayListener};
use crate::relay_table::RelayTable;
use crate::worker::WorkerProcess;

/// Interval between relay table lookups while waiting for a worker.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lookups between checks that the process is still alive.
const EXIT_CHECK_EVERY: u32 = 10;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Spawns worker processes bound to relay connections.
#[async_trait]
pub trait Factory: Send + Sync {
    /// Spawn a worker, giving up when `ctx` finishes or the relay timeout
    /// elapses, whichever comes first.
    async fn spawn_worker_with_timeout(
        &self,
        ctx: &Context,
        cmd: Command,
        listeners: &[Listener],
    ) -> Result<WorkerProcess, SupervisorError>;

    /// Spawn a worker, bounded only by the relay timeout.
    async fn spawn_worker(
        &self,
        cmd: Command,
        listeners: &[Listener],
    ) -> Result<WorkerProcess, SupervisorError>;

    /// Stop accepting relay connections.
    async fn close(&self) -> Result<(), SupervisorError>;
}

/// Factory tuning.
#[derive(Debug, Clone)]
pub struct FactoryOptions {
    /// How long a spawn waits for the worker's relay.
    pub relay_timeout: Duration,
    /// How long an accepted connection has to answer the pid handshake.
    pub handshake_timeout: Duration,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            relay_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// The part of the factory a detached spawn task needs.
#[derive(Clone)]
struct Spawner {
    relays: Arc<RelayTable>,
    options: FactoryOptions,
    events: EventBus,
}

impl Spawner {
    /// Start, correlate and verify one worker.
    ///
    /// `WorkerConstruct` is left to the caller so an abandoned spawn never
    /// announces a worker nobody received.
    async fn spawn(
        &self,
        ctx: &Context,
        cmd: Command,
        listeners: &[Listener],
    ) -> Result<WorkerProcess, SupervisorError> {
        let events = self.events.with_listeners(listeners);
        let worker = WorkerProcess::start(cmd, events)?;

        let relay = match self.find_relay(ctx, &worker).await {
            Ok(relay) => relay,
            Err(e) => return Err(self.fail(&worker, e).await),
        };

        let relay = match self.verify(ctx, &worker, relay).await {
            Ok(relay) => relay,
            Err(e) => return Err(self.fail(&worker, e).await),
        };

        worker.attach_relay(relay).await;
        worker.state().set(WorkerStatus::Ready);

        Ok(worker)
    }

    /// Announce a worker that reached its caller.
    fn construct(&self, worker: WorkerProcess) -> WorkerProcess {
        info!(pid = worker.pid(), "Worker ready");
        worker
            .events()
            .publish(PoolEvent::worker(EventKind::WorkerConstruct, &worker));
        worker
    }

    /// Poll the relay table until the worker's relay shows up.
    async fn find_relay(
        &self,
        ctx: &Context,
        worker: &WorkerProcess,
    ) -> Result<Relay, SupervisorError> {
        let pid = worker.pid();
        let mut polls = 0u32;

        loop {
            if let Some(relay) = self.relays.claim(pid) {
                debug!(pid, polls, "Relay correlated");
                return Ok(relay);
            }

            if let Some(cause) = ctx.err() {
                return Err(self.context_error(pid, cause));
            }

            polls += 1;
            if polls % EXIT_CHECK_EVERY == 0 {
                if let Some(status) = worker.try_wait().await? {
                    return Err(SupervisorError::ProcessExited { pid, status });
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Ask the relay for its pid again and compare with the started process.
    async fn verify(
        &self,
        ctx: &Context,
        worker: &WorkerProcess,
        mut relay: Relay,
    ) -> Result<Relay, SupervisorError> {
        let expected = worker.pid();

        let reported = tokio::select! {
            fetched = tokio::time::timeout(self.options.handshake_timeout, relay.fetch_pid()) => {
                fetched.map_err(|_| RelayError::HandshakeTimeout)??
            }
            cause = ctx.done() => return Err(self.context_error(expected, cause)),
        };

        if reported != expected {
            return Err(SupervisorError::RelayMismatch { expected, reported });
        }
        Ok(relay)
    }

    fn context_error(&self, pid: u32, cause: ContextError) -> SupervisorError {
        match cause {
            ContextError::DeadlineExceeded => SupervisorError::RelayTimeout {
                pid,
                timeout: self.options.relay_timeout,
            },
            ContextError::Canceled => SupervisorError::Context(cause),
        }
    }

    /// Kill and reap a half-spawned worker, folding cleanup failures into `cause`.
    async fn fail(&self, worker: &WorkerProcess, cause: SupervisorError) -> SupervisorError {
        warn!(pid = worker.pid(), error = %cause, "Worker spawn failed, cleaning up");
        let err = cause.with_cleanup(worker.kill_and_wait().await);

        worker.events().publish(
            PoolEvent::supervisor_error(SupervisorError::Supervisor(err.to_string()))
                .with_worker(worker),
        );
        err
    }
}

/// Factory that correlates workers over a unix or TCP listener.
pub struct SocketFactory {
    spawner: Spawner,
    address: RelayAddress,
    shutdown: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SocketFactory {
    /// Start serving relay connections on `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        listener: RelayListener,
        options: FactoryOptions,
        events: EventBus,
    ) -> Result<Self, SupervisorError> {
        let address = listener
            .local_address()
            .map_err(|e| SupervisorError::Relay(RelayError::Io(e)))?;
        let relays = Arc::new(RelayTable::new());
        let shutdown = CancellationToken::new();

        let accept_loop = tokio::spawn(accept_loop(
            listener,
            relays.clone(),
            events.clone(),
            options.handshake_timeout,
            shutdown.clone(),
        ));

        info!(address = %address, "Relay listener started");

        Ok(Self {
            spawner: Spawner {
                relays,
                options,
                events,
            },
            address,
            shutdown,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// Bind `address` and start serving on it.
    pub async fn bind(
        address: &RelayAddress,
        options: FactoryOptions,
        events: EventBus,
    ) -> Result<Self, SupervisorError> {
        let listener = RelayListener::bind(address).await?;
        Self::new(listener, options, events)
    }

    /// Address workers should dial.
    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    /// Factory tuning in effect.
    pub fn options(&self) -> &FactoryOptions {
        &self.spawner.options
    }

    /// Event bus the factory publishes to.
    pub fn events(&self) -> &EventBus {
        &self.spawner.events
    }

    /// Handshaken relays nobody has claimed.
    ///
    /// Relays whose spawn already gave up stay here until the factory is
    /// dropped.
    pub fn pending_relays(&self) -> usize {
        self.spawner.relays.len()
    }
}

#[async_trait]
impl Factory for SocketFactory {
    async fn spawn_worker_with_timeout(
        &self,
        ctx: &Context,
        cmd: Command,
        listeners: &[Listener],
    ) -> Result<WorkerProcess, SupervisorError> {
        let (tx, mut rx) = oneshot::channel();
        let spawner = self.spawner.clone();
        let task_ctx = ctx.with_timeout(self.spawner.options.relay_timeout);
        let listeners = listeners.to_vec();

        let task = tokio::spawn(async move {
            let result = spawner.spawn(&task_ctx, cmd, &listeners).await;
            // A closed mailbox hands the worker back: nobody will own it.
            if let Err(Ok(worker)) = tx.send(result) {
                warn!(pid = worker.pid(), "Spawn abandoned by caller, killing worker");
                reap(&worker).await;
            }
        });

        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result.map(|worker| self.spawner.construct(worker)),
                Err(_) => Err(SupervisorError::Supervisor(
                    "spawn task ended without a result".to_string(),
                )),
            },
            cause = ctx.done() => {
                rx.close();
                // The task sees the cancellation too; let it finish its cleanup.
                if let Err(e) = task.await {
                    warn!(error = %e, "Spawn task failed");
                }
                if let Ok(Ok(worker)) = rx.try_recv() {
                    warn!(pid = worker.pid(), "Spawn finished after cancellation, killing worker");
                    reap(&worker).await;
                }
                Err(SupervisorError::Context(cause))
            }
        }
    }

    async fn spawn_worker(
        &self,
        cmd: Command,
        listeners: &[Listener],
    ) -> Result<WorkerProcess, SupervisorError> {
        let ctx = Context::background().with_timeout(self.spawner.options.relay_timeout);
        let worker = self.spawner.spawn(&ctx, cmd, listeners).await?;
        Ok(self.spawner.construct(worker))
    }

    async fn close(&self) -> Result<(), SupervisorError> {
        self.shutdown.cancel();

        let handle = self.accept_loop.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| SupervisorError::Supervisor(format!("accept loop failed: {e}")))?;
        }
        info!(address = %self.address, "Relay listener closed");
        Ok(())
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Kill and reap a worker nobody will receive.
async fn reap(worker: &WorkerProcess) {
    for result in worker.kill_and_wait().await {
        if let Err(e) = result {
            warn!(pid = worker.pid(), error = %e, "Failed to clean up abandoned worker");
        }
    }
}

/// Accept relay connections until `shutdown` fires.
async fn accept_loop(
    listener: RelayListener,
    relays: Arc<RelayTable>,
    events: EventBus,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept relay connection");
                    events.publish(PoolEvent::supervisor_error(RelayError::Io(e).into()));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let relays = relays.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let mut relay = Relay::new(stream);
            let handshake = tokio::time::timeout(handshake_timeout, relay.fetch_pid())
                .await
                .unwrap_or(Err(RelayError::HandshakeTimeout));

            match handshake {
                Ok(pid) => {
                    debug!(pid, "Relay handshake complete");
                    relays.attach(pid, relay);
                }
                Err(e) => {
                    warn!(error = %e, "Relay handshake failed");
                    events.publish(PoolEvent::supervisor_error(e.into()));
                }
            }
        });
    }

    debug!("Relay accept loop stopped");
}
