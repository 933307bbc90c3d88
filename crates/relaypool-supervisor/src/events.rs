//! Fire-and-forget event bus for pool lifecycle events.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use relaypool_core::EventKind;

use crate::error::SupervisorError;
use crate::worker::WorkerProcess;

/// Callback invoked for every published event.
///
/// Listeners run on the publishing task and must not block.
pub type Listener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// A pool lifecycle event.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    /// Type of event.
    pub kind: EventKind,
    /// Worker the event is about, if any.
    pub payload: Option<WorkerProcess>,
    /// Error that caused the event, if any.
    pub error: Option<Arc<SupervisorError>>,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl PoolEvent {
    /// Create an event with no payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an event about a worker.
    pub fn worker(kind: EventKind, worker: &WorkerProcess) -> Self {
        Self::new(kind).with_worker(worker)
    }

    /// Create a `SupervisorError` event.
    pub fn supervisor_error(error: SupervisorError) -> Self {
        Self::new(EventKind::SupervisorError).with_error(error)
    }

    /// Builder method to attach a worker.
    pub fn with_worker(mut self, worker: &WorkerProcess) -> Self {
        self.payload = Some(worker.clone());
        self
    }

    /// Builder method to attach an error.
    pub fn with_error(mut self, error: SupervisorError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }
}

/// Registry of listeners; cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all future events.
    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    /// Register a listener that forwards events into a channel.
    ///
    /// Returns the receiving end. Events published after the receiver is
    /// dropped are discarded.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(move |event: &PoolEvent| {
            // Receiver might be dropped
            tx.send(event.clone()).ok();
        }));
        rx
    }

    /// A new bus holding this bus's listeners plus `extra`.
    ///
    /// Later subscriptions to either bus are not shared.
    pub fn with_listeners(&self, extra: &[Listener]) -> Self {
        let mut listeners = self.listeners.read().clone();
        listeners.extend(extra.iter().cloned());
        Self {
            listeners: Arc::new(RwLock::new(listeners)),
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Dispatch `event` to every listener registered right now.
    pub fn publish(&self, event: PoolEvent) {
        // Snapshot so listeners may subscribe from inside a callback.
        let listeners = self.listeners.read().clone();
        trace!(event = %event.kind, listeners = listeners.len(), "Publishing pool event");
        for listener in listeners {
            listener(&event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}
