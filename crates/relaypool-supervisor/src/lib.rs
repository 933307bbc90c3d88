//! relaypool supervisor
//!
//! Spawns worker processes, correlates each with the relay connection it
//! dials back on, and keeps ready workers in a bounded pool:
//! - `factory`: spawn-and-correlate over a unix or TCP listener
//! - `container`: bounded pool with inline eviction of unhealthy workers
//! - `ttl`: time limit enforcement on tracked workers
//! - `events`: fire-and-forget lifecycle event bus
//!
//! Unix only: workers are killed with signals.

pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod events;
pub mod factory;
pub mod relay;
pub mod relay_table;
pub mod ttl;
pub mod worker;

pub use config::Config;
pub use container::{BoundedVec, Container};
pub use context::{Context, ContextError};
pub use error::{ErrorKind, SupervisorError};
pub use events::{EventBus, Listener, PoolEvent};
pub use factory::{Factory, FactoryOptions, SocketFactory};
pub use relay::{Frame, Relay, RelayAddress, RelayError, RelayListener};
pub use relay_table::RelayTable;
pub use ttl::{TtlPolicy, TtlSupervisor};
pub use worker::{Worker, WorkerProcess};
