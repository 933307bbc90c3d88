//! relaypool Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Sockets or process management
//! - The async runtime
//!
//! All types here describe worker lifecycle and the events the supervisor
//! reports about it.

pub mod error;
pub mod event;
pub mod state;

// Re-export commonly used types
pub use error::CoreError;
pub use event::EventKind;
pub use state::{WorkerState, WorkerStatus};
