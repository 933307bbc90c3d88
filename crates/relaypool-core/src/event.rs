//! Pool lifecycle event kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Kind of a pool lifecycle event.
///
/// Codes start at 10000 so they never collide with per-worker event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum EventKind {
    /// A new worker was spawned and is ready.
    WorkerConstruct = 10000,
    /// A worker was destroyed.
    WorkerDestruct,
    /// The supervisor could not complete an operation.
    SupervisorError,
    /// A worker process exited and was reaped.
    WorkerProcessExit,
    /// No worker became free before the allocation deadline.
    NoFreeWorkers,
    /// A worker used more memory than allowed.
    MaxMemory,
    /// A worker reached its maximum lifetime.
    Ttl,
    /// A worker stayed idle too long.
    IdleTtl,
    /// A worker spent too long executing one task.
    ExecTtl,
    /// The pool needs a restart.
    PoolRestart,
}

impl EventKind {
    /// All kinds, in code order.
    pub const ALL: [EventKind; 10] = [
        Self::WorkerConstruct,
        Self::WorkerDestruct,
        Self::SupervisorError,
        Self::WorkerProcessExit,
        Self::NoFreeWorkers,
        Self::MaxMemory,
        Self::Ttl,
        Self::IdleTtl,
        Self::ExecTtl,
        Self::PoolRestart,
    ];

    /// Numeric event code.
    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// Display name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerConstruct => "EventWorkerConstruct",
            Self::WorkerDestruct => "EventWorkerDestruct",
            Self::SupervisorError => "EventSupervisorError",
            Self::WorkerProcessExit => "EventWorkerProcessExit",
            Self::NoFreeWorkers => "EventNoFreeWorkers",
            Self::MaxMemory => "EventMaxMemory",
            Self::Ttl => "EventTTL",
            Self::IdleTtl => "EventIdleTTL",
            Self::ExecTtl => "EventExecTTL",
            Self::PoolRestart => "EventPoolRestart",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i64> for EventKind {
    type Error = CoreError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .ok_or(CoreError::UnknownEvent(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_sequential() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.code(), 10000 + i as i64);
        }
    }

    #[test]
    fn test_display_names() {
        assert_eq!(EventKind::WorkerConstruct.to_string(), "EventWorkerConstruct");
        assert_eq!(EventKind::Ttl.to_string(), "EventTTL");
        assert_eq!(EventKind::IdleTtl.to_string(), "EventIdleTTL");
        assert_eq!(EventKind::PoolRestart.to_string(), "EventPoolRestart");
    }

    #[test]
    fn test_from_code() {
        assert_eq!(EventKind::try_from(10004), Ok(EventKind::NoFreeWorkers));
        assert_eq!(EventKind::try_from(9999), Err(CoreError::UnknownEvent(9999)));
    }
}
