//! Error types for the supervisor.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::context::ContextError;
use crate::relay::RelayError;

/// Errors that can occur while spawning, correlating or pooling workers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS process could not be started.
    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The worker did not open its relay connection in time.
    #[error("Relay timeout: worker {pid} did not connect within {timeout:?}")]
    RelayTimeout { pid: u32, timeout: Duration },

    /// The relay reported a different pid than the process we started.
    #[error("Relay mismatch: started pid {expected}, relay reported pid {reported}")]
    RelayMismatch { expected: u32, reported: u32 },

    /// No worker became free before the context finished.
    #[error("No free workers: {0}")]
    NoFreeWorkers(#[source] ContextError),

    /// The pool container was destroyed.
    #[error("Worker watcher stopped")]
    WatcherStopped,

    /// Generic operational failure.
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    /// The caller's context was cancelled or its deadline passed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The worker exited before its relay was correlated.
    #[error("Worker {pid} exited before connecting: {status}")]
    ProcessExited { pid: u32, status: ExitStatus },

    /// Relay transport failure.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// The relay listener could not be bound.
    #[error("Failed to bind relay listener on '{address}': {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// The relay address could not be parsed.
    #[error("Invalid relay address '{0}'")]
    InvalidAddress(String),

    /// Delivering the kill signal failed.
    #[error("Failed to kill worker {pid}: {source}")]
    Kill { pid: u32, source: nix::errno::Errno },

    /// Reaping the process failed.
    #[error("Failed to wait for worker {pid}: {source}")]
    Wait { pid: u32, source: std::io::Error },

    /// A failure plus the errors hit while cleaning up after it.
    #[error("{cause}; cleanup failed: {}", join_errors(.cleanup))]
    WithCleanup {
        cause: Box<SupervisorError>,
        cleanup: Vec<SupervisorError>,
    },
}

/// Coarse classification of a `SupervisorError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SpawnFailed,
    RelayTimeout,
    RelayMismatch,
    NoFreeWorkers,
    WatcherStopped,
    SupervisorError,
    Canceled,
    DeadlineExceeded,
    ProcessExited,
    Relay,
}

impl SupervisorError {
    /// Classify the error, looking through cleanup wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Self::RelayTimeout { .. } => ErrorKind::RelayTimeout,
            Self::RelayMismatch { .. } => ErrorKind::RelayMismatch,
            Self::NoFreeWorkers(_) => ErrorKind::NoFreeWorkers,
            Self::WatcherStopped => ErrorKind::WatcherStopped,
            Self::Context(ContextError::Canceled) => ErrorKind::Canceled,
            Self::Context(ContextError::DeadlineExceeded) => ErrorKind::DeadlineExceeded,
            Self::ProcessExited { .. } => ErrorKind::ProcessExited,
            Self::Relay(_) => ErrorKind::Relay,
            Self::WithCleanup { cause, .. } => cause.kind(),
            Self::Supervisor(_)
            | Self::Bind { .. }
            | Self::InvalidAddress(_)
            | Self::Kill { .. }
            | Self::Wait { .. } => ErrorKind::SupervisorError,
        }
    }

    /// Attach cleanup results to this error.
    ///
    /// Successful cleanup steps are dropped; if every step succeeded the
    /// error is returned unchanged.
    pub fn with_cleanup<I>(self, steps: I) -> Self
    where
        I: IntoIterator<Item = Result<(), SupervisorError>>,
    {
        let cleanup: Vec<_> = steps.into_iter().filter_map(Result::err).collect();
        if cleanup.is_empty() {
            return self;
        }
        Self::WithCleanup {
            cause: Box::new(self),
            cleanup,
        }
    }
}

fn join_errors(errors: &[SupervisorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cleanup_keeps_cause_kind() {
        let err = SupervisorError::RelayMismatch {
            expected: 10,
            reported: 11,
        }
        .with_cleanup([
            Ok(()),
            Err(SupervisorError::Kill {
                pid: 10,
                source: nix::errno::Errno::ESRCH,
            }),
        ]);

        assert_eq!(err.kind(), ErrorKind::RelayMismatch);
        let text = err.to_string();
        assert!(text.contains("started pid 10"));
        assert!(text.contains("Failed to kill worker 10"));
    }

    #[test]
    fn test_with_cleanup_all_ok_is_identity() {
        let err = SupervisorError::WatcherStopped.with_cleanup([Ok(()), Ok(())]);
        assert!(matches!(err, SupervisorError::WatcherStopped));
    }

    #[test]
    fn test_context_kinds() {
        assert_eq!(
            SupervisorError::from(ContextError::Canceled).kind(),
            ErrorKind::Canceled
        );
        assert_eq!(
            SupervisorError::NoFreeWorkers(ContextError::DeadlineExceeded).kind(),
            ErrorKind::NoFreeWorkers
        );
    }
}
