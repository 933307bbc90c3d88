//! Worker lifecycle status and its atomically shared cell.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle status of a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum WorkerStatus {
    /// Created but the OS process has not been launched.
    #[default]
    Inactive = 0,
    /// OS process launched, relay not yet attached.
    Starting = 1,
    /// Relay attached, waiting for work.
    Ready = 2,
    /// Claimed by a caller and executing.
    Working = 3,
    /// Flagged by a TTL or health check; must be replaced.
    Invalid = 4,
    /// Graceful stop requested.
    Stopping = 5,
    /// Exited after a graceful stop.
    Stopped = 6,
    /// Kill signal being delivered.
    Killing = 7,
    /// Killed and reaped.
    Killed = 8,
    /// Exited with an error status.
    Errored = 9,
    /// Removed from the supervisor.
    Destroyed = 10,
}

impl WorkerStatus {
    /// Returns true for the only two states eligible for reuse.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ready | Self::Working)
    }

    /// Returns true once the process is gone or on its way out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Killing | Self::Killed | Self::Errored | Self::Destroyed
        )
    }

    /// Stable lowercase name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Invalid => "invalid",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Errored => "errored",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for WorkerStatus {
    type Error = CoreError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Inactive,
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Working,
            4 => Self::Invalid,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 => Self::Killing,
            8 => Self::Killed,
            9 => Self::Errored,
            10 => Self::Destroyed,
            other => return Err(CoreError::UnknownStatus(other)),
        })
    }
}

impl FromStr for WorkerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "inactive" => Self::Inactive,
            "starting" => Self::Starting,
            "ready" => Self::Ready,
            "working" => Self::Working,
            "invalid" => Self::Invalid,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "killing" => Self::Killing,
            "killed" => Self::Killed,
            "errored" => Self::Errored,
            "destroyed" => Self::Destroyed,
            _ => return Err(CoreError::UnknownStatusName(s.to_string())),
        })
    }
}

/// Shared, atomically updated state of one worker.
///
/// The owner of a worker and the pool's eviction scan read this from
/// different tasks, so every field is an atomic.
#[derive(Debug)]
pub struct WorkerState {
    status: AtomicU8,
    num_execs: AtomicU64,
    /// Unix milliseconds of the last status change.
    last_used: AtomicI64,
}

impl WorkerState {
    /// Create a state cell holding `status`.
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
            num_execs: AtomicU64::new(0),
            last_used: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Current status.
    pub fn value(&self) -> WorkerStatus {
        // Only valid codes are ever stored.
        WorkerStatus::try_from(self.status.load(Ordering::Acquire)).unwrap_or(WorkerStatus::Errored)
    }

    /// Unconditionally set the status.
    pub fn set(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
        self.touch();
    }

    /// Set the status to `new` only if it is currently `current`.
    ///
    /// Returns true when the swap happened.
    pub fn transition(&self, current: WorkerStatus, new: WorkerStatus) -> bool {
        let swapped = self
            .status
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.touch();
        }
        swapped
    }

    /// Returns true if the worker may be handed out again.
    pub fn is_usable(&self) -> bool {
        self.value().is_usable()
    }

    /// Count one completed execution.
    pub fn register_exec(&self) {
        self.num_execs.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of completed executions.
    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::Relaxed)
    }

    /// Time of the last status change.
    pub fn last_used(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used.load(Ordering::Acquire))
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn touch(&self) {
        self.last_used
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new(WorkerStatus::Inactive)
    }
}
