//! Supervisor configuration.

use std::time::Duration;

use crate::error::SupervisorError;
use crate::factory::FactoryOptions;
use crate::relay::RelayAddress;
use crate::ttl::TtlPolicy;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay listener address (`unix://<path>`, `tcp://<host:port>`).
    pub relay_address: String,

    /// How long a spawn waits for the worker to dial back (seconds).
    pub relay_timeout_secs: u64,

    /// How long an accepted connection has to answer the pid handshake (milliseconds).
    pub handshake_timeout_ms: u64,

    /// Number of workers kept in the pool.
    pub num_workers: usize,

    /// How long an allocation waits for a free worker and its reply (seconds).
    pub allocate_timeout_secs: u64,

    /// How long a worker gets to exit on shutdown before it is killed (seconds).
    pub destroy_timeout_secs: u64,

    /// Maximum worker lifetime (seconds, 0 = unlimited).
    pub ttl_secs: u64,

    /// Maximum idle time of a ready worker (seconds, 0 = unlimited).
    pub idle_ttl_secs: u64,

    /// Maximum duration of one execution (seconds, 0 = unlimited).
    pub exec_ttl_secs: u64,

    /// Interval between time limit checks (seconds).
    pub supervise_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_address: "unix:///tmp/relaypool.sock".to_string(),
            relay_timeout_secs: 60,
            handshake_timeout_ms: 5000,
            num_workers: 4,
            allocate_timeout_secs: 60,
            destroy_timeout_secs: 10,
            ttl_secs: 0,
            idle_ttl_secs: 0,
            exec_ttl_secs: 0,
            supervise_interval_secs: 1,
        }
    }
}

impl Config {
    /// Parsed relay listener address.
    pub fn relay_address(&self) -> Result<RelayAddress, SupervisorError> {
        self.relay_address.parse()
    }

    /// Spawn factory tuning.
    pub fn factory_options(&self) -> FactoryOptions {
        FactoryOptions {
            relay_timeout: Duration::from_secs(self.relay_timeout_secs),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    /// Worker time limits.
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            ttl: limit(self.ttl_secs),
            idle_ttl: limit(self.idle_ttl_secs),
            exec_ttl: limit(self.exec_ttl_secs),
        }
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_secs(self.allocate_timeout_secs)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    /// Interval between time limit checks, at least one millisecond.
    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs).max(Duration::from_millis(1))
    }
}

fn limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
