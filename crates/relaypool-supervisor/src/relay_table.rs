//! Relays waiting to be claimed by the spawn that started their process.

use dashmap::DashMap;
use tracing::warn;

use crate::relay::Relay;

/// Concurrent pid → relay map.
///
/// Every entry is handed out at most once: `claim` removes atomically, so two
/// spawn attempts can never receive the same connection.
#[derive(Debug, Default)]
pub struct RelayTable {
    relays: DashMap<u32, Relay>,
}

impl RelayTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the relay for `pid`, replacing any unclaimed one.
    pub fn attach(&self, pid: u32, relay: Relay) {
        if self.relays.insert(pid, relay).is_some() {
            warn!(pid, "Replaced unclaimed relay for pid");
        }
    }

    /// Take the relay for `pid`, if one has arrived.
    pub fn claim(&self, pid: u32) -> Option<Relay> {
        self.relays.remove(&pid).map(|(_, relay)| relay)
    }

    /// Number of relays nobody has claimed yet.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Returns true if no relay is waiting.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::relay::{RelayListener, RelayStream};

    /// Returns (supervisor end, worker end).
    async fn relay_pair(listener: &RelayListener) -> (Relay, Relay) {
        let address = listener.local_address().unwrap();
        let dial = tokio::spawn(async move { crate::relay::connect(&address).await.unwrap() });
        let accepted: RelayStream = listener.accept().await.unwrap();
        (Relay::new(accepted), dial.await.unwrap())
    }

    #[tokio::test]
    async fn test_claim_is_load_and_delete() {
        let listener = RelayListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let table = RelayTable::new();

        let (relay, _worker) = relay_pair(&listener).await;
        table.attach(7, relay);
        assert_eq!(table.len(), 1);

        assert!(table.claim(7).is_some());
        assert!(table.claim(7).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_once() {
        let listener = RelayListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let table = Arc::new(RelayTable::new());
        let (relay, _worker) = relay_pair(&listener).await;
        table.attach(99, relay);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(tokio::spawn(async move { table.claim(99).is_some() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_attach_overwrites_unclaimed() {
        let listener = RelayListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let table = RelayTable::new();

        let (first, _first_worker) = relay_pair(&listener).await;
        let (second, _second_worker) = relay_pair(&listener).await;
        table.attach(5, first);
        table.attach(5, second);

        assert_eq!(table.len(), 1);
    }
}
