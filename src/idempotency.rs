//! Bookkeeping for deployment request deliveries.
//!
//! The last payload seen for each deployment id is written to a shared
//! key-value store ("last payload wins"). On top of that, an in-process
//! claim stops a redelivery from running while the same id is still
//! executing. A redelivery after the first run has finished runs again.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::Result;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

pub fn deployment_key(id: i64) -> String {
    format!("deployment:{}", id)
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    in_flight: Arc<Mutex<BTreeSet<i64>>>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Best effort: a storage failure is logged and swallowed.
    pub async fn record(&self, id: i64, payload: &[u8]) {
        if let Err(e) = self.store.set(&deployment_key(id), payload).await {
            warn!("Failed to record payload for deployment {}: {}", id, e);
        }
    }

    pub async fn last_payload(&self, id: i64) -> Result<Option<Vec<u8>>> {
        self.store.get(&deployment_key(id)).await
    }

    /// Claims `id` for execution. `None` means it is already executing.
    pub fn claim(&self, id: i64) -> Option<InFlightClaim> {
        let mut in_flight = self.lock();
        if !in_flight.insert(id) {
            return None;
        }
        Some(InFlightClaim {
            id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> Vec<i64> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<i64>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the claim when dropped.
#[derive(Debug)]
pub struct InFlightClaim {
    id: i64,
    in_flight: Arc<Mutex<BTreeSet<i64>>>,
}

impl InFlightClaim {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore(Mutex<HashMap<String, Vec<u8>>>);

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            self.0.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(DeployError::Configuration("store offline".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn last_payload_wins() {
        let guard = IdempotencyGuard::new(Arc::new(MemoryStore::default()));
        guard.record(7, b"first").await;
        guard.record(7, b"second").await;
        assert_eq!(guard.last_payload(7).await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(guard.last_payload(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_failure_is_swallowed() {
        let guard = IdempotencyGuard::new(Arc::new(BrokenStore));
        guard.record(1, b"payload").await;
    }

    #[test]
    fn claim_blocks_concurrent_duplicates_until_released() {
        let guard = IdempotencyGuard::new(Arc::new(MemoryStore::default()));
        let claim = guard.claim(5).expect("first claim");
        assert_eq!(claim.id(), 5);
        assert!(guard.claim(5).is_none());
        assert!(guard.claim(6).is_some());
        assert_eq!(guard.in_flight(), vec![5]);

        drop(claim);
        assert!(guard.in_flight().is_empty());
        assert!(guard.claim(5).is_some());
    }

    #[test]
    fn key_format() {
        assert_eq!(deployment_key(42), "deployment:42");
    }
}
