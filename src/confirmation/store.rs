//! Confirmation storage.
//!
//! [`ConfirmationStore`] is the only shared mutable resource of the
//! confirmation core. Every record lives under
//! `pending:{service_key_prefix}:{confirmation_id}`, so two domain services can
//! never address each other's records even with identical ids.
//!
//! Backends must:
//! - fail `create` with `ConfirmationIdCollision` when the key already exists;
//! - expire keys after the TTL given to `create`;
//! - implement `take` as one atomic fetch-and-delete;
//! - surface every backend failure as `ConfirmationStoreUnavailable`.
//!
//! The default implementation is [`InMemoryConfirmationStore`], a `DashMap`
//! with lazy eviction on read plus a periodic reaper.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use tokio::time::Instant;
use tracing::debug;

use super::record::PendingConfirmation;
use crate::{Error, Result};

/// Bytes of entropy in a confirmation id.
const ID_BYTES: usize = 32;

/// Storage key for a confirmation.
#[must_use]
pub fn storage_key(service_key_prefix: &str, confirmation_id: &str) -> String {
    format!("pending:{service_key_prefix}:{confirmation_id}")
}

/// Generate a 256-bit, URL-safe confirmation id.
#[must_use]
pub fn generate_confirmation_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// TTL-capable key/value storage for pending confirmations.
#[async_trait::async_trait]
pub trait ConfirmationStore: Send + Sync + 'static {
    /// Store `record` for `ttl`.
    ///
    /// Fails with `ConfirmationIdCollision` if the key is already live.
    async fn create(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
        record: &PendingConfirmation,
        ttl: Duration,
    ) -> Result<()>;

    /// Read a record without consuming it.
    async fn get(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>>;

    /// Remove a record. Returns whether it was present.
    async fn delete(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool>;

    /// Whether a live record exists.
    async fn exists(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool>;

    /// Atomically read and remove a record.
    ///
    /// Of any number of concurrent callers, at most one receives `Some`.
    async fn take(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>>;

    /// Drop records whose TTL elapsed. Backends with native TTL return 0.
    async fn reap_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    record: PendingConfirmation,
    evict_at: Instant,
}

impl StoredEntry {
    fn is_evicted(&self) -> bool {
        Instant::now() >= self.evict_at
    }
}

/// In-process confirmation store. Records do not survive a restart and are
/// not shared between instances.
#[derive(Debug, Default)]
pub struct InMemoryConfirmationStore {
    entries: DashMap<String, StoredEntry>,
}

impl InMemoryConfirmationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones awaiting eviction.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl ConfirmationStore for InMemoryConfirmationStore {
    async fn create(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
        record: &PendingConfirmation,
        ttl: Duration,
    ) -> Result<()> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let entry = StoredEntry {
            record: record.clone(),
            evict_at: Instant::now() + ttl,
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_evicted() {
                    return Err(Error::ConfirmationIdCollision(confirmation_id.to_string()));
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let Some(entry) = self.entries.get(&key) else {
            return Ok(None);
        };
        if !entry.is_evicted() {
            return Ok(Some(entry.record.clone()));
        }
        drop(entry);
        self.entries.remove_if(&key, |_, e| e.is_evicted());
        Ok(None)
    }

    async fn delete(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool> {
        let key = storage_key(service_key_prefix, confirmation_id);
        Ok(self
            .entries
            .remove(&key)
            .is_some_and(|(_, entry)| !entry.is_evicted()))
    }

    async fn exists(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool> {
        let key = storage_key(service_key_prefix, confirmation_id);
        Ok(self.entries.get(&key).is_some_and(|e| !e.is_evicted()))
    }

    async fn take(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>> {
        let key = storage_key(service_key_prefix, confirmation_id);
        Ok(self
            .entries
            .remove(&key)
            .filter(|(_, entry)| !entry.is_evicted())
            .map(|(_, entry)| entry.record))
    }

    async fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_evicted());
        before.saturating_sub(self.entries.len())
    }
}

/// Spawn a background task that reaps evicted records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn ConfirmationStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired confirmations");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Confirmation reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::record::ActionProposal;
    use serde_json::json;

    fn record(id: &str) -> PendingConfirmation {
        PendingConfirmation::from_proposal(
            id.to_string(),
            "finance",
            "alice",
            ActionProposal::new("approve_expense", "Approve EXP-1", json!({"report": "EXP-1"})),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn key_is_namespaced_by_prefix() {
        assert_eq!(storage_key("hr", "abc"), "pending:hr:abc");
        assert_ne!(storage_key("hr", "abc"), storage_key("payroll", "abc"));
    }

    #[test]
    fn generated_ids_are_unique_and_url_safe() {
        let a = generate_confirmation_id();
        let b = generate_confirmation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        // GIVEN: a stored record
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();

        // THEN: it is readable and exists
        assert_eq!(
            store.get("finance", "c1").await.unwrap().unwrap().confirmation_id,
            "c1"
        );
        assert!(store.exists("finance", "c1").await.unwrap());

        // WHEN: deleted
        assert!(store.delete("finance", "c1").await.unwrap());

        // THEN: it is gone
        assert!(!store.exists("finance", "c1").await.unwrap());
        assert!(!store.delete("finance", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_live_collision() {
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            store
                .create("finance", "c1", &record("c1"), Duration::from_secs(60))
                .await,
            Err(Error::ConfirmationIdCollision(_))
        ));
    }

    #[tokio::test]
    async fn same_id_under_different_prefixes_does_not_collide() {
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .create("payroll", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn take_returns_record_once() {
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.take("finance", "c1").await.unwrap().is_some());
        assert!(store.take("finance", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evicted_records_are_invisible_and_replaceable() {
        // GIVEN: a record stored with a zero TTL
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "c1", &record("c1"), Duration::ZERO)
            .await
            .unwrap();

        // THEN: it cannot be read or taken
        assert!(store.get("finance", "c1").await.unwrap().is_none());
        assert!(!store.exists("finance", "c1").await.unwrap());

        // AND: the key can be reused
        store
            .create("finance", "c1", &record("c1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.take("finance", "c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reap_removes_only_evicted() {
        let store = InMemoryConfirmationStore::new();
        store
            .create("finance", "old", &record("old"), Duration::ZERO)
            .await
            .unwrap();
        store
            .create("finance", "new", &record("new"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.reap_expired().await, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let store = Arc::new(InMemoryConfirmationStore::new());
        store
            .create("finance", "old", &record("old"), Duration::ZERO)
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        spawn_reaper(store.clone(), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
        let _ = tx.send(());
    }
}
