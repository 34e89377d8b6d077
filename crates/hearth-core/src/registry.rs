// ── Subscription registry and entity cache ──
//
// Owns the map from token id to its live subscriber channels, and the
// per-token entity allowlist cache that filters fan-out. One lock
// guards both maps so fan-out always sees them consistent; directory
// I/O happens outside the lock with a re-check afterward, so a slow
// token-store fetch never stalls event delivery.
//
// Invariant: a cache entry exists only while the token has at least
// one live subscriber. Unsubscribing the last channel removes both in
// the same critical section.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::{DirectoryError, TokenDirectory};
use crate::model::GuestEvent;

struct Maps {
    /// token id -> subscription id -> event channel.
    subscribers: HashMap<String, HashMap<Uuid, mpsc::Sender<GuestEvent>>>,
    /// token id -> cached entity allowlist.
    entity_cache: HashMap<String, HashSet<String>>,
}

/// A live guest event stream.
///
/// Dropping the receiver alone does not unregister the channel -- call
/// [`SubscriptionRegistry::unsubscribe`] with the id when the consumer
/// disconnects.
pub struct Subscription {
    pub id: Uuid,
    pub token_id: String,
    pub events: mpsc::Receiver<GuestEvent>,
}

/// Per-token subscriber channels plus the fan-out entity cache.
pub struct SubscriptionRegistry {
    maps: Mutex<Maps>,
    directory: Arc<dyn TokenDirectory>,
    queue_capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(directory: Arc<dyn TokenDirectory>, queue_capacity: usize) -> Self {
        Self {
            maps: Mutex::new(Maps {
                subscribers: HashMap::new(),
                entity_cache: HashMap::new(),
            }),
            directory,
            queue_capacity,
        }
    }

    /// Register a new bounded event channel for `token_id`.
    ///
    /// Populates the entity cache on first subscribe, fetching from
    /// the directory outside the lock and re-checking before install
    /// so a concurrent identical fetch is never clobbered.
    pub async fn subscribe(&self, token_id: &str) -> Result<Subscription, DirectoryError> {
        let needs_fetch = !self
            .maps
            .lock()
            .await
            .entity_cache
            .contains_key(token_id);

        if needs_fetch {
            let entities = self.directory.get_entity_ids(token_id).await?;
            let mut maps = self.maps.lock().await;
            // Re-check after re-acquiring: keep whichever fetch landed first.
            maps.entity_cache
                .entry(token_id.to_owned())
                .or_insert(entities);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();

        let mut maps = self.maps.lock().await;
        maps.subscribers
            .entry(token_id.to_owned())
            .or_default()
            .insert(id, tx);

        debug!(token_id, subscription = %id, "subscriber registered");
        Ok(Subscription {
            id,
            token_id: token_id.to_owned(),
            events: rx,
        })
    }

    /// Remove one channel. When the token's last channel goes, the
    /// subscriber set and its cache entry are deleted atomically.
    pub async fn unsubscribe(&self, token_id: &str, subscription_id: Uuid) {
        let mut maps = self.maps.lock().await;
        if let Some(channels) = maps.subscribers.get_mut(token_id) {
            channels.remove(&subscription_id);
            if channels.is_empty() {
                maps.subscribers.remove(token_id);
                maps.entity_cache.remove(token_id);
            }
        }
        debug!(token_id, subscription = %subscription_id, "subscriber removed");
    }

    /// Refresh or drop the cached allowlist after the token's entity
    /// list changed in the external store.
    ///
    /// Refetches only while the token has live subscribers, re-checking
    /// after the fetch since they may all have unsubscribed mid-flight.
    /// A failed refetch drops the entry: a missing entry filters to
    /// zero matches, never to false positives.
    pub async fn invalidate_entity_cache(&self, token_id: &str) {
        let has_subscribers = self
            .maps
            .lock()
            .await
            .subscribers
            .contains_key(token_id);

        if !has_subscribers {
            self.maps.lock().await.entity_cache.remove(token_id);
            return;
        }

        match self.directory.get_entity_ids(token_id).await {
            Ok(entities) => {
                let mut maps = self.maps.lock().await;
                if maps.subscribers.contains_key(token_id) {
                    maps.entity_cache.insert(token_id.to_owned(), entities);
                } else {
                    maps.entity_cache.remove(token_id);
                }
            }
            Err(e) => {
                warn!(token_id, error = %e, "entity cache refresh failed, dropping entry");
                self.maps.lock().await.entity_cache.remove(token_id);
            }
        }
    }

    /// Deliver a state change to every channel of every token whose
    /// cached allowlist contains `entity_id`.
    ///
    /// Takes one consistent snapshot of both maps under the lock, then
    /// pushes outside it. Full channels drop the event for that channel
    /// only -- no subscriber may block the ingestion pipeline.
    pub async fn fan_out(&self, entity_id: &str, state: &Value) {
        let (subscribers, cache) = {
            let maps = self.maps.lock().await;
            (maps.subscribers.clone(), maps.entity_cache.clone())
        };

        let event = GuestEvent::StateChange {
            entity_id: entity_id.to_owned(),
            state: state.clone(),
        };

        for (token_id, channels) in &subscribers {
            let allowed = cache
                .get(token_id)
                .is_some_and(|set| set.contains(entity_id));
            if !allowed {
                continue;
            }
            for tx in channels.values() {
                if tx.try_send(event.clone()).is_err() {
                    debug!(token_id, entity_id, "subscriber queue full, dropping event");
                }
            }
        }
    }

    /// Tell every channel of one token that its token expired.
    pub async fn broadcast_token_expired(&self, token_id: &str) {
        let channels: Vec<mpsc::Sender<GuestEvent>> = {
            let maps = self.maps.lock().await;
            maps.subscribers
                .get(token_id)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        for tx in channels {
            let _ = tx.try_send(GuestEvent::TokenExpired);
        }
    }

    /// Push a control event to every channel of every token,
    /// regardless of entity filters.
    pub async fn broadcast_all(&self, event: GuestEvent) {
        let channels: Vec<mpsc::Sender<GuestEvent>> = {
            let maps = self.maps.lock().await;
            maps.subscribers
                .values()
                .flat_map(|m| m.values().cloned())
                .collect()
        };
        for tx in channels {
            let _ = tx.try_send(event.clone());
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    /// Live channel count for a token.
    pub async fn subscriber_count(&self, token_id: &str) -> usize {
        self.maps
            .lock()
            .await
            .subscribers
            .get(token_id)
            .map_or(0, HashMap::len)
    }

    /// Whether a fan-out cache entry currently exists for a token.
    pub async fn has_cache_entry(&self, token_id: &str) -> bool {
        self.maps.lock().await.entity_cache.contains_key(token_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::model::TokenRecord;

    /// Directory backed by a mutable in-memory map, with a failure switch.
    #[derive(Default)]
    struct FakeDirectory {
        entities: std::sync::Mutex<HashMap<String, HashSet<String>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeDirectory {
        fn grant(&self, token_id: &str, entity_ids: &[&str]) {
            self.entities.lock().unwrap().insert(
                token_id.to_owned(),
                entity_ids.iter().map(|s| (*s).to_owned()).collect(),
            );
        }

        fn set_failing(&self, failing: bool) {
            self.fail
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TokenDirectory for FakeDirectory {
        async fn get_entity_ids(
            &self,
            token_id: &str,
        ) -> Result<HashSet<String>, DirectoryError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DirectoryError::new("store unavailable"));
            }
            Ok(self
                .entities
                .lock()
                .unwrap()
                .get(token_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn get_token(
            &self,
            _token_id: &str,
        ) -> Result<Option<TokenRecord>, DirectoryError> {
            Ok(None)
        }
    }

    fn registry_with(dir: Arc<FakeDirectory>, capacity: usize) -> SubscriptionRegistry {
        SubscriptionRegistry::new(dir, capacity)
    }

    #[tokio::test]
    async fn cache_entry_exists_only_while_subscribed() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        assert!(!registry.has_cache_entry("tok").await);

        let first = registry.subscribe("tok").await.unwrap();
        let second = registry.subscribe("tok").await.unwrap();
        assert!(registry.has_cache_entry("tok").await);
        assert_eq!(registry.subscriber_count("tok").await, 2);

        registry.unsubscribe("tok", first.id).await;
        assert!(registry.has_cache_entry("tok").await);

        registry.unsubscribe("tok", second.id).await;
        assert!(!registry.has_cache_entry("tok").await);
        assert_eq!(registry.subscriber_count("tok").await, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_only_owning_tokens() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("alice", &["light.kitchen"]);
        dir.grant("bob", &["lock.front_door"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let mut alice = registry.subscribe("alice").await.unwrap();
        let mut bob = registry.subscribe("bob").await.unwrap();

        registry
            .fan_out("light.kitchen", &json!({ "state": "on" }))
            .await;

        let event = alice.events.try_recv().unwrap();
        assert!(matches!(
            event,
            GuestEvent::StateChange { ref entity_id, .. } if entity_id == "light.kitchen"
        ));
        assert!(bob.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_after_unsubscribe_delivers_nothing() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let sub = registry.subscribe("tok").await.unwrap();
        registry.unsubscribe("tok", sub.id).await;

        // No panic, no delivery, and the invariant still holds.
        registry
            .fan_out("light.kitchen", &json!({ "state": "on" }))
            .await;
        assert!(!registry.has_cache_entry("tok").await);
    }

    #[tokio::test]
    async fn full_channel_drops_event_without_blocking() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 1);

        let mut sub = registry.subscribe("tok").await.unwrap();

        registry.fan_out("light.kitchen", &json!({ "n": 1 })).await;
        registry.fan_out("light.kitchen", &json!({ "n": 2 })).await;
        registry.fan_out("light.kitchen", &json!({ "n": 3 })).await;

        // Exactly the first event survived; the rest were dropped.
        let first = sub.events.try_recv().unwrap();
        assert!(matches!(
            first,
            GuestEvent::StateChange { ref state, .. } if state["n"] == 1
        ));
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalidate_refetches_for_live_subscribers() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let mut sub = registry.subscribe("tok").await.unwrap();

        // Admin swaps the token's entities.
        dir.grant("tok", &["lock.front_door"]);
        registry.invalidate_entity_cache("tok").await;

        registry
            .fan_out("light.kitchen", &json!({ "state": "on" }))
            .await;
        assert!(sub.events.try_recv().is_err());

        registry
            .fan_out("lock.front_door", &json!({ "state": "locked" }))
            .await;
        assert!(sub.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn invalidate_without_subscribers_drops_entry() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        // Never subscribed -- invalidation must not create an entry.
        registry.invalidate_entity_cache("tok").await;
        assert!(!registry.has_cache_entry("tok").await);
    }

    #[tokio::test]
    async fn invalidate_fetch_failure_fails_closed() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.kitchen"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let mut sub = registry.subscribe("tok").await.unwrap();

        dir.set_failing(true);
        registry.invalidate_entity_cache("tok").await;

        // Entry dropped: zero matches rather than stale positives.
        assert!(!registry.has_cache_entry("tok").await);
        registry
            .fan_out("light.kitchen", &json!({ "state": "on" }))
            .await;
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn token_expired_reaches_only_that_token() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("alice", &["light.kitchen"]);
        dir.grant("bob", &["lock.front_door"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let mut alice = registry.subscribe("alice").await.unwrap();
        let mut bob = registry.subscribe("bob").await.unwrap();

        registry.broadcast_token_expired("alice").await;

        assert_eq!(alice.events.try_recv().unwrap(), GuestEvent::TokenExpired);
        assert!(bob.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_all_ignores_entity_filters() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("alice", &["light.kitchen"]);
        dir.grant("bob", &["lock.front_door"]);
        let registry = registry_with(Arc::clone(&dir), 8);

        let mut alice = registry.subscribe("alice").await.unwrap();
        let mut bob = registry.subscribe("bob").await.unwrap();

        registry.broadcast_all(GuestEvent::Reconnected).await;

        assert_eq!(alice.events.try_recv().unwrap(), GuestEvent::Reconnected);
        assert_eq!(bob.events.try_recv().unwrap(), GuestEvent::Reconnected);
    }
}
