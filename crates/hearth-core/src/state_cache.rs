// ── Cached upstream state snapshot ──
//
// `/api/states` returns every entity in the installation; guests only
// need their slice, and hitting the upstream for each page load is
// wasteful. A short TTL keeps the initial view fresh enough -- live
// updates arrive over the event stream anyway. The lock is held across
// the refresh so concurrent callers coalesce into a single fetch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;

use hearth_api::UpstreamClient;

pub struct StateCache {
    client: Arc<UpstreamClient>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<Vec<Value>>)>>,
}

impl StateCache {
    pub fn new(client: Arc<UpstreamClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// The full state list, refreshed when older than the TTL.
    pub async fn states(&self) -> Result<Arc<Vec<Value>>, hearth_api::Error> {
        let mut cached = self.cached.lock().await;
        if let Some((fetched_at, states)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(states));
            }
        }
        let fresh = Arc::new(self.client.get_states().await?);
        *cached = Some((Instant::now(), Arc::clone(&fresh)));
        Ok(fresh)
    }

    /// States restricted to `entity_ids`. Entities the upstream didn't
    /// report come back as `unavailable` placeholders so the guest UI
    /// can still render a card for them.
    pub async fn states_for(
        &self,
        entity_ids: &HashSet<String>,
    ) -> Result<HashMap<String, Value>, hearth_api::Error> {
        let all = self.states().await?;

        let mut out: HashMap<String, Value> = HashMap::new();
        for state in all.iter() {
            if let Some(entity_id) = state.get("entity_id").and_then(Value::as_str) {
                if entity_ids.contains(entity_id) {
                    out.insert(entity_id.to_owned(), state.clone());
                }
            }
        }
        for entity_id in entity_ids {
            out.entry(entity_id.clone()).or_insert_with(|| {
                json!({
                    "entity_id": entity_id,
                    "state": "unavailable",
                    "attributes": {}
                })
            });
        }
        Ok(out)
    }
}
