// ── Gateway ──
//
// The one explicitly-constructed component tying the pieces together:
// upstream connector, subscription registry, rate limiter, command
// pipeline, and state cache. Construct one per process (or per test)
// and call `start`/`shutdown` -- there is no module-level instance and
// no hidden global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hearth_api::UpstreamClient;
use hearth_api::websocket::{ConnectorConfig, EventStreamHandle, UpstreamEvent};

use crate::authz::CommandPipeline;
use crate::config::GatewayConfig;
use crate::directory::{AuditSink, TokenDirectory};
use crate::error::GatewayError;
use crate::model::{CallerInfo, CommandRequest, GuestEvent, TokenRecord};
use crate::rate_limit::RateLimiter;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::state_cache::StateCache;
use crate::token::{TokenRejection, validate_token};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// The guest-facing gateway core.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<SubscriptionRegistry>,
    limiter: Arc<RateLimiter>,
    pipeline: CommandPipeline,
    states: StateCache,
    upstream: Arc<UpstreamClient>,
    directory: Arc<dyn TokenDirectory>,
    connector: Mutex<Option<EventStreamHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Wire up a gateway from configuration and its external
    /// collaborators. Does not touch the network -- call
    /// [`start()`](Self::start) to connect.
    pub fn new(
        config: GatewayConfig,
        directory: Arc<dyn TokenDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, GatewayError> {
        let upstream = Arc::new(
            UpstreamClient::new(
                config.upstream_url.clone(),
                &config.credential,
                config.http_timeout,
            )
            .map_err(|e| GatewayError::Config {
                message: e.to_string(),
            })?,
        );

        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&directory),
            config.queue_capacity,
        ));
        let limiter = Arc::new(RateLimiter::new());

        let pipeline = CommandPipeline::new(
            Arc::clone(&limiter),
            Arc::clone(&directory),
            Arc::clone(&upstream) as Arc<dyn crate::directory::ServiceCaller>,
            audit,
            config.allowed_services.clone(),
            config.forbidden_data_keys.clone(),
            config.command_rpm,
        );

        let states = StateCache::new(Arc::clone(&upstream), config.state_cache_ttl);

        Ok(Self {
            config,
            registry,
            limiter,
            pipeline,
            states,
            upstream,
            directory,
            connector: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Validate upstream connectivity, then spawn the event connector,
    /// its fan-out bridge, and the rate-limiter cleanup task.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.upstream
            .validate_connectivity()
            .await
            .map_err(GatewayError::from)?;

        let mut connector_config = ConnectorConfig::new(
            self.config.upstream_url.clone(),
            self.config.credential.clone(),
        );
        connector_config.backoff_initial = self.config.backoff_initial;
        connector_config.backoff_max = self.config.backoff_max;
        connector_config.ping_interval = self.config.ping_interval;

        let handle = EventStreamHandle::spawn(connector_config);
        let events = handle.subscribe();

        let bridge = tokio::spawn(bridge_task(
            events,
            Arc::clone(&self.registry),
            self.cancel.clone(),
        ));

        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        let cleanup = tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => limiter.cleanup().await,
                }
            }
        });

        *self.connector.lock().await = Some(handle);
        self.tasks.lock().await.extend([bridge, cleanup]);
        info!("gateway started");
        Ok(())
    }

    /// Stop background tasks, waiting a bounded grace period for each;
    /// anything still running past the deadline is abandoned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.connector.lock().await.take() {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("background task did not stop within grace period, abandoning");
            }
        }
        info!("gateway stopped");
    }

    /// True iff the upstream event connection is established and
    /// streaming. Used by the external health check.
    pub async fn is_healthy(&self) -> bool {
        self.connector
            .lock()
            .await
            .as_ref()
            .is_some_and(EventStreamHandle::is_healthy)
    }

    // ── Guest surface ────────────────────────────────────────────────

    /// Open an event stream for a token.
    pub async fn subscribe(&self, token_id: &str) -> Result<Subscription, GatewayError> {
        Ok(self.registry.subscribe(token_id).await?)
    }

    /// Close one event stream.
    pub async fn unsubscribe(&self, token_id: &str, subscription_id: Uuid) {
        self.registry.unsubscribe(token_id, subscription_id).await;
    }

    /// Authorize and forward one guest command.
    pub async fn handle_command(
        &self,
        token_id: &str,
        request: &CommandRequest,
        caller_info: &CallerInfo,
    ) -> Result<Value, GatewayError> {
        self.pipeline.execute(token_id, request, caller_info).await
    }

    /// The token's current entity states, backfilled with
    /// `unavailable` placeholders for entities the upstream doesn't
    /// report.
    pub async fn guest_states(
        &self,
        token_id: &str,
    ) -> Result<HashMap<String, Value>, GatewayError> {
        let entities = self.directory.get_entity_ids(token_id).await?;
        Ok(self.states.states_for(&entities).await?)
    }

    /// Fetch and validate a token: existence, revocation, expiry, and
    /// the optional IP allowlist.
    pub async fn check_token(
        &self,
        token_id: &str,
        client_ip: Option<&str>,
    ) -> Result<TokenRecord, GatewayError> {
        let token = self.directory.get_token(token_id).await?;
        let Some(token) = token else {
            return Err(GatewayError::TokenRejected(TokenRejection::NotFound));
        };
        validate_token(&token, client_ip).map_err(GatewayError::TokenRejected)?;
        Ok(token)
    }

    // ── Control surface (admin-side collaborators) ───────────────────

    /// Signal that a token's entity list changed in the external store.
    pub async fn invalidate_entities(&self, token_id: &str) {
        self.registry.invalidate_entity_cache(token_id).await;
    }

    /// Tell a token's live streams that the token expired.
    pub async fn broadcast_token_expired(&self, token_id: &str) {
        self.registry.broadcast_token_expired(token_id).await;
    }
}

// ── Event bridge ─────────────────────────────────────────────────────

/// Convert upstream connector events into registry calls.
///
/// Fan-out for each state change runs as its own supervised task in a
/// `JoinSet` -- one slow fan-out never stalls event intake, and every
/// completion is observed so failures are logged rather than lost.
async fn bridge_task(
    mut events: broadcast::Receiver<UpstreamEvent>,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
) {
    let mut fanouts: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(result) = fanouts.join_next(), if !fanouts.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "fan-out task failed");
                }
            }
            received = events.recv() => {
                match received {
                    Ok(UpstreamEvent::Connected) => {
                        debug!("upstream stream (re)connected, telling subscribers to refetch");
                        registry.broadcast_all(GuestEvent::Reconnected).await;
                    }
                    Ok(UpstreamEvent::StateChange { entity_id, state }) => {
                        let registry = Arc::clone(&registry);
                        fanouts.spawn(async move {
                            registry.fan_out(&entity_id, &state).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bridge lagged behind the upstream stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fanouts.shutdown().await;
    debug!("event bridge exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use url::Url;

    use crate::directory::{AuditRecord, DirectoryError};
    use crate::error::CommandDenied;
    use crate::model::NEVER_EXPIRES_SECONDS;

    #[derive(Default)]
    struct FakeDirectory {
        entities: StdMutex<HashMap<String, HashSet<String>>>,
        tokens: StdMutex<HashMap<String, TokenRecord>>,
    }

    impl FakeDirectory {
        fn grant(&self, token_id: &str, entity_ids: &[&str]) {
            self.entities.lock().unwrap().insert(
                token_id.to_owned(),
                entity_ids.iter().map(|s| (*s).to_owned()).collect(),
            );
        }

        fn insert_token(&self, token: TokenRecord) {
            self.tokens
                .lock()
                .unwrap()
                .insert(token.id.clone(), token);
        }
    }

    #[async_trait]
    impl TokenDirectory for FakeDirectory {
        async fn get_entity_ids(
            &self,
            token_id: &str,
        ) -> Result<HashSet<String>, DirectoryError> {
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
            token_id: &str,
        ) -> Result<Option<TokenRecord>, DirectoryError> {
            Ok(self.tokens.lock().unwrap().get(token_id).cloned())
        }
    }

    struct NullAudit;

    #[async_trait]
    impl AuditSink for NullAudit {
        async fn record(&self, _record: AuditRecord) {}
    }

    fn gateway_with(directory: Arc<FakeDirectory>) -> Gateway {
        let config = GatewayConfig::new(
            Url::parse("http://127.0.0.1:1").unwrap(),
            SecretString::from("test-token".to_owned()),
        );
        Gateway::new(config, directory, Arc::new(NullAudit)).unwrap()
    }

    #[tokio::test]
    async fn not_started_gateway_is_unhealthy() {
        let dir = Arc::new(FakeDirectory::default());
        let gateway = gateway_with(dir);
        assert!(!gateway.is_healthy().await);
    }

    #[tokio::test]
    async fn stale_fanout_cache_never_grants_authorization() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.a"]);
        let gateway = gateway_with(Arc::clone(&dir));

        // Subscribing caches light.a for fan-out.
        let sub = gateway.subscribe("tok").await.unwrap();

        // The store then drops the entity -- but nobody invalidated the
        // fan-out cache yet. Authorization must consult the live list.
        dir.grant("tok", &[]);

        let request = CommandRequest {
            entity_id: "light.a".into(),
            service: "turn_on".into(),
            data: serde_json::Map::new(),
        };
        let result = gateway
            .handle_command("tok", &request, &CallerInfo::default())
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Denied(CommandDenied::EntityNotAllowed))
        ));

        gateway.unsubscribe("tok", sub.id).await;
    }

    #[tokio::test]
    async fn check_token_rejects_unknown_and_expired() {
        let dir = Arc::new(FakeDirectory::default());
        dir.insert_token(TokenRecord {
            id: "expired".into(),
            entity_ids: HashSet::new(),
            revoked: false,
            expires_at: 1,
            ip_allowlist: None,
        });
        dir.insert_token(TokenRecord {
            id: "good".into(),
            entity_ids: HashSet::new(),
            revoked: false,
            expires_at: NEVER_EXPIRES_SECONDS,
            ip_allowlist: None,
        });
        let gateway = gateway_with(dir);

        assert!(matches!(
            gateway.check_token("missing", None).await,
            Err(GatewayError::TokenRejected(TokenRejection::NotFound))
        ));
        assert!(matches!(
            gateway.check_token("expired", None).await,
            Err(GatewayError::TokenRejected(TokenRejection::ExpiredOrRevoked))
        ));
        assert!(gateway.check_token("good", None).await.is_ok());
    }

    #[tokio::test]
    async fn bridge_converts_connector_events_to_guest_events() {
        let dir = Arc::new(FakeDirectory::default());
        dir.grant("tok", &["light.a"]);
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&dir) as Arc<dyn TokenDirectory>,
            8,
        ));
        let mut sub = registry.subscribe("tok").await.unwrap();

        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let bridge = tokio::spawn(bridge_task(rx, Arc::clone(&registry), cancel.clone()));

        tx.send(UpstreamEvent::Connected).unwrap();
        tx.send(UpstreamEvent::StateChange {
            entity_id: "light.a".into(),
            state: Arc::new(json!({ "state": "on" })),
        })
        .unwrap();
        // Outside the allowlist: filtered by the registry.
        tx.send(UpstreamEvent::StateChange {
            entity_id: "lock.other".into(),
            state: Arc::new(json!({ "state": "locked" })),
        })
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, GuestEvent::Reconnected);

        let second = tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            second,
            GuestEvent::StateChange { ref entity_id, .. } if entity_id == "light.a"
        ));

        // Nothing else arrives for the filtered entity.
        let nothing =
            tokio::time::timeout(Duration::from_millis(200), sub.events.recv()).await;
        assert!(nothing.is_err());

        cancel.cancel();
        bridge.await.unwrap();
    }
}
