// ── External collaborator seams ──
//
// The token store, the audit log, and the upstream command client all
// live outside this crate (a record store and a REST call path in the
// reference deployment). These traits are the narrow surface the core
// consumes; implementations are injected into `Gateway::new`.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::TokenRecord;

// ── Errors ──────────────────────────────────────────────────────────

/// Opaque failure from the external token store.
#[derive(Debug, Clone, Error)]
#[error("token directory failure: {message}")]
pub struct DirectoryError {
    pub message: String,
}

impl DirectoryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ── TokenDirectory ──────────────────────────────────────────────────

/// Read access to the external token store.
#[async_trait]
pub trait TokenDirectory: Send + Sync {
    /// The entity ids a token may see and control -- always the live
    /// list. Authorization decisions must come through here, never
    /// from the fan-out cache.
    async fn get_entity_ids(&self, token_id: &str) -> Result<HashSet<String>, DirectoryError>;

    /// Full token row, or `None` for an unknown id.
    async fn get_token(&self, token_id: &str) -> Result<Option<TokenRecord>, DirectoryError>;
}

// ── AuditSink ───────────────────────────────────────────────────────

/// One successfully forwarded command.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub token_id: String,
    pub entity_id: String,
    pub service: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Append-only audit trail. Durability is the sink's problem -- command
/// results never depend on it.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

// ── ServiceCaller ───────────────────────────────────────────────────

/// The upstream command call path. The authorization pipeline hands it
/// an already-scrubbed, entity-pinned payload.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call(
        &self,
        domain: &str,
        service: &str,
        payload: &Value,
    ) -> Result<Value, hearth_api::Error>;
}

#[async_trait]
impl ServiceCaller for hearth_api::UpstreamClient {
    async fn call(
        &self,
        domain: &str,
        service: &str,
        payload: &Value,
    ) -> Result<Value, hearth_api::Error> {
        self.call_service(domain, service, payload).await
    }
}
