// ── Core domain types ──
//
// Guest-facing events, command requests, and the read-only token view
// shared with the external store. Everything here is plain data; the
// behavior lives in the registry and the authorization pipeline.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel expiry for tokens that never expire (2099-12-31T00:00:00Z).
pub const NEVER_EXPIRES_SECONDS: i64 = 4_102_444_800;

// ── GuestEvent ──────────────────────────────────────────────────────

/// An event delivered to guest subscribers. Immutable once built.
///
/// Serializes with a `type` tag so the transport layer can forward it
/// verbatim (`{"type":"state_change","entity_id":...,"state":...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestEvent {
    /// An entity the subscriber's token owns changed state.
    StateChange { entity_id: String, state: Value },
    /// The subscriber's token expired or was revoked; the stream ends.
    TokenExpired,
    /// The upstream connection was re-established. Prior ordering is
    /// void -- clients must refetch full state.
    Reconnected,
}

// ── CommandRequest ──────────────────────────────────────────────────

/// A guest's proposed service call, prior to authorization.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    /// Target entity, e.g. `"light.living_room"`.
    pub entity_id: String,
    /// `domain.service` or bare `service`, e.g. `"light.turn_on"` or
    /// `"turn_on"`.
    pub service: String,
    /// Additional service data. Scrubbed before forwarding.
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

// ── TokenRecord ─────────────────────────────────────────────────────

/// Read-only view of a token row from the external store. The core
/// never persists these; it only reads them and receives invalidation
/// signals when they change.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: String,
    /// Entities this token may see and control.
    pub entity_ids: HashSet<String>,
    pub revoked: bool,
    /// Unix seconds.
    pub expires_at: i64,
    /// CIDR blocks the caller's IP must match. `None` disables
    /// IP pinning entirely.
    pub ip_allowlist: Option<Vec<String>>,
}

// ── CallerInfo ──────────────────────────────────────────────────────

/// Request metadata carried into the audit trail.
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

// ── Entity helpers ──────────────────────────────────────────────────

/// Category prefix of an entity id: `"light"` for `"light.kitchen"`.
/// Ids without a separator are their own domain.
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or(entity_id)
}
