// ── Gateway runtime configuration ──
//
// Tuning and policy for a single gateway instance. Built by
// hearth-config (or directly by tests) and handed to `Gateway::new` --
// the core never reads config files.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// Configuration for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream base URL (e.g. `http://homeassistant.local:8123`).
    /// The event socket URL is derived from it.
    pub upstream_url: Url,
    /// Long-lived upstream access token.
    pub credential: SecretString,
    /// REST request timeout.
    pub http_timeout: Duration,
    /// Per-subscriber event queue capacity. Full queues drop events.
    pub queue_capacity: usize,
    /// WebSocket ping interval.
    pub ping_interval: Duration,
    /// Reconnect backoff: first delay, doubled per failure up to the cap.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Per-token command budget, requests per rolling minute.
    pub command_rpm: usize,
    /// Entity domain -> services guests may invoke on it.
    pub allowed_services: HashMap<String, HashSet<String>>,
    /// Payload keys stripped before forwarding upstream.
    pub forbidden_data_keys: HashSet<String>,
    /// How long a fetched state snapshot stays fresh.
    pub state_cache_ttl: Duration,
}

impl GatewayConfig {
    /// Defaults for everything except the upstream address and credential.
    pub fn new(upstream_url: Url, credential: SecretString) -> Self {
        Self {
            upstream_url,
            credential,
            http_timeout: Duration::from_secs(10),
            queue_capacity: 64,
            ping_interval: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            command_rpm: 30,
            allowed_services: default_allowed_services(),
            forbidden_data_keys: default_forbidden_data_keys(),
            state_cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Services guests are permitted to call, keyed by entity domain.
///
/// Domains that execute arbitrary user-defined automation logic
/// (script, scene, automation) are never present here -- they could
/// bypass entity scoping entirely.
pub fn default_allowed_services() -> HashMap<String, HashSet<String>> {
    let table: [(&str, &[&str]); 8] = [
        ("light", &["turn_on", "turn_off", "toggle"]),
        ("switch", &["turn_on", "turn_off", "toggle"]),
        ("input_boolean", &["turn_on", "turn_off", "toggle"]),
        (
            "climate",
            &["set_temperature", "set_hvac_mode", "turn_on", "turn_off"],
        ),
        ("lock", &["lock", "unlock"]),
        (
            "media_player",
            &[
                "media_play",
                "media_pause",
                "media_stop",
                "volume_set",
                "media_play_pause",
                "turn_on",
                "turn_off",
            ],
        ),
        ("cover", &["open_cover", "close_cover", "stop_cover"]),
        ("fan", &["turn_on", "turn_off", "toggle", "set_percentage"]),
    ];

    table
        .into_iter()
        .map(|(domain, services)| {
            (
                domain.to_owned(),
                services.iter().map(|s| (*s).to_owned()).collect(),
            )
        })
        .collect()
}

/// Payload keys that could redirect a command away from the validated
/// entity if forwarded upstream.
pub fn default_forbidden_data_keys() -> HashSet<String> {
    ["entity_id", "device_id", "area_id", "floor_id"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
