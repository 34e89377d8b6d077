//! Shared configuration for hearth deployments.
//!
//! TOML file + environment overlay, credential resolution (env var +
//! keyring + plaintext), and translation to
//! `hearth_core::GatewayConfig`. The core crates never read config
//! files -- whatever hosts the gateway loads a [`Config`] here and
//! hands the result in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hearth_core::GatewayConfig;
use hearth_core::config::{default_allowed_services, default_forbidden_data_keys};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no upstream credential configured")]
    NoCredentials,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Upstream connection settings.
    #[serde(default)]
    pub upstream: UpstreamSection,

    /// Gateway tuning.
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Optional override of the domain -> services allowlist. Absent
    /// means the built-in table.
    #[serde(default)]
    pub allowed_services: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpstreamSection {
    /// Upstream base URL (e.g. "http://homeassistant.local:8123").
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Access token (plaintext -- prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable name containing the access token.
    pub token_env: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            token: None,
            token_env: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewaySection {
    /// Per-token command budget, requests per rolling minute.
    #[serde(default = "default_command_rpm")]
    pub command_rpm: usize,

    /// Per-subscriber event queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// WebSocket ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Reconnect backoff bounds in seconds.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// State snapshot cache TTL in seconds.
    #[serde(default = "default_state_cache_ttl")]
    pub state_cache_ttl_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            command_rpm: default_command_rpm(),
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            state_cache_ttl_secs: default_state_cache_ttl(),
        }
    }
}

fn default_upstream_url() -> String {
    "http://homeassistant.local:8123".into()
}
fn default_timeout() -> u64 {
    10
}
fn default_command_rpm() -> usize {
    30
}
fn default_queue_capacity() -> usize {
    64
}
fn default_ping_interval() -> u64 {
    30
}
fn default_backoff_initial() -> u64 {
    2
}
fn default_backoff_max() -> u64 {
    60
}
fn default_state_cache_ttl() -> u64 {
    30
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "hearth", "hearth").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hearth");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from an explicit file + environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HEARTH_").split("_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the upstream access token: named env var, then system
/// keyring, then plaintext config.
pub fn resolve_credential(config: &Config) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = config.upstream.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(entry) = keyring::Entry::new("hearth", "upstream/token") {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(ref token) = config.upstream.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials)
}

// ── Translation to GatewayConfig ────────────────────────────────────

/// Build a validated `GatewayConfig` from the loaded TOML.
pub fn to_gateway_config(config: &Config) -> Result<GatewayConfig, ConfigError> {
    let url: url::Url = config
        .upstream
        .url
        .parse()
        .map_err(|_| ConfigError::Validation {
            field: "upstream.url".into(),
            reason: format!("invalid URL: {}", config.upstream.url),
        })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation {
            field: "upstream.url".into(),
            reason: format!("expected http or https, got '{}'", url.scheme()),
        });
    }

    let credential = resolve_credential(config)?;

    let allowed_services = match &config.allowed_services {
        Some(table) => table
            .iter()
            .map(|(domain, services)| {
                (domain.clone(), services.iter().cloned().collect())
            })
            .collect(),
        None => default_allowed_services(),
    };

    let mut gateway = GatewayConfig::new(url, credential);
    gateway.http_timeout = Duration::from_secs(config.upstream.timeout_secs);
    gateway.command_rpm = config.gateway.command_rpm;
    gateway.queue_capacity = config.gateway.queue_capacity;
    gateway.ping_interval = Duration::from_secs(config.gateway.ping_interval_secs);
    gateway.backoff_initial = Duration::from_secs(config.gateway.backoff_initial_secs);
    gateway.backoff_max = Duration::from_secs(config.gateway.backoff_max_secs);
    gateway.state_cache_ttl = Duration::from_secs(config.gateway.state_cache_ttl_secs);
    gateway.allowed_services = allowed_services;
    gateway.forbidden_data_keys = default_forbidden_data_keys();

    Ok(gateway)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(&path, toml_str)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
