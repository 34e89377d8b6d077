// ── Transport-level error types ──
//
// Errors raised while talking to the upstream home-automation system.
// Consumers (hearth-core) translate these into domain-level variants;
// the split between transient and permanent failures lives here because
// only this crate knows what the HTTP/WebSocket layers reported.

use thiserror::Error;

/// Unified error type for the api crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream rejected credential: {message}")]
    Authentication { message: String },

    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    #[error("failed to decode upstream payload: {message}")]
    Deserialization { message: String },

    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Whether a retry has any chance of succeeding: timeouts, connect
    /// failures, and 5xx responses. Auth rejections and 4xx never do.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
