// ── Gateway error types ──
//
// Authorization denials are a closed set of distinct, user-visible
// outcomes -- the transport layer maps each to its own status code and
// none may ever be merged or silently retried. Upstream call failures
// are a separate class entirely: the command was *allowed*, the
// gateway just couldn't complete it.

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::token::TokenRejection;

// ── CommandDenied ───────────────────────────────────────────────────

/// Why the authorization pipeline refused a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandDenied {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid service format")]
    MalformedService,

    #[error("entity not in allowlist")]
    EntityNotAllowed,

    #[error("service domain '{service_domain}' does not match entity domain '{entity_domain}'")]
    DomainMismatch {
        service_domain: String,
        entity_domain: String,
    },

    #[error("service '{service}' not allowed for domain '{domain}'")]
    ServiceNotAllowed { service: String, domain: String },
}

// ── GatewayError ────────────────────────────────────────────────────

/// Unified error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Authorization refused the command. A client-side outcome.
    #[error(transparent)]
    Denied(#[from] CommandDenied),

    /// The presented token failed validation.
    #[error("token rejected: {0}")]
    TokenRejected(TokenRejection),

    /// The upstream call itself failed -- a server-side fault, distinct
    /// from every authorization denial.
    #[error("upstream command failed: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// The external token store failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Invalid gateway configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl From<hearth_api::Error> for GatewayError {
    fn from(err: hearth_api::Error) -> Self {
        match err {
            hearth_api::Error::Upstream { status, message } => Self::Upstream {
                status: Some(status),
                message,
            },
            other => Self::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}
