//! Access-scoped event/command gateway between guest tokens and a
//! home-automation installation.
//!
//! This crate owns the security-critical core of the hearth workspace:
//!
//! - **[`Gateway`]** -- Explicitly constructed facade managing the full
//!   lifecycle: [`start()`](Gateway::start) validates upstream
//!   connectivity and spawns the event connector plus its bridge task,
//!   [`shutdown()`](Gateway::shutdown) cancels everything with a
//!   bounded grace period. No hidden global state -- tests build as
//!   many independent instances as they like.
//!
//! - **[`SubscriptionRegistry`]** -- Per-token live subscriber channels
//!   and the entity allowlist cache that filters fan-out. A single
//!   lock guards both maps; directory I/O always happens outside it.
//!
//! - **[`CommandPipeline`]** -- The ordered authorization policy
//!   deciding whether a guest command may reach the upstream system:
//!   rate limit, service format, live entity ownership, domain match,
//!   service allowlist, payload scrubbing.
//!
//! - **[`RateLimiter`]** -- Sliding-window admission control over a
//!   trailing 60-second interval, keyed by arbitrary strings.
//!
//! - **Collaborator seams** ([`directory`]) -- The token store, audit
//!   log, and upstream command client live behind narrow traits so the
//!   core never touches persistence.

pub mod authz;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod model;
pub mod rate_limit;
pub mod registry;
pub mod state_cache;
pub mod token;

// ── Primary re-exports ──────────────────────────────────────────────
pub use authz::CommandPipeline;
pub use config::GatewayConfig;
pub use directory::{AuditRecord, AuditSink, DirectoryError, ServiceCaller, TokenDirectory};
pub use error::{CommandDenied, GatewayError};
pub use gateway::Gateway;
pub use model::{CallerInfo, CommandRequest, GuestEvent, TokenRecord, entity_domain};
pub use rate_limit::RateLimiter;
pub use registry::{Subscription, SubscriptionRegistry};
pub use token::{TokenRejection, validate_token};
