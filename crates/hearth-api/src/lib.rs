// hearth-api: Async Rust client for the Home Assistant REST and WebSocket APIs

pub mod error;
pub mod rest;
pub mod websocket;

pub use error::Error;
pub use rest::UpstreamClient;
pub use websocket::{ConnectionState, ConnectorConfig, EventStreamHandle, UpstreamEvent};
