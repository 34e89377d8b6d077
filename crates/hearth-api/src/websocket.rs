//! WebSocket event connector with auto-reconnect.
//!
//! Maintains the single persistent connection to the upstream
//! home-automation event bus: performs the auth handshake, subscribes
//! to `state_changed` events, and republishes them through a
//! [`tokio::sync::broadcast`] channel. Network failures reconnect with
//! exponential backoff; a rejected credential halts the connector
//! permanently -- a bad token is a configuration error, not an outage.
//!
//! # Example
//!
//! ```rust,ignore
//! use hearth_api::websocket::{ConnectorConfig, EventStreamHandle, UpstreamEvent};
//!
//! let config = ConnectorConfig::new(base_url, credential);
//! let handle = EventStreamHandle::spawn(config);
//! let mut rx = handle.subscribe();
//!
//! while let Ok(event) = rx.recv().await {
//!     match event {
//!         UpstreamEvent::Connected => refetch_everything(),
//!         UpstreamEvent::StateChange { entity_id, .. } => println!("{entity_id}"),
//!     }
//! }
//!
//! handle.shutdown(std::time::Duration::from_secs(5)).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the upstream connection, observable through a `watch`
/// channel on the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    /// The upstream rejected our credential during the handshake.
    /// Terminal: retrying would hammer a misconfigured token forever.
    /// Requires operator intervention and a restart.
    AuthFailedPermanent,
}

// ── UpstreamEvent ────────────────────────────────────────────────────

/// An event republished from the upstream stream.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// The connector (re)entered `Streaming`. Consumers must treat
    /// prior event ordering as void and refetch full state -- events
    /// may have been missed while disconnected.
    Connected,
    /// An entity changed state. `state` is the full new-state object.
    StateChange {
        entity_id: String,
        state: Arc<Value>,
    },
}

// ── ConnectorConfig ──────────────────────────────────────────────────

/// Connection and reconnect tuning.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Upstream HTTP(S) base URL; the socket URL is derived from it.
    pub base_url: Url,
    /// Long-lived access token sent during the auth handshake.
    pub credential: SecretString,
    /// Delay before the first reconnection attempt. Default: 2s.
    pub backoff_initial: Duration,
    /// Upper bound on backoff delay. Default: 60s.
    pub backoff_max: Duration,
    /// Interval between client pings while streaming. Default: 30s.
    pub ping_interval: Duration,
}

impl ConnectorConfig {
    pub fn new(base_url: Url, credential: SecretString) -> Self {
        Self {
            base_url,
            credential,
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
        }
    }
}

// ── EventStreamHandle ────────────────────────────────────────────────

/// Handle to the running connector task.
pub struct EventStreamHandle {
    events: broadcast::Sender<UpstreamEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl EventStreamHandle {
    /// Spawn the connector loop. Returns immediately; the first
    /// connection attempt happens asynchronously.
    pub fn spawn(config: ConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(connector_loop(
            config,
            events.clone(),
            state_tx,
            cancel.clone(),
        ));

        Self {
            events,
            state: state_rx,
            cancel,
            task,
        }
    }

    /// Get a new broadcast receiver for the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    /// Observe connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True iff the connector is streaming and its task is alive.
    pub fn is_healthy(&self) -> bool {
        *self.state.borrow() == ConnectionState::Streaming && !self.task.is_finished()
    }

    /// Cancel the connector and wait up to `grace` for it to stop.
    /// Past the deadline the task is abandoned rather than hung on.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            tracing::warn!(
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "event connector did not stop within grace period, abandoning"
            );
        }
    }
}

// ── Connector loop ───────────────────────────────────────────────────

/// How a single connection attempt ended.
enum SessionEnd {
    /// Credential rejected during the handshake. Permanent.
    AuthRejected,
    /// Connection dropped (handshake abandoned, subscription rejected,
    /// I/O error, close, stream end). Transient -- reconnect.
    Dropped { reached_streaming: bool },
}

async fn connector_loop(
    config: ConnectorConfig,
    events: broadcast::Sender<UpstreamEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let ws_url = match derive_ws_url(&config.base_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, base_url = %config.base_url, "cannot derive event socket URL");
            return;
        }
    };

    let mut backoff = config.backoff_initial;

    loop {
        let _ = state.send(ConnectionState::Connecting);

        let end = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            end = run_connection(&ws_url, &config, &events, &state) => end,
        };

        match end {
            SessionEnd::AuthRejected => {
                let _ = state.send(ConnectionState::AuthFailedPermanent);
                tracing::error!(
                    "upstream rejected the access token -- check the credential; not reconnecting"
                );
                return;
            }
            SessionEnd::Dropped { reached_streaming } => {
                if reached_streaming {
                    backoff = config.backoff_initial;
                }
                let _ = state.send(ConnectionState::Disconnected);
                tracing::warn!(
                    delay_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "upstream event stream dropped, reconnecting after backoff"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }

                backoff = (backoff * 2).min(config.backoff_max);
            }
        }
    }

    let _ = state.send(ConnectionState::Disconnected);
    tracing::debug!("event connector loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Dial, handshake, subscribe, then stream until the connection drops.
async fn run_connection(
    ws_url: &Url,
    config: &ConnectorConfig,
    events: &broadcast::Sender<UpstreamEvent>,
    state: &watch::Sender<ConnectionState>,
) -> SessionEnd {
    tracing::debug!(url = %ws_url, "connecting to upstream event socket");

    let mut ws = match tokio_tungstenite::connect_async(ws_url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "event socket connect failed");
            return SessionEnd::Dropped {
                reached_streaming: false,
            };
        }
    };

    // Phase 1: the server opens with an auth challenge. Anything else
    // means we're talking to the wrong endpoint -- abandon and retry.
    let Some(first) = next_text(&mut ws).await else {
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    };
    if control_type(&first).as_deref() != Some("auth_required") {
        tracing::warn!(
            got = control_type(&first).as_deref().unwrap_or("<unparseable>"),
            "expected auth_required as first message, abandoning connection"
        );
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    }

    // Phase 2: present the credential.
    let _ = state.send(ConnectionState::Authenticating);
    let auth = json!({
        "type": "auth",
        "access_token": config.credential.expose_secret(),
    });
    if ws.send(Message::text(auth.to_string())).await.is_err() {
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    }
    let Some(reply) = next_text(&mut ws).await else {
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    };
    if control_type(&reply).as_deref() != Some("auth_ok") {
        return SessionEnd::AuthRejected;
    }

    // Phase 3: subscribe to the state-change event category.
    let _ = state.send(ConnectionState::Subscribing);
    let subscribe = json!({
        "id": 1,
        "type": "subscribe_events",
        "event_type": "state_changed",
    });
    if ws.send(Message::text(subscribe.to_string())).await.is_err() {
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    }
    let Some(ack) = next_text(&mut ws).await else {
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    };
    if !subscription_accepted(&ack) {
        tracing::warn!("upstream rejected event subscription, will back off and retry");
        return SessionEnd::Dropped {
            reached_streaming: false,
        };
    }

    let _ = state.send(ConnectionState::Streaming);
    tracing::info!("upstream event stream established");

    // Exactly one Connected marker per successful cycle: subscribers
    // must refetch state they may have missed while we were down.
    let _ = events.send(UpstreamEvent::Connected);

    stream_events(ws, config, events).await;

    SessionEnd::Dropped {
        reached_streaming: true,
    }
}

/// Read frames until the connection drops, republishing state changes.
/// Sends a client ping every `ping_interval` to keep NAT mappings warm.
async fn stream_events(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &ConnectorConfig,
    events: &broadcast::Sender<UpstreamEvent>,
) {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the first real
    // ping happens one interval from now.
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Ping(tungstenite::Bytes::new())).await.is_err() {
                    return;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some((entity_id, new_state)) = parse_state_change(&text) {
                            // Broadcast send never blocks; slow consumers
                            // lag rather than stall the read loop.
                            let _ = events.send(UpstreamEvent::StateChange {
                                entity_id,
                                state: Arc::new(new_state),
                            });
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        tracing::trace!("event socket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "event socket close frame");
                        } else {
                            tracing::info!("event socket close frame (no payload)");
                        }
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "event socket read error");
                        return;
                    }
                    None => {
                        tracing::info!("event socket stream ended");
                        return;
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

/// Await the next text frame, skipping pings/pongs/binary. `None`
/// means the connection ended.
async fn next_text(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Option<String> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

// ── Message parsing ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    success: Option<bool>,
}

/// The `type` field of a control message, if the frame parses at all.
fn control_type(text: &str) -> Option<String> {
    serde_json::from_str::<ControlMessage>(text)
        .ok()
        .map(|m| m.msg_type)
}

/// A subscription ack is `{"type":"result","success":true,...}`.
fn subscription_accepted(text: &str) -> bool {
    serde_json::from_str::<ControlMessage>(text)
        .ok()
        .is_some_and(|m| m.msg_type == "result" && m.success == Some(true))
}

/// Extract `(entity_id, new_state)` from a streamed event frame.
///
/// Returns `None` for malformed JSON, non-event messages, event
/// categories other than `state_changed`, and events without a
/// `new_state` (entity removals) -- all of which are skipped silently.
fn parse_state_change(text: &str) -> Option<(String, Value)> {
    let msg: Value = serde_json::from_str(text).ok()?;
    if msg.get("type").and_then(Value::as_str) != Some("event") {
        return None;
    }
    let event = msg.get("event")?;
    if event.get("event_type").and_then(Value::as_str) != Some("state_changed") {
        return None;
    }
    let new_state = event.get("data")?.get("new_state")?;
    if new_state.is_null() {
        return None;
    }
    let entity_id = new_state.get("entity_id")?.as_str()?.to_owned();
    Some((entity_id, new_state.clone()))
}

// ── URL derivation ───────────────────────────────────────────────────

/// Derive the event socket URL from the HTTP base: `wss` iff the base
/// is `https`, path fixed at `/api/websocket`.
pub(crate) fn derive_ws_url(base: &Url) -> Result<Url, Error> {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let mut ws = base.clone();
    ws.set_scheme(scheme).map_err(|()| {
        Error::WebSocketConnect(format!("cannot derive socket scheme from {base}"))
    })?;
    let path = format!("{}/api/websocket", base.path().trim_end_matches('/'));
    ws.set_path(&path);
    Ok(ws)
}

// ── Tests ────────────────────────────────────────────────────────────
