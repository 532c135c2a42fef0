//! Streaming feed connection manager
//!
//! Lifecycle:
//! 1. Credential exchange: GET the discovery URL with the bearer token, which
//!    returns the WebSocket endpoint (`websocketUrl`).
//! 2. Connect to that endpoint and read frames. Frames tagged with the
//!    monitored event type are forwarded to the pipeline channel.
//! 3. On close or transport error, reconnect with exponential backoff
//!    (`base_delay * 2^(attempt-1)`) until `max_attempts` is reached, then
//!    give up and report it through [`FeedStatus`].
//!
//! The run loop owns connection progress. [`FeedHandle`] reads it, and its
//! `disconnect()` clears the endpoint and state directly so teardown also
//! holds after the loop has stopped (ceiling reached, pipeline gone).

use crate::domain::types::{ConnectionState, FeedStatus, RawEvent};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Log a failed reconnect cycle (cold path)
#[cold]
fn log_reconnect_failed(attempt: u32, e: &anyhow::Error) {
    error!(attempt = attempt, error = %format!("{e:#}"), "feed_reconnect_failed");
}

/// Log transport error (cold path)
#[cold]
fn log_transport_error(e: &anyhow::Error) {
    error!(error = %format!("{e:#}"), "feed_transport_error");
}

/// Resolves once teardown has been requested
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("credential exchange failed: {0:#}")]
    Discovery(anyhow::Error),
}

/// Credential exchange and socket setup
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Exchange credentials for a streaming endpoint URL
    async fn discover(&self) -> anyhow::Result<String>;

    /// Open the streaming connection
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Box<dyn FeedTransport>>;
}

/// An open streaming connection
#[async_trait]
pub trait FeedTransport: Send {
    /// Next text frame; `None` once the peer closed the connection
    async fn next_frame(&mut self) -> Option<anyhow::Result<String>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for exchange + connect
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Result of inspecting one inbound frame
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    Event(RawEvent),
    Ignored(Option<String>),
    Malformed(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTag {
    #[serde(default)]
    event_type: Option<String>,
}

/// Parse a frame and decide whether it carries a monitored event
pub fn classify_frame(text: &str, monitored_type: &str) -> FrameOutcome {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return FrameOutcome::Malformed(e.to_string()),
    };

    let tag = match EventTag::deserialize(&value) {
        Ok(tag) => tag.event_type,
        Err(e) => return FrameOutcome::Malformed(e.to_string()),
    };
    if tag.as_deref() != Some(monitored_type) {
        return FrameOutcome::Ignored(tag);
    }

    match serde_json::from_value::<RawEvent>(value) {
        Ok(event) => FrameOutcome::Event(event),
        Err(e) => FrameOutcome::Malformed(e.to_string()),
    }
}

#[derive(Debug, Default)]
struct FeedState {
    state: ConnectionState,
    reconnect_attempts: u32,
    /// Endpoint from the last credential exchange; cleared on disconnect
    endpoint: Option<String>,
    gave_up: bool,
}

/// Cloneable read/teardown access to a running feed
#[derive(Clone)]
pub struct FeedHandle {
    state: Arc<RwLock<FeedState>>,
    cancel: Arc<watch::Sender<bool>>,
    max_attempts: u32,
}

impl FeedHandle {
    pub fn status(&self) -> FeedStatus {
        let state = self.state.read();
        FeedStatus {
            is_connected: state.state == ConnectionState::Connected,
            state: state.state,
            reconnect_attempts: state.reconnect_attempts,
            max_reconnect_attempts: self.max_attempts,
            gave_up: state.gave_up,
        }
    }

    /// Request teardown: close the socket, drop the endpoint, cancel any
    /// pending reconnect. Safe to call repeatedly.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.write();
            state.state = ConnectionState::Disconnected;
            state.endpoint = None;
        }
        let already = self.cancel.send_replace(true);
        if already {
            debug!("feed_disconnect_already_requested");
        } else {
            info!("feed_disconnect_requested");
        }
    }

    pub fn endpoint(&self) -> Option<String> {
        self.state.read().endpoint.clone()
    }
}

enum SessionEnd {
    Closed,
    Errored,
    Cancelled,
    PipelineClosed,
}

pub struct FeedManager<C> {
    connector: C,
    policy: ReconnectPolicy,
    event_type: String,
    state: Arc<RwLock<FeedState>>,
    cancel: Arc<watch::Sender<bool>>,
    metrics: Arc<Metrics>,
}

impl<C: FeedConnector> FeedManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy, event_type: &str, metrics: Arc<Metrics>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            connector,
            policy,
            event_type: event_type.to_string(),
            state: Arc::new(RwLock::new(FeedState::default())),
            cancel: Arc::new(cancel),
            metrics,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            max_attempts: self.policy.max_attempts,
        }
    }

    pub fn status(&self) -> FeedStatus {
        self.handle().status()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.write().state = next;
    }

    /// Startup: credential exchange is fatal on failure; a failed connect is
    /// not, and leaves the first reconnect to [`run`](Self::run).
    pub async fn initialize(&self) -> Result<Option<Box<dyn FeedTransport>>, FeedError> {
        self.set_state(ConnectionState::Connecting);
        let endpoint = match self.connector.discover().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(error = %format!("{e:#}"), "feed_initialize_failed");
                return Err(FeedError::Discovery(e));
            }
        };
        info!("feed_endpoint_retrieved");
        self.state.write().endpoint = Some(endpoint.clone());

        match tokio::time::timeout(self.policy.connect_timeout, self.connector.connect(&endpoint)).await {
            Ok(Ok(transport)) => Ok(Some(transport)),
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "feed_initial_connect_failed");
                self.set_state(ConnectionState::Disconnected);
                Ok(None)
            }
            Err(_) => {
                warn!(timeout_ms = self.policy.connect_timeout.as_millis() as u64, "feed_initial_connect_timeout");
                self.set_state(ConnectionState::Disconnected);
                Ok(None)
            }
        }
    }

    /// Credential exchange plus connect, bounded by the connect timeout
    async fn establish(&self) -> anyhow::Result<Box<dyn FeedTransport>> {
        let attempt = async {
            let endpoint = self.connector.discover().await?;
            self.state.write().endpoint = Some(endpoint.clone());
            self.connector.connect(&endpoint).await
        };
        match tokio::time::timeout(self.policy.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("connect timed out after {:?}", self.policy.connect_timeout),
        }
    }

    /// Claim the next reconnect slot, or `None` once the ceiling is reached
    fn next_reconnect_delay(&self) -> Option<(u32, Duration)> {
        let mut state = self.state.write();
        if state.reconnect_attempts >= self.policy.max_attempts {
            state.gave_up = true;
            return None;
        }
        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        Some((attempt, reconnect_delay(self.policy.base_delay, attempt)))
    }

    fn teardown(&self) {
        let mut state = self.state.write();
        state.state = ConnectionState::Disconnected;
        state.endpoint = None;
        info!("feed_disconnected");
    }

    /// Drive the connection until `disconnect()` is requested, the pipeline
    /// goes away, or the reconnect ceiling is reached.
    pub async fn run(
        &self,
        initial: Option<Box<dyn FeedTransport>>,
        event_tx: mpsc::Sender<RawEvent>,
    ) {
        let mut cancel = self.cancel.subscribe();
        let mut transport = initial;

        loop {
            if *cancel.borrow() {
                if let Some(mut t) = transport.take() {
                    t.close().await;
                }
                self.teardown();
                return;
            }

            if let Some(mut t) = transport.take() {
                {
                    let mut state = self.state.write();
                    state.state = ConnectionState::Connected;
                    state.reconnect_attempts = 0;
                    state.gave_up = false;
                }
                info!(event_type = %self.event_type, "feed_connected");

                match self.read_frames(t.as_mut(), &event_tx, &mut cancel).await {
                    SessionEnd::Cancelled | SessionEnd::PipelineClosed => {
                        t.close().await;
                        self.teardown();
                        return;
                    }
                    SessionEnd::Closed | SessionEnd::Errored => {
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }

            let Some((attempt, delay)) = self.next_reconnect_delay() else {
                error!(max_attempts = self.policy.max_attempts, "feed_max_reconnect_attempts_reached");
                self.set_state(ConnectionState::Disconnected);
                return;
            };
            info!(
                attempt = attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "feed_reconnect_scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut cancel) => {
                    self.teardown();
                    return;
                }
            }

            self.metrics.record_reconnect();
            self.set_state(ConnectionState::Connecting);
            tokio::select! {
                result = self.establish() => match result {
                    Ok(t) => transport = Some(t),
                    Err(e) => {
                        log_reconnect_failed(attempt, &e);
                        self.set_state(ConnectionState::Disconnected);
                    }
                },
                _ = cancelled(&mut cancel) => {
                    self.teardown();
                    return;
                }
            }
        }
    }

    async fn read_frames(
        &self,
        transport: &mut dyn FeedTransport,
        event_tx: &mpsc::Sender<RawEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        // Rate-limit drop warnings to 1 per second
        let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

        loop {
            let frame = tokio::select! {
                frame = transport.next_frame() => frame,
                _ = cancelled(cancel) => return SessionEnd::Cancelled,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    log_transport_error(&e);
                    return SessionEnd::Errored;
                }
                None => {
                    warn!("feed_connection_closed");
                    return SessionEnd::Closed;
                }
            };

            self.metrics.record_frame_received();
            match classify_frame(&text, &self.event_type) {
                FrameOutcome::Event(event) => {
                    info!(
                        device_id = %event.device_label(),
                        last_seen = %event.last_seen.as_deref().unwrap_or(""),
                        rssi = ?event.rssi,
                        "feed_event_received"
                    );
                    match event_tx.try_send(event) {
                        Ok(()) => self.metrics.record_event_forwarded(),
                        Err(TrySendError::Full(_)) => {
                            self.metrics.record_event_dropped();
                            if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                warn!("feed_event_dropped: channel full");
                                last_drop_warn = Instant::now();
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("feed_pipeline_channel_closed");
                            return SessionEnd::PipelineClosed;
                        }
                    }
                }
                FrameOutcome::Ignored(event_type) => {
                    self.metrics.record_frame_ignored();
                    debug!(event_type = ?event_type, "feed_event_ignored");
                }
                FrameOutcome::Malformed(reason) => {
                    self.metrics.record_frame_malformed();
                    warn!(error = %reason, "feed_frame_malformed");
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryResponse {
    #[serde(default)]
    websocket_url: Option<String>,
}

/// Production connector: reqwest for the exchange, tokio-tungstenite for the socket
pub struct WsFeedConnector {
    client: reqwest::Client,
    discovery_url: String,
    access_token: String,
}

impl WsFeedConnector {
    pub fn new(discovery_url: &str, access_token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            discovery_url: discovery_url.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[async_trait]
impl FeedConnector for WsFeedConnector {
    async fn discover(&self) -> anyhow::Result<String> {
        let response = self
            .client
            .get(&self.discovery_url)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .send()
            .await?
            .error_for_status()?;

        let body: DiscoveryResponse = response.json().await?;
        match body.websocket_url.filter(|url| !url.is_empty()) {
            Some(url) => Ok(url),
            None => anyhow::bail!("discovery response has no websocketUrl"),
        }
    }

    async fn connect(&self, endpoint: &str) -> anyhow::Result<Box<dyn FeedTransport>> {
        let mut request = endpoint.into_client_request()?;
        request.headers_mut().insert(AUTHORIZATION, HeaderValue::from_str(&self.bearer())?);

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(status = %response.status().as_u16(), "feed_handshake_complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn next_frame(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(anyhow::Error::from));
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "feed_close_frame");
                    return None;
                }
                // Pings are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "feed_close_error");
        }
    }
}
