//! Single WebSocket connection with auto-reconnect and ping keep-alive.
//!
//! Each `WsConnection` runs as a tokio task that:
//! 1. Connects to the WebSocket endpoint.
//! 2. Asks the `on_connect` hook for the frames to send first (e.g. a
//!    subscription replay) and sends them in order.
//! 3. Reads messages and forwards them to a callback.
//! 4. Sends periodic ping messages (format depends on the peer).
//! 5. Automatically reconnects on disconnection with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// Callback invoked for each received text message.
///
/// Parameters: `(connection_id, message_text)`
pub type OnMessageCallback = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// Hook invoked right after every successful (re)connect. Returns the frames
/// to send before any queued outbound traffic.
pub type OnConnectCallback = Arc<dyn Fn(usize) -> Vec<String> + Send + Sync>;

/// Callback invoked on transport state changes.
pub type OnStateCallback = Arc<dyn Fn(usize, ConnState) + Send + Sync>;

/// Transport state reported through [`OnStateCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// Ping payload format, varies by peer.
#[derive(Debug, Clone)]
pub enum PingPayload {
    /// Send a text frame (e.g. `"ping"`).
    Text(String),
    /// Send a JSON object as text (e.g. `{"op":"ping"}`).
    Json(serde_json::Value),
    /// Use the standard WebSocket ping frame.
    WebSocketPing,
}

/// Configuration for a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsConnConfig {
    /// Full WebSocket URL (e.g. `ws://127.0.0.1:3000`).
    pub url: String,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between ping messages.
    pub ping_interval: Option<Duration>,
    /// Ping message format.
    pub ping_payload: Option<PingPayload>,
    /// Connection identifier, echoed back in callbacks.
    pub id: usize,
}

impl WsConnConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extra_headers: HashMap::new(),
            ping_interval: None,
            ping_payload: None,
            id: 0,
        }
    }
}

/// Callbacks wired into the connection task.
#[derive(Clone)]
pub struct WsHandlers {
    pub on_text: OnMessageCallback,
    pub on_connect: Option<OnConnectCallback>,
    pub on_state: Option<OnStateCallback>,
}

/// A single WebSocket connection managed by a background tokio task.
pub struct WsConnection {
    /// Connection configuration.
    pub config: WsConnConfig,
    /// Channel to send outbound messages.
    outbound_tx: Option<mpsc::Sender<String>>,
    /// Shutdown signal sender.
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Task join handle.
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WsConnection {
    /// Create a new (not yet started) connection.
    pub fn new(config: WsConnConfig) -> Self {
        Self {
            config,
            outbound_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Start the connection task.
    pub fn start(&mut self, handlers: WsHandlers) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(256);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            connection_loop(config, handlers, outbound_rx, shutdown_rx).await;
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.outbound_tx = Some(outbound_tx);
        self.task = Some(task);
    }

    /// Whether [`start`](Self::start) has been called and the task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Send a text message on this connection.
    pub async fn send(&self, msg: String) -> anyhow::Result<()> {
        if let Some(tx) = &self.outbound_tx {
            tx.send(msg).await?;
        }
        Ok(())
    }

    /// Queue a text message without waiting. Fails if the queue is full or
    /// the connection was never started.
    pub fn try_send(&self, msg: String) -> Result<(), RelayError> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or_else(|| RelayError::WebSocket("connection not started".into()))?;
        tx.try_send(msg).map_err(|e| RelayError::WebSocket(format!("outbound queue: {e}")))
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.outbound_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Main connection loop: connects, replays, reads, pings, reconnects.
async fn connection_loop(
    config: WsConnConfig,
    handlers: WsHandlers,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_millis(100);
    let max_backoff = Duration::from_secs(30);
    let conn_id = config.id;
    let notify = |state: ConnState| {
        if let Some(cb) = &handlers.on_state {
            cb(conn_id, state);
        }
    };

    loop {
        if *shutdown_rx.borrow() {
            info!("[ws-{conn_id}] shutdown requested");
            return;
        }

        info!("[ws-{conn_id}] connecting to {}", config.url);

        let ws_stream = match connect_ws(&config).await {
            Ok(s) => {
                backoff = Duration::from_millis(100);
                info!("[ws-{conn_id}] connected");
                s
            }
            Err(e) => {
                error!("[ws-{conn_id}] connection failed: {e}, retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // Replay frames go out before anything queued by the caller.
        let replay = handlers.on_connect.as_ref().map(|cb| cb(conn_id)).unwrap_or_default();
        let mut replay_ok = true;
        for frame in replay {
            debug!("[ws-{conn_id}] replaying: {frame}");
            if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                error!("[ws-{conn_id}] replay send failed: {e}");
                replay_ok = false;
                break;
            }
        }
        if !replay_ok {
            notify(ConnState::Disconnected);
            continue;
        }
        notify(ConnState::Connected);

        let ping_interval = config.ping_interval.map(tokio::time::interval);

        tokio::pin! {
            let ping_tick = async {
                if let Some(mut interval) = ping_interval {
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                    }
                } else {
                    std::future::pending::<()>().await
                }
            };
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("[ws-{conn_id}] shutdown signal received");
                    let _ = ws_write.close().await;
                    notify(ConnState::Disconnected);
                    return;
                }

                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            (handlers.on_text)(conn_id, &text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("[ws-{conn_id}] received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("[ws-{conn_id}] read error: {e}");
                            break;
                        }
                        None => {
                            warn!("[ws-{conn_id}] stream ended");
                            break;
                        }
                        _ => {} // Binary, Pong, Frame: ignore
                    }
                }

                Some(msg) = outbound_rx.recv() => {
                    if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                        error!("[ws-{conn_id}] send error: {e}");
                        break;
                    }
                }

                _ = &mut ping_tick => {
                    let ping_msg = match &config.ping_payload {
                        Some(PingPayload::Text(t)) => Message::Text(t.clone().into()),
                        Some(PingPayload::Json(j)) => Message::Text(j.to_string().into()),
                        Some(PingPayload::WebSocketPing) | None => {
                            Message::Ping(vec![].into())
                        }
                    };
                    if let Err(e) = ws_write.send(ping_msg).await {
                        error!("[ws-{conn_id}] ping send error: {e}");
                        break;
                    }
                }
            }
        }

        notify(ConnState::Disconnected);
        warn!("[ws-{conn_id}] disconnected, reconnecting in {backoff:?}");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown_rx.changed() => return,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Open the WebSocket, adding any configured handshake headers.
async fn connect_ws(
    config: &WsConnConfig,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

    let mut request = config.url.as_str().into_client_request()?;
    for (key, value) in &config.extra_headers {
        request
            .headers_mut()
            .insert(HeaderName::from_bytes(key.as_bytes())?, HeaderValue::from_str(value)?);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}
