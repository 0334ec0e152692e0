//! Downstream-side client of a hub, with subscription replay.
//!
//! Every subscribe request is appended to the client's history before it is
//! transmitted. Whenever the transport (re)connects, the whole history is
//! sent again in its original order ahead of any other traffic; the hub's
//! de-duplication makes the replay idempotent. Disconnecting keeps the
//! history. Only [`SubscriptionClient::clear_history`] empties it.

use std::sync::{Arc, Mutex, MutexGuard};

use br_core::RequestType;
use br_core::error::RelayError;
use br_core::trading::OrderRequest;
use br_core::ws::{ConnState, WsConnConfig, WsConnection, WsHandlers};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{ClientMessage, ServerMessage};

/// What the client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

pub type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;
pub type ClientEventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// One recorded subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub request_type: RequestType,
    pub options: Value,
}

impl SubscriptionRequest {
    fn frame(&self) -> String {
        ClientMessage::subscribe(self.request_type, self.options.clone()).to_json()
    }
}

#[derive(Debug, Default)]
struct ClientState {
    history: Vec<SubscriptionRequest>,
    connected: bool,
}

pub struct SubscriptionClient {
    conn: WsConnection,
    state: Arc<Mutex<ClientState>>,
    events: ClientEventSender,
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubscriptionClient {
    pub fn new(config: WsConnConfig) -> (Self, ClientEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let client = Self { conn: WsConnection::new(config), state: Arc::default(), events };
        (client, rx)
    }

    /// Start the transport. Reconnects run in the background until
    /// [`disconnect`](Self::disconnect).
    pub fn connect(&mut self) {
        if self.conn.is_running() {
            return;
        }
        let on_text_events = self.events.clone();
        let replay_state = self.state.clone();
        let state_events = self.events.clone();
        let down_state = self.state.clone();

        self.conn.start(WsHandlers {
            on_text: Arc::new(move |id, text| match ServerMessage::parse(text) {
                Ok(msg) => {
                    let _ = on_text_events.send(ClientEvent::Message(msg));
                }
                Err(e) => warn!("[client-{id}] {e}"),
            }),
            // Marking the client connected and snapshotting the history
            // happen under one lock, so a concurrent add is either replayed
            // here or queued by `add_subscription`, never neither.
            on_connect: Some(Arc::new(move |id| {
                let mut state = lock(&replay_state);
                state.connected = true;
                debug!("[client-{id}] replaying {} subscriptions", state.history.len());
                state.history.iter().map(SubscriptionRequest::frame).collect()
            })),
            on_state: Some(Arc::new(move |_id, conn_state| {
                let event = match conn_state {
                    ConnState::Connected => ClientEvent::Connected,
                    ConnState::Disconnected => {
                        lock(&down_state).connected = false;
                        ClientEvent::Disconnected
                    }
                };
                let _ = state_events.send(event);
            })),
        });
    }

    /// Close the transport. History is kept for the next `connect`.
    pub async fn disconnect(&mut self) {
        self.conn.stop().await;
        lock(&self.state).connected = false;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Record a subscribe request and send it if the transport is up.
    pub fn add_subscription(&self, request_type: RequestType, options: Value) -> Result<(), RelayError> {
        let request = SubscriptionRequest { request_type, options };
        let mut state = lock(&self.state);
        let frame = request.frame();
        state.history.push(request);
        if state.connected {
            self.conn.try_send(frame)?;
        }
        Ok(())
    }

    pub fn subscribe_bars(&self, symbols: &[String], timeframe: &str) -> Result<(), RelayError> {
        self.add_subscription(
            RequestType::AddBarSubscriptions,
            json!({ "symbols": symbols, "timeframe": timeframe }),
        )
    }

    pub fn subscribe_books(&self, symbols: &[String]) -> Result<(), RelayError> {
        self.add_subscription(RequestType::AddBookSubscriptions, json!({ "symbols": symbols }))
    }

    pub fn subscribe_trades(&self, symbols: &[String]) -> Result<(), RelayError> {
        self.add_subscription(RequestType::AddTradeSubscriptions, json!({ "symbols": symbols }))
    }

    pub fn subscribe_orders(&self, symbols: &[String]) -> Result<(), RelayError> {
        self.add_subscription(RequestType::AddOrderSubscriptions, json!({ "symbols": symbols }))
    }

    pub fn subscribe_account(&self) -> Result<(), RelayError> {
        self.add_subscription(RequestType::AddAccountSubscription, json!({}))
    }

    pub fn subscribe_balance(&self) -> Result<(), RelayError> {
        self.add_subscription(RequestType::AddBalanceSubscription, json!({}))
    }

    /// Orders are not replayed; they need a live connection.
    pub fn place_order(&self, request: OrderRequest) -> Result<(), RelayError> {
        self.send_now(ClientMessage::PlaceOrder(Box::new(request)))
    }

    pub fn request_status(&self) -> Result<(), RelayError> {
        self.send_now(ClientMessage::Status)
    }

    fn send_now(&self, msg: ClientMessage) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::WebSocket("not connected".into()));
        }
        self.conn.try_send(msg.to_json())
    }

    pub fn history(&self) -> Vec<SubscriptionRequest> {
        lock(&self.state).history.clone()
    }

    pub fn clear_history(&self) {
        lock(&self.state).history.clear();
    }
}
