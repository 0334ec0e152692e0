//! Hub ⇄ connection wire messages (JSON text frames).
//!
//! Inbound:
//! - `{ "requestType": "addBarSubscriptions", "options": {...} }`
//! - `{ "event": "placeOrder", "orderRequest": {...} }`
//! - `{ "event": "status" }`
//!
//! Outbound messages carry an `event` tag, see [`ServerMessage`].

use br_core::error::RelayError;
use br_core::market_data::{Bar, MarketTrade, OrderBook};
use br_core::trading::{AccountInfo, BrokerBalance, Order, OrderExecution, OrderRequest, Position};
use br_core::{RequestType, SubscriptionEvent};
use br_oms::event::{OmsEvent, OrderEvent, PositionEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A parsed message from a downstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `request_type` is kept raw so unknown tags can be echoed back in the
    /// failure reply.
    Subscribe { request_type: String, options: Value },
    PlaceOrder(Box<OrderRequest>),
    Status,
}

impl ClientMessage {
    pub fn subscribe(request_type: RequestType, options: Value) -> Self {
        Self::Subscribe { request_type: request_type.as_str().to_string(), options }
    }

    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RelayError::Protocol(format!("invalid json: {e}")))?;

        if let Some(request_type) = value.get("requestType") {
            let request_type = request_type
                .as_str()
                .ok_or_else(|| RelayError::Protocol("requestType must be a string".into()))?;
            let options = value.get("options").cloned().unwrap_or(Value::Null);
            return Ok(Self::Subscribe { request_type: request_type.to_string(), options });
        }

        match value.get("event").and_then(Value::as_str) {
            Some("placeOrder") => {
                let raw = value
                    .get("orderRequest")
                    .cloned()
                    .ok_or_else(|| RelayError::Protocol("placeOrder without orderRequest".into()))?;
                let request: OrderRequest = serde_json::from_value(raw)
                    .map_err(|e| RelayError::Protocol(format!("bad orderRequest: {e}")))?;
                Ok(Self::PlaceOrder(Box::new(request)))
            }
            Some("status") => Ok(Self::Status),
            Some(other) => Err(RelayError::Protocol(format!("unknown event '{other}'"))),
            None => Err(RelayError::Protocol("message has neither requestType nor event".into())),
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Subscribe { request_type, options } => {
                json!({ "requestType": request_type, "options": options })
            }
            Self::PlaceOrder(request) => json!({ "event": "placeOrder", "orderRequest": request }),
            Self::Status => json!({ "event": "status" }),
        };
        value.to_string()
    }
}

/// Options payload of the per-symbol subscribe requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Result of a `placeOrder` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResult {
    pub success: bool,
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to `{ "event": "status" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub instance_id: String,
    pub connections: usize,
    pub subscriptions: Vec<Subscription>,
}

/// Message sent from the hub to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "initialize")]
    Initialize {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },

    /// `options` lists only the symbols that were new to the hub, unless
    /// none were.
    #[serde(rename = "addSubscription_success")]
    SubscriptionSuccess {
        #[serde(rename = "requestType")]
        request_type: String,
        options: Value,
    },

    #[serde(rename = "addSubscription_failed")]
    SubscriptionFailed {
        #[serde(rename = "requestType")]
        request_type: String,
        options: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "placeOrder_results")]
    PlaceOrderResults { results: PlaceOrderResult },

    #[serde(rename = "serverStatus")]
    ServerStatus(ServerStatus),

    /// A published event.
    #[serde(rename = "topic")]
    Topic { topic: String, payload: TopicPayload },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(format!("serialize: {e}")))
    }

    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(format!("bad server message: {e}")))
    }
}

/// Closed set of publishable payloads, serialized as `{ kind, data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum TopicPayload {
    Bar(Bar),
    Book(OrderBook),
    Trade(MarketTrade),
    OrderExecution(OrderExecution),
    OrderUpdate(Order),
    OrderFinished(Order),
    Position(Position),
    AccountInfo(AccountInfo),
    BrokerBalance(BrokerBalance),
}

impl TopicPayload {
    /// Back to an upstream event, for relaying. OMS-derived payloads have no
    /// upstream counterpart.
    pub fn into_subscription_event(self) -> Option<SubscriptionEvent> {
        match self {
            Self::Bar(b) => Some(SubscriptionEvent::Bar(b)),
            Self::Book(b) => Some(SubscriptionEvent::Book(b)),
            Self::Trade(t) => Some(SubscriptionEvent::Trade(t)),
            Self::OrderExecution(e) => Some(SubscriptionEvent::OrderExecution(e)),
            Self::AccountInfo(a) => Some(SubscriptionEvent::AccountInfo(a)),
            Self::BrokerBalance(b) => Some(SubscriptionEvent::BrokerBalance(b)),
            Self::OrderUpdate(_) | Self::OrderFinished(_) | Self::Position(_) => None,
        }
    }
}

impl From<SubscriptionEvent> for TopicPayload {
    fn from(event: SubscriptionEvent) -> Self {
        match event {
            SubscriptionEvent::Bar(b) => Self::Bar(b),
            SubscriptionEvent::Book(b) => Self::Book(b),
            SubscriptionEvent::Trade(t) => Self::Trade(t),
            SubscriptionEvent::OrderExecution(e) => Self::OrderExecution(e),
            SubscriptionEvent::AccountInfo(a) => Self::AccountInfo(a),
            SubscriptionEvent::BrokerBalance(b) => Self::BrokerBalance(b),
        }
    }
}

impl From<OmsEvent> for TopicPayload {
    fn from(event: OmsEvent) -> Self {
        match event {
            OmsEvent::Order(OrderEvent::Updated(o)) => Self::OrderUpdate(o),
            OmsEvent::Order(OrderEvent::Finished(o)) => Self::OrderFinished(o),
            OmsEvent::Position(PositionEvent::Changed(p) | PositionEvent::Closed(p)) => Self::Position(p),
        }
    }
}
