//! Trading-related records: order requests, execution reports, reconciled
//! orders, positions and account balances.
//!
//! These types flow between strategies, the hub, the order lifecycle manager
//! and the position aggregator. They are always passed by value.

use serde::{Deserialize, Serialize};

use super::enums::{
    ExecutionType, FillStatus, OrderSide, OrderStatus, OrderType, PositionStatus, TimeInForce,
};

fn default_currency() -> String {
    "USD".into()
}

// ---------------------------------------------------------------------------
// Order request (strategy → broker)
// ---------------------------------------------------------------------------

/// A strategy's intent to trade. `id` is caller-assigned and globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub id: String,
    #[serde(default)]
    pub bot_id: String,
    pub symbol: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub tif: TimeInForce,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_amount: Option<f64>,
    #[serde(default)]
    pub is_exit: bool,
}

/// Broker acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution report (broker → lifecycle manager)
// ---------------------------------------------------------------------------

/// A normalized, asynchronous report of a change to an order's state.
///
/// Broker-confirmed descriptive fields (`symbol`, `order_side`, ...) may be
/// absent; the lifecycle manager falls back to the pending request for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExecution {
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub broker_order_id: String,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub execution_time: u64,
    /// `true` once the broker will not work the order any further.
    #[serde(default)]
    pub is_complete: bool,
    pub order_status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_side: Option<OrderSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tif: Option<TimeInForce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_requested: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_requested: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares_requested: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl OrderExecution {
    /// A bare report with only the identifying fields set.
    pub fn new(order_id: impl Into<String>, execution_type: ExecutionType, order_status: OrderStatus) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: String::new(),
            broker_order_id: String::new(),
            execution_type,
            execution_time: 0,
            is_complete: false,
            order_status,
            order_side: None,
            order_type: None,
            tif: None,
            price_requested: None,
            amount_requested: None,
            shares_requested: None,
            trade_id: None,
            last_trade_price: None,
            last_trade_shares: None,
            last_trade_amount: None,
            total_shares: None,
            total_amount: None,
            avg_price: None,
            commission: None,
            commission_asset: None,
            reject_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciled order
// ---------------------------------------------------------------------------

/// One fill attributed to an order. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub trade_id: String,
    pub price: f64,
    pub shares: f64,
    pub amount: f64,
    #[serde(default)]
    pub commission: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_asset: Option<String>,
}

/// Authoritative order state rebuilt from execution reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub bot_id: String,
    pub symbol: String,
    pub currency: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub status: OrderStatus,
    pub fill_status: FillStatus,
    pub is_active: bool,
    #[serde(default)]
    pub is_exit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill_shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill_amount: Option<f64>,
    pub avg_fill_price: f64,
    pub total_fill_shares: f64,
    pub total_fill_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub trades: Vec<Trade>,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Net exposure of one bot in one symbol, derived from its orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub bot_id: String,
    pub symbol: String,
    pub status: PositionStatus,
    pub original_side: OrderSide,
    pub current_shares: f64,
    pub current_capital: f64,
    pub total_capital: f64,
    pub total_shares_traded: f64,
    pub shares_bought: f64,
    pub shares_sold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_buy_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_sell_price: Option<f64>,
    pub total_commission: f64,
    pub realized_pnl: f64,
    pub orders: Vec<Order>,
    #[serde(default)]
    pub opened_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Balance of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub asset: String,
    pub total: f64,
    pub available: f64,
    pub in_order: f64,
}

/// Account snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub last_update_time: u64,
    pub balances: Vec<Balance>,
}

impl AccountInfo {
    /// Available balance for `asset` (case-insensitive), `0.0` if absent.
    pub fn available(&self, asset: &str) -> f64 {
        self.balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.available)
            .unwrap_or(0.0)
    }
}

/// Balance update pushed by the broker for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerBalance {
    pub asset: String,
    pub available: f64,
    pub locked: f64,
}
