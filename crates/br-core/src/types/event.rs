//! Normalized events emitted by upstream sources.
//!
//! Sources (market data feeds, brokers) never hold a reference to the hub.
//! They are handed a [`SubscriptionEventSender`] at construction and push
//! events into it; the runner drains the receiver and publishes each event
//! under its [`topic`](SubscriptionEvent::topic).

use super::market_data::{Bar, MarketTrade, OrderBook};
use super::trading::{AccountInfo, BrokerBalance, OrderExecution};

/// A typed event produced by an upstream source.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Bar(Bar),
    Book(OrderBook),
    Trade(MarketTrade),
    /// Raw execution report for one order.
    OrderExecution(OrderExecution),
    AccountInfo(AccountInfo),
    BrokerBalance(BrokerBalance),
}

impl SubscriptionEvent {
    /// Topic suffix for this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bar(_) => "bar",
            Self::Book(_) => "book",
            Self::Trade(_) => "trade",
            Self::OrderExecution(_) => "orderExecution",
            Self::AccountInfo(_) => "accountInfo",
            Self::BrokerBalance(_) => "brokerBalance",
        }
    }

    /// Topic name: `<symbol>.<kind>` for per-symbol events, bare `<kind>` for
    /// account-wide ones.
    pub fn topic(&self) -> String {
        let symbol = match self {
            Self::Bar(b) => &b.symbol,
            Self::Book(b) => &b.symbol,
            Self::Trade(t) => &t.symbol,
            Self::OrderExecution(e) => &e.symbol,
            Self::AccountInfo(_) | Self::BrokerBalance(_) => return self.kind().to_string(),
        };
        format!("{symbol}.{}", self.kind())
    }
}

/// Sender half of the upstream event channel.
pub type SubscriptionEventSender = tokio::sync::mpsc::UnboundedSender<SubscriptionEvent>;

/// Receiver half of the upstream event channel.
pub type SubscriptionEventReceiver = tokio::sync::mpsc::UnboundedReceiver<SubscriptionEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::enums::{ExecutionType, OrderStatus};

    #[test]
    fn topic_names() {
        let mut exec = OrderExecution::new("o1", ExecutionType::New, OrderStatus::Open);
        exec.symbol = "ADAUSDT".into();
        assert_eq!(SubscriptionEvent::OrderExecution(exec).topic(), "ADAUSDT.orderExecution");

        let bal = BrokerBalance { asset: "USDT".into(), available: 1.0, locked: 0.0 };
        assert_eq!(SubscriptionEvent::BrokerBalance(bal).topic(), "brokerBalance");
    }
}
