//! Enumerations used throughout the botrelay system.
//!
//! Wire names follow the downstream protocol: topic types and order enums are
//! upper-case (`"BAR"`, `"PARTIALLY_FILLED"`), request types are camelCase
//! (`"addBarSubscriptions"`).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Kind of stream a subscription is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopicType {
    Bar,
    Book,
    Trade,
    Order,
    Account,
    Balance,
}

impl TopicType {
    /// Whether the topic is keyed per symbol, as opposed to a singleton
    /// account-wide stream.
    pub fn is_per_symbol(self) -> bool {
        !matches!(self, Self::Account | Self::Balance)
    }
}

impl std::fmt::Display for TopicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bar => "BAR",
            Self::Book => "BOOK",
            Self::Trade => "TRADE",
            Self::Order => "ORDER",
            Self::Account => "ACCOUNT",
            Self::Balance => "BALANCE",
        };
        f.write_str(s)
    }
}

/// Subscription request tag carried by inbound downstream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    AddBarSubscriptions,
    AddBookSubscriptions,
    AddTradeSubscriptions,
    AddOrderSubscriptions,
    AddAccountSubscription,
    AddBalanceSubscription,
}

impl RequestType {
    pub const ALL: [RequestType; 6] = [
        Self::AddBarSubscriptions,
        Self::AddBookSubscriptions,
        Self::AddTradeSubscriptions,
        Self::AddOrderSubscriptions,
        Self::AddAccountSubscription,
        Self::AddBalanceSubscription,
    ];

    /// Parse a wire tag. Returns `None` for unrecognized tags.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddBarSubscriptions => "addBarSubscriptions",
            Self::AddBookSubscriptions => "addBookSubscriptions",
            Self::AddTradeSubscriptions => "addTradeSubscriptions",
            Self::AddOrderSubscriptions => "addOrderSubscriptions",
            Self::AddAccountSubscription => "addAccountSubscription",
            Self::AddBalanceSubscription => "addBalanceSubscription",
        }
    }

    /// The registry topic type this request populates.
    pub fn topic_type(self) -> TopicType {
        match self {
            Self::AddBarSubscriptions => TopicType::Bar,
            Self::AddBookSubscriptions => TopicType::Book,
            Self::AddTradeSubscriptions => TopicType::Trade,
            Self::AddOrderSubscriptions => TopicType::Order,
            Self::AddAccountSubscription => TopicType::Account,
            Self::AddBalanceSubscription => TopicType::Balance,
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order / trading enums
// ---------------------------------------------------------------------------

/// Order status, unified across all brokers.
///
/// `EXPIRED` from the broker maps to [`OrderStatus::Closed`], `NEW` to
/// [`OrderStatus::Open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[serde(alias = "NEW")]
    Open,
    PartiallyFilled,
    Filled,
    #[serde(alias = "CANCELLED")]
    Canceled,
    Rejected,
    #[serde(alias = "EXPIRED")]
    Closed,
    Error,
    Lost,
}

impl OrderStatus {
    /// Terminal statuses: the order no longer changes after reaching one.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Closed)
    }
}

/// How much of an order has been filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillStatus {
    #[default]
    #[serde(rename = "NONE")]
    Unfilled,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "FULL")]
    Full,
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    LimitMaker,
    Market,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    Bracket,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
    Opg,
}

/// What happened to the order in a given execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    New,
    Canceled,
    Replaced,
    Rejected,
    Trade,
    Expired,
}

/// Lifecycle of an aggregated position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    #[default]
    Active,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_tags() {
        for r in RequestType::ALL {
            assert_eq!(RequestType::parse(r.as_str()), Some(r));
            let json = serde_json::to_string(&r).unwrap();
            assert_eq!(json, format!("\"{}\"", r.as_str()));
        }
        assert_eq!(RequestType::parse("addCandleSubscriptions"), None);
    }

    #[test]
    fn broker_status_aliases() {
        let s: OrderStatus = serde_json::from_str("\"EXPIRED\"").unwrap();
        assert_eq!(s, OrderStatus::Closed);
        let s: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::PartiallyFilled);
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn fill_status_wire_names() {
        assert_eq!(serde_json::to_string(&FillStatus::Unfilled).unwrap(), "\"NONE\"");
        assert_eq!(serde_json::to_string(&FillStatus::Full).unwrap(), "\"FULL\"");
    }
}
