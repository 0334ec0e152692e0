//! Topic names and their mapping onto subscription keys.
//!
//! A topic is `<symbol>.<kind>` for per-symbol streams and a bare `<kind>`
//! for account-wide ones. Only the trailing segment decides the kind, so
//! symbols that themselves contain dots still resolve.

use br_core::enums::TopicType;

use crate::protocol::TopicPayload;
use crate::subscription::SubscriptionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Bar,
    Book,
    Trade,
    OrderExecution,
    OrderUpdate,
    OrderFinished,
    Position,
    AccountInfo,
    BrokerBalance,
}

impl TopicKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "bar" => Self::Bar,
            "book" => Self::Book,
            "trade" => Self::Trade,
            "orderExecution" => Self::OrderExecution,
            "orderUpdate" => Self::OrderUpdate,
            "orderFinished" => Self::OrderFinished,
            "position" => Self::Position,
            "accountInfo" => Self::AccountInfo,
            "brokerBalance" => Self::BrokerBalance,
            _ => return None,
        })
    }

    /// Which subscriptions receive this kind. Order and position changes go
    /// to ORDER subscribers of the symbol.
    pub fn topic_type(self) -> TopicType {
        match self {
            Self::Bar => TopicType::Bar,
            Self::Book => TopicType::Book,
            Self::Trade => TopicType::Trade,
            Self::OrderExecution | Self::OrderUpdate | Self::OrderFinished | Self::Position => {
                TopicType::Order
            }
            Self::AccountInfo => TopicType::Account,
            Self::BrokerBalance => TopicType::Balance,
        }
    }
}

/// A parsed topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic<'a> {
    pub symbol: Option<&'a str>,
    pub kind: TopicKind,
}

impl<'a> Topic<'a> {
    pub fn parse(name: &'a str) -> Option<Self> {
        let (symbol, kind) = match name.rsplit_once('.') {
            Some((symbol, kind)) => (Some(symbol), kind),
            None => (None, name),
        };
        Some(Self { symbol: symbol.filter(|s| !s.is_empty()), kind: TopicKind::parse(kind)? })
    }

    /// The registry key whose connections should receive `payload` on this
    /// topic. Bars additionally match on the payload's timeframe. Returns
    /// `None` when a per-symbol topic lacks its symbol.
    pub fn subscription_key(&self, payload: &TopicPayload) -> Option<SubscriptionKey> {
        let topic_type = self.kind.topic_type();
        if !topic_type.is_per_symbol() {
            return Some(SubscriptionKey::singleton(topic_type));
        }
        let symbol = self.symbol?;
        match (topic_type, payload) {
            (TopicType::Bar, TopicPayload::Bar(bar)) => Some(SubscriptionKey::bar(symbol, &bar.timeframe)),
            (TopicType::Bar, _) => None,
            _ => Some(SubscriptionKey::symbol(topic_type, symbol)),
        }
    }
}
