//! Normalized market data records published by upstream sources.
//!
//! # Timestamp convention
//!
//! All timestamps are in **milliseconds since Unix epoch**.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// OHLCV candle for one symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    #[serde(default)]
    pub provider_id: String,
    pub symbol: String,
    /// Candle width, e.g. `"1m"`, `"1h"`.
    pub timeframe: String,
    pub start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
    /// `true` while the candle is still being built.
    #[serde(default)]
    pub in_progress: bool,
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Order book snapshot. `bids[0]` is the best bid, `asks[0]` the best ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub source: String,
    pub event_time: u64,
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// A book missing either side carries no tradable quote.
    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Market trade
// ---------------------------------------------------------------------------

/// A public trade print (not to be confused with an order fill, see
/// [`Trade`](super::trading::Trade)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTrade {
    pub symbol: String,
    pub trade_id: String,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub is_buyer_maker: bool,
    pub trade_time: u64,
}

impl std::fmt::Display for Bar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bar({} {} o={:.8} h={:.8} l={:.8} c={:.8} v={:.4})",
            self.symbol, self.timeframe, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

impl std::fmt::Display for OrderBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bid = self.bids.first().map(|l| l.price).unwrap_or(0.0);
        let ask = self.asks.first().map(|l| l.price).unwrap_or(0.0);
        write!(f, "Book({} bid[0]={bid:.8} ask[0]={ask:.8})", self.symbol)
    }
}
