//! # br-hub
//!
//! Subscription multiplexing between a handful of upstream sources and many
//! downstream WebSocket connections.
//!
//! ## Architecture
//!
//! ```text
//!  MarketDataSource / BrokerSource ──SubscriptionEvent──► runner pump
//!                                                             │ publish
//!  downstream ws ◄── HubServer ◄── ConnectionHub ◄────────────┘
//!                      │  subscribe (deduplicated)
//!                      └──────────────────────────► upstream subscribe_*()
//! ```
//!
//! - [`subscription`]: registry keyed by `(topic type, params)`
//! - [`protocol`]: inbound/outbound wire messages
//! - [`topic`]: `<symbol>.<kind>` topic names and their subscription keys
//! - [`hub`]: request dispatch, fan-out, disconnect cleanup
//! - [`server`]: TCP accept loop and per-connection tasks
//! - [`client`]: downstream-side client with replay on reconnect
//! - [`relay`]: market data source that chains to another hub
//! - [`registry`]: provider id → factory

pub mod client;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod subscription;
pub mod topic;

use anyhow::Result;
use async_trait::async_trait;

/// Trait implemented by every market data adapter.
///
/// The hub calls each subscribe method at most once per unique parameter
/// set, and only with symbols no other connection already covers. Data is
/// delivered through the event channel handed to the adapter at
/// construction.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    async fn subscribe_bar(&self, symbols: &[String], timeframe: &str) -> Result<()>;

    async fn subscribe_book(&self, symbols: &[String]) -> Result<()>;

    async fn subscribe_trade(&self, symbols: &[String]) -> Result<()>;
}
