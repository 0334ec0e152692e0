//! # br-oms
//!
//! Order and position reconciliation.
//!
//! Brokers implement the [`BrokerSource`] trait and push normalized execution
//! reports into a [`SubscriptionEventSender`](br_core::SubscriptionEventSender).
//! The [`service::ExecutionService`] feeds those reports through the
//! [`orders::OrderLifecycleManager`] and the [`positions::PositionAggregator`],
//! checkpoints every changed position and emits [`event::OmsEvent`]s.
//!
//! ## Modules
//!
//! - [`orders`]: pending/active/completed order state machine
//! - [`positions`]: per `(bot, symbol)` position rebuild and closure
//! - [`checkpoint`]: `upsert`/`load` snapshot sinks (memory, LMDB)
//! - [`service`]: glue: place orders, apply reports, checkpoint, emit events
//! - [`paper`]: simulated broker that fills every order immediately

pub mod checkpoint;
pub mod event;
pub mod orders;
pub mod paper;
pub mod positions;
pub mod service;

use anyhow::Result;
use async_trait::async_trait;
use br_core::SubscriptionEvent;
use br_core::trading::{AccountInfo, OrderAck, OrderRequest};

/// Trait implemented by every broker adapter.
///
/// The subscribe calls are issued by the hub at most once per unique
/// parameter set; implementations do not need to de-duplicate. Execution
/// reports, account snapshots and balance updates are delivered
/// asynchronously through the event channel handed to the adapter at
/// construction.
///
/// All operations take `&self` so a single adapter can be shared between the
/// hub and the execution service behind an `Arc`.
#[async_trait]
pub trait BrokerSource: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Start streaming execution reports for `symbols`.
    async fn subscribe_order_events(&self, symbols: &[String]) -> Result<()>;

    /// Start streaming account snapshots.
    async fn subscribe_account(&self) -> Result<()>;

    /// Start streaming per-asset balance updates.
    async fn subscribe_balance(&self) -> Result<()>;

    /// Translate and submit an order. Errors are surfaced to the caller of
    /// `place_order` as a rejected result.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Current account snapshot.
    async fn get_account_info(&self, currency: &str) -> Result<AccountInfo>;

    /// Last traded price for `symbol`.
    async fn get_last_trade_price(&self, symbol: &str) -> Result<f64>;

    /// Market data seen by the host. Simulated brokers price fills from it;
    /// live adapters ignore it.
    async fn observe_market(&self, _event: &SubscriptionEvent) {}
}
