//! Execution service: the glue between a broker, the order state machine,
//! the position aggregator and the checkpoint sink.
//!
//! The order manager and the aggregator sit behind separate locks. A report
//! is applied to the orders first, the lock is released, and only then is
//! the resulting snapshot folded into positions. Checkpoint writes and
//! broker calls never run while either lock is held.

use std::sync::Arc;

use anyhow::Result;
use br_core::enums::PositionStatus;
use br_core::trading::{Order, OrderAck, OrderExecution, OrderRequest, Position};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::BrokerSource;
use crate::checkpoint::CheckpointSink;
use crate::event::{OmsEvent, OmsEventSender, OrderEvent, PositionEvent};
use crate::orders::OrderLifecycleManager;
use crate::positions::{PositionAggregator, is_exposure_neutral};

pub struct ExecutionService {
    broker: Arc<dyn BrokerSource>,
    orders: Mutex<OrderLifecycleManager>,
    positions: Mutex<PositionAggregator>,
    checkpoint: Option<(Arc<dyn CheckpointSink>, String)>,
    events: OmsEventSender,
}

impl ExecutionService {
    pub fn new(broker: Arc<dyn BrokerSource>, events: OmsEventSender) -> Self {
        Self {
            broker,
            orders: Mutex::new(OrderLifecycleManager::new()),
            positions: Mutex::new(PositionAggregator::new()),
            checkpoint: None,
            events,
        }
    }

    /// Persist every position snapshot into `collection` of `sink`.
    pub fn with_checkpoint(mut self, sink: Arc<dyn CheckpointSink>, collection: impl Into<String>) -> Self {
        self.checkpoint = Some((sink, collection.into()));
        self
    }

    pub fn broker(&self) -> &Arc<dyn BrokerSource> {
        &self.broker
    }

    /// Register `request` as pending, then submit it.
    ///
    /// A failed submission is returned to the caller and the request stays
    /// pending; retrying is the caller's decision.
    pub async fn place_order(&self, request: OrderRequest) -> Result<OrderAck> {
        self.orders.lock().await.register(request.clone())?;
        match self.broker.submit_order(&request).await {
            Ok(ack) => {
                info!(
                    "[oms] submitted {} {} {} via {} (broker id {:?})",
                    request.id,
                    request.side,
                    request.symbol,
                    self.broker.name(),
                    ack.broker_order_id
                );
                Ok(ack)
            }
            Err(e) => {
                warn!("[oms] submit {} failed, left pending: {e:#}", request.id);
                Err(e)
            }
        }
    }

    /// Apply one execution report end to end. Returns the updated order, or
    /// `None` when the report matched nothing.
    pub async fn handle_execution(&self, report: &OrderExecution) -> Option<Order> {
        let order = self.orders.lock().await.process_execution(report)?;

        let order_event = if order.is_active && !order.status.is_terminal() {
            OrderEvent::Updated(order.clone())
        } else {
            OrderEvent::Finished(order.clone())
        };
        self.emit(OmsEvent::Order(order_event));

        if is_exposure_neutral(order.status) {
            return Some(order);
        }

        let position = self.positions.lock().await.update_with_order(&order);
        if let Some(position) = position {
            self.save(&position).await;
            let event = match position.status {
                PositionStatus::Active => PositionEvent::Changed(position),
                PositionStatus::Closed => PositionEvent::Closed(position),
            };
            self.emit(OmsEvent::Position(event));
        }
        Some(order)
    }

    /// Reload ACTIVE positions from the checkpoint sink, along with the
    /// orders they still have working. Returns the number restored.
    pub async fn restore_positions(&self) -> Result<usize> {
        let Some((sink, collection)) = &self.checkpoint else {
            return Ok(0);
        };
        let records = sink.load(collection, &json!({ "status": "ACTIVE" })).await?;

        let mut restored = 0;
        let mut orders = self.orders.lock().await;
        let mut positions = self.positions.lock().await;
        for record in records {
            let position: Position = match serde_json::from_value(record) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[oms] skipping unreadable checkpoint record: {e}");
                    continue;
                }
            };
            for order in position.orders.iter().filter(|o| o.is_active) {
                orders.restore(order.clone());
            }
            positions.restore(position);
            restored += 1;
        }
        info!("[oms] restored {restored} active positions from '{collection}'");
        Ok(restored)
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.orders.lock().await.order(order_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.orders.lock().await.pending_count()
    }

    pub async fn active_position(&self, bot_id: &str, symbol: &str) -> Option<Position> {
        self.positions.lock().await.active_position(bot_id, symbol).cloned()
    }

    pub async fn active_positions(&self) -> Vec<Position> {
        self.positions.lock().await.active_positions().cloned().collect()
    }

    async fn save(&self, position: &Position) {
        let Some((sink, collection)) = &self.checkpoint else {
            return;
        };
        let record = match serde_json::to_value(position) {
            Ok(v) => v,
            Err(e) => {
                error!("[oms] cannot serialize position {}: {e}", position.id);
                return;
            }
        };
        if let Err(e) = sink.upsert(collection, &record, &json!({ "id": position.id })).await {
            error!("[oms] checkpoint of position {} failed: {e}", position.id);
        }
    }

    fn emit(&self, event: OmsEvent) {
        if self.events.send(event).is_err() {
            warn!("[oms] event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpoint;
    use async_trait::async_trait;
    use br_core::enums::{ExecutionType, OrderSide, OrderStatus, OrderType, TimeInForce};
    use br_core::trading::AccountInfo;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingBroker {
        submitted: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BrokerSource for RecordingBroker {
        fn name(&self) -> &str {
            "recording"
        }
        async fn subscribe_order_events(&self, _symbols: &[String]) -> Result<()> {
            Ok(())
        }
        async fn subscribe_account(&self) -> Result<()> {
            Ok(())
        }
        async fn subscribe_balance(&self) -> Result<()> {
            Ok(())
        }
        async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("exchange unavailable");
            }
            Ok(OrderAck { order_id: request.id.clone(), broker_order_id: Some("b-1".into()) })
        }
        async fn get_account_info(&self, _currency: &str) -> Result<AccountInfo> {
            Ok(AccountInfo { last_update_time: 0, balances: vec![] })
        }
        async fn get_last_trade_price(&self, _symbol: &str) -> Result<f64> {
            Ok(2.0)
        }
    }

    fn request(id: &str) -> OrderRequest {
        OrderRequest {
            id: id.into(),
            bot_id: "bot1".into(),
            symbol: "ADAUSDT".into(),
            currency: "USD".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            tif: TimeInForce::Gtc,
            limit_price: None,
            stop_price: None,
            stop_limit_price: None,
            requested_shares: None,
            requested_amount: Some(100.0),
            is_exit: false,
        }
    }

    fn fill(id: &str) -> OrderExecution {
        let mut r = OrderExecution::new(id, ExecutionType::Trade, OrderStatus::Filled);
        r.trade_id = Some("t1".into());
        r.last_trade_price = Some(2.0);
        r.last_trade_shares = Some(10.0);
        r.last_trade_amount = Some(20.0);
        r.is_complete = true;
        r
    }

    #[tokio::test]
    async fn place_fill_and_checkpoint() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(MemoryCheckpoint::new());
        let svc = ExecutionService::new(Arc::new(RecordingBroker::default()), tx)
            .with_checkpoint(sink.clone(), "positions");

        let ack = svc.place_order(request("bot1-abc")).await.unwrap();
        assert_eq!(ack.broker_order_id.as_deref(), Some("b-1"));
        assert_eq!(svc.pending_count().await, 1);

        let opened = svc
            .handle_execution(&OrderExecution::new("bot1-abc", ExecutionType::New, OrderStatus::Open))
            .await
            .unwrap();
        assert!(opened.is_active);
        assert!(matches!(rx.try_recv().unwrap(), OmsEvent::Order(OrderEvent::Updated(_))));
        assert!(rx.try_recv().is_err());

        svc.handle_execution(&fill("bot1-abc")).await.unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.topic(), "ADAUSDT.orderFinished");
        let OmsEvent::Position(PositionEvent::Changed(pos)) = rx.try_recv().unwrap() else {
            panic!("expected position change");
        };
        assert_eq!(pos.current_shares, 10.0);
        assert_eq!(pos.avg_buy_price, Some(2.0));

        let saved = sink.load("positions", &json!({ "id": pos.id })).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0]["currentShares"], 10.0);
    }

    #[tokio::test]
    async fn failed_submission_stays_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let broker = Arc::new(RecordingBroker::default());
        broker.fail.store(true, Ordering::SeqCst);
        let svc = ExecutionService::new(broker.clone(), tx);

        assert!(svc.place_order(request("o1")).await.is_err());
        assert_eq!(broker.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(svc.pending_count().await, 1);
    }

    #[tokio::test]
    async fn unmatched_report_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = ExecutionService::new(Arc::new(RecordingBroker::default()), tx);
        assert!(svc.handle_execution(&fill("ghost")).await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_active_positions() {
        let sink = Arc::new(MemoryCheckpoint::new());
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let svc = ExecutionService::new(Arc::new(RecordingBroker::default()), tx)
                .with_checkpoint(sink.clone(), "positions");
            svc.place_order(request("o1")).await.unwrap();
            svc.handle_execution(&OrderExecution::new("o1", ExecutionType::New, OrderStatus::Open))
                .await;
            svc.handle_execution(&fill("o1")).await;
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let svc = ExecutionService::new(Arc::new(RecordingBroker::default()), tx)
            .with_checkpoint(sink, "positions");
        assert_eq!(svc.restore_positions().await.unwrap(), 1);
        let pos = svc.active_position("bot1", "ADAUSDT").await.unwrap();
        assert_eq!(pos.current_shares, 10.0);
    }
}
