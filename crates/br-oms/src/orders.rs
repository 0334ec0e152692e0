//! Order lifecycle state machine.
//!
//! ```text
//! place_order ─► Pending ──NEW──► Active ──TRADE / status──► Active
//!                                   │
//!                                   └── terminal status or complete ──► Completed
//! ```
//!
//! - An [`Order`] is only ever created by a NEW report that matches a
//!   registered [`OrderRequest`] by id.
//! - Reports for ids that are neither pending nor active are dropped and
//!   logged at `warn`. They never fail the stream.
//! - Fill totals and the average fill price are rebuilt from the full trade
//!   list on every report.

use ahash::AHashMap;
use br_core::enums::{ExecutionType, FillStatus, OrderStatus};
use br_core::error::RelayError;
use br_core::trading::{Order, OrderExecution, OrderRequest, Trade};
use tracing::{debug, info, warn};

/// Owns every in-flight order request and reconciled order.
#[derive(Debug, Default)]
pub struct OrderLifecycleManager {
    pending: AHashMap<String, OrderRequest>,
    active: AHashMap<String, Order>,
    completed: AHashMap<String, Order>,
}

impl OrderLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request before it is sent to the broker.
    ///
    /// Rejects ids that are already pending or active, since a second
    /// request with the same id could never be told apart in reports.
    pub fn register(&mut self, request: OrderRequest) -> Result<(), RelayError> {
        if self.pending.contains_key(&request.id) || self.active.contains_key(&request.id) {
            return Err(RelayError::Order(format!("duplicate order id {}", request.id)));
        }
        debug!("[oms] pending {} {} {}", request.id, request.side, request.symbol);
        self.pending.insert(request.id.clone(), request);
        Ok(())
    }

    /// Drop a pending request that will never be matched (e.g. the caller
    /// gave up after a failed submission).
    pub fn discard(&mut self, order_id: &str) -> Option<OrderRequest> {
        self.pending.remove(order_id)
    }

    /// Re-insert a working order loaded from a checkpoint.
    pub fn restore(&mut self, order: Order) {
        if order.is_active {
            self.active.insert(order.id.clone(), order);
        } else {
            self.completed.insert(order.id.clone(), order);
        }
    }

    /// Apply one execution report. Returns the updated order snapshot, or
    /// `None` when the report matched nothing.
    pub fn process_execution(&mut self, report: &OrderExecution) -> Option<Order> {
        let order = match report.execution_type {
            ExecutionType::New => {
                let Some(request) = self.pending.remove(&report.order_id) else {
                    warn!(
                        "[oms] dropping NEW report for unknown order {} (pending={})",
                        report.order_id,
                        self.pending.len()
                    );
                    return None;
                };
                let order = order_from_new(report, &request);
                info!("[oms] order {} opened: {:?} {}", order.id, order.status, order.symbol);
                order
            }
            other => {
                let Some(mut order) = self.active.remove(&report.order_id) else {
                    if self.completed.contains_key(&report.order_id) {
                        warn!(
                            "[oms] dropping {other:?} report for finished order {}",
                            report.order_id
                        );
                    } else {
                        warn!(
                            "[oms] dropping {other:?} report for unknown order {}",
                            report.order_id
                        );
                    }
                    return None;
                };
                apply_update(&mut order, report);
                order
            }
        };

        if order.is_active && !order.status.is_terminal() {
            self.active.insert(order.id.clone(), order.clone());
        } else {
            info!(
                "[oms] order {} finished: {:?} filled={} avg={}",
                order.id, order.status, order.total_fill_shares, order.avg_fill_price
            );
            self.completed.insert(order.id.clone(), order.clone());
        }
        Some(order)
    }

    pub fn pending(&self, order_id: &str) -> Option<&OrderRequest> {
        self.pending.get(order_id)
    }

    /// Active order, or the final snapshot of a completed one.
    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.active.get(order_id).or_else(|| self.completed.get(order_id))
    }

    pub fn active_orders(&self) -> impl Iterator<Item = &Order> {
        self.active.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Merge the caller's request with the broker-confirmed fields of a NEW report.
fn order_from_new(report: &OrderExecution, request: &OrderRequest) -> Order {
    let symbol = if report.symbol.is_empty() { request.symbol.clone() } else { report.symbol.clone() };
    let mut order = Order {
        id: report.order_id.clone(),
        bot_id: request.bot_id.clone(),
        symbol,
        currency: request.currency.clone(),
        side: report.order_side.unwrap_or(request.side),
        order_type: report.order_type.unwrap_or(request.order_type),
        tif: report.tif.unwrap_or(request.tif),
        status: report.order_status,
        fill_status: FillStatus::Unfilled,
        is_active: !report.is_complete,
        is_exit: request.is_exit,
        price: report.price_requested.or(request.limit_price),
        amount: report.amount_requested.or(request.requested_amount),
        shares: request.requested_shares.or(report.shares_requested),
        last_fill_price: report.last_trade_price,
        last_fill_shares: report.last_trade_shares,
        last_fill_amount: report.last_trade_amount,
        avg_fill_price: 0.0,
        total_fill_shares: 0.0,
        total_fill_amount: 0.0,
        reject_reason: report.reject_reason.clone(),
        trades: Vec::new(),
    };
    // A NEW report occasionally carries the first fill.
    if report.trade_id.is_some() {
        apply_update(&mut order, report);
    }
    order
}

fn apply_update(order: &mut Order, report: &OrderExecution) {
    if let Some(trade_id) = &report.trade_id {
        if order.trades.iter().any(|t| &t.trade_id == trade_id) {
            debug!("[oms] order {} ignoring duplicate trade {trade_id}", order.id);
        } else {
            let price = report.last_trade_price.unwrap_or(0.0);
            let shares = report.last_trade_shares.unwrap_or(0.0);
            order.trades.push(Trade {
                trade_id: trade_id.clone(),
                price,
                shares,
                amount: report.last_trade_amount.unwrap_or(price * shares),
                commission: report.commission.unwrap_or(0.0),
                commission_asset: report.commission_asset.clone(),
            });
        }
    }

    order.fill_status = match report.order_status {
        OrderStatus::Filled => FillStatus::Full,
        OrderStatus::PartiallyFilled => FillStatus::Partial,
        _ => order.fill_status,
    };
    order.status = report.order_status;
    order.is_active = !report.is_complete;

    if report.last_trade_price.is_some() {
        order.last_fill_price = report.last_trade_price;
        order.last_fill_shares = report.last_trade_shares;
        order.last_fill_amount = report.last_trade_amount;
    }
    if report.reject_reason.is_some() {
        order.reject_reason = report.reject_reason.clone();
    }

    recompute_fills(order);
}

/// Rebuild totals and the average price from the whole trade list.
pub fn recompute_fills(order: &mut Order) {
    let shares: f64 = order.trades.iter().map(|t| t.shares).sum();
    let amount: f64 = order.trades.iter().map(|t| t.amount).sum();
    order.total_fill_shares = shares;
    order.total_fill_amount = amount;
    order.avg_fill_price = if shares > 0.0 { amount / shares } else { 0.0 };
}
