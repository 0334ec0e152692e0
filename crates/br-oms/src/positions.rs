//! Position aggregation.
//!
//! One ACTIVE [`Position`] per `(bot_id, symbol)`. Every order snapshot that
//! touches a position replaces that order's prior copy and triggers a full
//! rebuild of the derived fields from the order list, so repeated updates
//! never accumulate floating-point drift.
//!
//! A position closes once its share count is flat and none of its orders is
//! still working. Closed positions are kept for audit and never mutated.

use ahash::AHashMap;
use br_core::enums::{OrderSide, OrderStatus, PositionStatus};
use br_core::time_util::now_ms;
use br_core::trading::{Order, Position};
use tracing::{debug, info};

/// Share counts within this distance of zero are treated as flat.
pub const FLAT_EPSILON: f64 = 1e-9;

type PositionKey = (String, String);

/// Statuses that never change exposure.
pub fn is_exposure_neutral(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Open | OrderStatus::Rejected)
}

/// Owns all positions.
#[derive(Debug, Default)]
pub struct PositionAggregator {
    active: AHashMap<PositionKey, Position>,
    closed: Vec<Position>,
    /// Terminal orders that matched no position, waiting to be reclaimed.
    unclaimed: Vec<Order>,
}

impl PositionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one order snapshot into its position.
    ///
    /// Returns the position after the update, `None` if the order belongs to
    /// no position. A returned position with `status == Closed` has just
    /// been moved to the closed set.
    pub fn update_with_order(&mut self, order: &Order) -> Option<Position> {
        let key = (order.bot_id.clone(), order.symbol.clone());

        if is_exposure_neutral(order.status) {
            return self.active.get(&key).cloned();
        }

        let filled = matches!(order.status, OrderStatus::PartiallyFilled | OrderStatus::Filled);
        let mut position = match self.active.remove(&key) {
            Some(mut p) => {
                replace_order(&mut p, order);
                p
            }
            None if filled && order.total_fill_shares > FLAT_EPSILON => self.open_position(key.clone(), order),
            None => {
                debug!("[positions] order {} ({:?}) is unclaimed", order.id, order.status);
                self.unclaimed.retain(|o| o.id != order.id);
                self.unclaimed.push(order.clone());
                return None;
            }
        };

        recompute(&mut position);

        if is_flat(&position) {
            position.status = PositionStatus::Closed;
            position.closed_at = Some(now_ms());
            info!(
                "[positions] closed {} {} {} pnl={:.8}",
                position.id, position.bot_id, position.symbol, position.realized_pnl
            );
            self.closed.push(position.clone());
        } else {
            self.active.insert(key, position.clone());
        }
        Some(position)
    }

    /// Seed a new position from its first filled order, pulling in any
    /// unclaimed orders for the same bot and symbol.
    fn open_position(&mut self, key: PositionKey, order: &Order) -> Position {
        let mut orders = vec![order.clone()];
        let (reclaimed, rest): (Vec<Order>, Vec<Order>) = std::mem::take(&mut self.unclaimed)
            .into_iter()
            .partition(|o| o.bot_id == key.0 && o.symbol == key.1 && o.id != order.id);
        self.unclaimed = rest;
        if !reclaimed.is_empty() {
            debug!("[positions] reclaimed {} orders for {}/{}", reclaimed.len(), key.0, key.1);
        }
        orders.extend(reclaimed);

        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: key.0,
            symbol: key.1,
            status: PositionStatus::Active,
            original_side: order.side,
            current_shares: 0.0,
            current_capital: 0.0,
            total_capital: 0.0,
            total_shares_traded: 0.0,
            shares_bought: 0.0,
            shares_sold: 0.0,
            avg_buy_price: None,
            avg_sell_price: None,
            total_commission: 0.0,
            realized_pnl: 0.0,
            orders,
            opened_at: now_ms(),
            closed_at: None,
        };
        info!(
            "[positions] opened {} {} {} {}",
            position.id, position.bot_id, position.symbol, position.original_side
        );
        position
    }

    /// Re-insert a checkpointed position. Closed snapshots go straight to
    /// the audit list.
    pub fn restore(&mut self, position: Position) {
        match position.status {
            PositionStatus::Active => {
                let key = (position.bot_id.clone(), position.symbol.clone());
                self.active.insert(key, position);
            }
            PositionStatus::Closed => self.closed.push(position),
        }
    }

    pub fn active_position(&self, bot_id: &str, symbol: &str) -> Option<&Position> {
        self.active.get(&(bot_id.to_string(), symbol.to_string()))
    }

    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.active.values()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn unclaimed_orders(&self) -> &[Order] {
        &self.unclaimed
    }
}

fn replace_order(position: &mut Position, order: &Order) {
    match position.orders.iter_mut().find(|o| o.id == order.id) {
        Some(existing) => *existing = order.clone(),
        None => position.orders.push(order.clone()),
    }
}

fn is_flat(position: &Position) -> bool {
    position.current_shares.abs() < FLAT_EPSILON && !position.orders.iter().any(|o| o.is_active)
}

/// Commission counts toward the position when it is charged in one of the
/// symbol's assets, or when the broker did not say which asset.
fn commission_applies(asset: Option<&str>, symbol: &str) -> bool {
    match asset {
        None => true,
        Some(a) => symbol.to_ascii_uppercase().contains(&a.to_ascii_uppercase()),
    }
}

/// Rebuild every derived field from `position.orders`.
pub fn recompute(position: &mut Position) {
    let mut shares_bought = 0.0;
    let mut shares_sold = 0.0;
    let mut avg_buy: Option<f64> = None;
    let mut avg_sell: Option<f64> = None;
    let mut commission = 0.0;

    for order in &position.orders {
        let shares = order.total_fill_shares;
        let amount = order.total_fill_amount;
        if shares > 0.0 {
            match order.side {
                OrderSide::Buy => {
                    avg_buy = Some(match avg_buy {
                        None => amount / shares,
                        Some(avg) => (avg * shares_bought + amount) / (shares_bought + shares),
                    });
                    shares_bought += shares;
                }
                OrderSide::Sell => {
                    avg_sell = Some(match avg_sell {
                        None => amount / shares,
                        Some(avg) => (avg * shares_sold + amount) / (shares_sold + shares),
                    });
                    shares_sold += shares;
                }
            }
        }
        commission += order
            .trades
            .iter()
            .filter(|t| commission_applies(t.commission_asset.as_deref(), &position.symbol))
            .map(|t| t.commission)
            .sum::<f64>();
    }

    let current_shares = shares_bought - shares_sold;
    let traded = f64::min(shares_bought, shares_sold);
    let entry_price = match position.original_side {
        OrderSide::Buy => avg_buy,
        OrderSide::Sell => avg_sell,
    };

    position.shares_bought = shares_bought;
    position.shares_sold = shares_sold;
    position.avg_buy_price = avg_buy;
    position.avg_sell_price = avg_sell;
    position.total_commission = commission;
    position.current_shares = current_shares;
    position.current_capital = current_shares * entry_price.unwrap_or(0.0);
    position.total_capital = shares_bought * avg_buy.unwrap_or(0.0);
    position.total_shares_traded = traded;
    position.realized_pnl = if traded == 0.0 {
        0.0
    } else {
        (avg_sell.unwrap_or(0.0) - avg_buy.unwrap_or(0.0)) * traded - commission
    };
}
