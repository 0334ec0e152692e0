//! Paper broker: fills every order immediately and in full.
//!
//! Fill price, in order of preference:
//! 1. the order's limit price,
//! 2. the configured `fill_price`,
//! 3. the last trade price seen through `observe_market`.
//!
//! Each accepted order produces a NEW report followed by a single
//! TRADE/FILLED report on the event channel. Cash balances per asset are
//! tracked so that account and balance subscribers see the effect of fills.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use br_core::config::ProviderConfig;
use br_core::enums::{ExecutionType, OrderSide, OrderStatus, OrderType};
use br_core::time_util::now_ms;
use br_core::trading::{AccountInfo, Balance, BrokerBalance, OrderAck, OrderExecution, OrderRequest};
use br_core::{SubscriptionEvent, SubscriptionEventSender};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::BrokerSource;

pub struct PaperBroker {
    name: String,
    fill_price: Option<f64>,
    commission_rate: f64,
    commission_asset: Option<String>,
    events: SubscriptionEventSender,
    last_prices: Mutex<AHashMap<String, f64>>,
    balances: Mutex<AHashMap<String, f64>>,
    account_subscribed: AtomicBool,
    balance_subscribed: AtomicBool,
    seq: AtomicU64,
}

impl PaperBroker {
    pub fn new(config: &ProviderConfig, events: SubscriptionEventSender) -> Self {
        let balances = config
            .balances
            .as_ref()
            .map(|b| b.iter().map(|(k, v)| (k.to_ascii_uppercase(), *v)).collect())
            .unwrap_or_default();
        Self {
            name: config.id.clone(),
            fill_price: config.fill_price,
            commission_rate: config.commission_rate.unwrap_or(0.0),
            commission_asset: config.commission_asset.clone(),
            events,
            last_prices: Mutex::new(AHashMap::new()),
            balances: Mutex::new(balances),
            account_subscribed: AtomicBool::new(false),
            balance_subscribed: AtomicBool::new(false),
            seq: AtomicU64::new(1),
        }
    }

    async fn resolve_price(&self, request: &OrderRequest) -> Option<f64> {
        let limit = match request.order_type {
            OrderType::Market => None,
            _ => request.limit_price,
        };
        if let Some(p) = limit.or(self.fill_price) {
            return Some(p);
        }
        self.last_prices.lock().await.get(&request.symbol).copied()
    }

    async fn account_snapshot(&self) -> AccountInfo {
        let balances = self.balances.lock().await;
        let mut list: Vec<Balance> = balances
            .iter()
            .map(|(asset, &total)| Balance { asset: asset.clone(), total, available: total, in_order: 0.0 })
            .collect();
        list.sort_by(|a, b| a.asset.cmp(&b.asset));
        AccountInfo { last_update_time: now_ms(), balances: list }
    }

    fn send(&self, event: SubscriptionEvent) {
        if self.events.send(event).is_err() {
            debug!("[paper] event receiver dropped");
        }
    }
}

#[async_trait]
impl BrokerSource for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe_order_events(&self, symbols: &[String]) -> Result<()> {
        info!("[paper] order events for {symbols:?}");
        Ok(())
    }

    async fn subscribe_account(&self) -> Result<()> {
        self.account_subscribed.store(true, Ordering::Relaxed);
        let snapshot = self.account_snapshot().await;
        self.send(SubscriptionEvent::AccountInfo(snapshot));
        Ok(())
    }

    async fn subscribe_balance(&self) -> Result<()> {
        self.balance_subscribed.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let price = self
            .resolve_price(request)
            .await
            .ok_or_else(|| anyhow!("no price available for {}", request.symbol))?;
        if price <= 0.0 {
            return Err(anyhow!("invalid fill price {price} for {}", request.symbol));
        }
        let shares = match (request.requested_shares, request.requested_amount) {
            (Some(s), _) => s,
            (None, Some(a)) => a / price,
            (None, None) => return Err(anyhow!("order {} has neither shares nor amount", request.id)),
        };
        if shares <= 0.0 {
            return Err(anyhow!("order {} has non-positive size", request.id));
        }

        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let broker_order_id = format!("paper-{n}");
        let amount = shares * price;
        let commission = amount * self.commission_rate;
        let now = now_ms();

        let mut new = OrderExecution::new(&request.id, ExecutionType::New, OrderStatus::Open);
        new.symbol = request.symbol.clone();
        new.broker_order_id = broker_order_id.clone();
        new.execution_time = now;
        new.order_side = Some(request.side);
        new.order_type = Some(request.order_type);
        new.tif = Some(request.tif);
        new.price_requested = request.limit_price;
        new.amount_requested = request.requested_amount;
        new.shares_requested = request.requested_shares;

        let mut filled = new.clone();
        filled.execution_type = ExecutionType::Trade;
        filled.order_status = OrderStatus::Filled;
        filled.is_complete = true;
        filled.trade_id = Some(format!("{broker_order_id}-1"));
        filled.last_trade_price = Some(price);
        filled.last_trade_shares = Some(shares);
        filled.last_trade_amount = Some(amount);
        filled.total_shares = Some(shares);
        filled.total_amount = Some(amount);
        filled.avg_price = Some(price);
        filled.commission = Some(commission);
        filled.commission_asset = self.commission_asset.clone();

        self.send(SubscriptionEvent::OrderExecution(new));
        self.send(SubscriptionEvent::OrderExecution(filled));
        info!(
            "[paper] filled {} {} {shares} {} @ {price} (commission {commission})",
            request.id, request.side, request.symbol
        );

        let cash_asset = request.currency.to_ascii_uppercase();
        let cash = {
            let mut balances = self.balances.lock().await;
            let delta = match request.side {
                OrderSide::Buy => -amount,
                OrderSide::Sell => amount,
            };
            let entry = balances.entry(cash_asset.clone()).or_insert(0.0);
            *entry += delta - commission;
            *entry
        };
        if self.balance_subscribed.load(Ordering::Relaxed) {
            self.send(SubscriptionEvent::BrokerBalance(BrokerBalance {
                asset: cash_asset,
                available: cash,
                locked: 0.0,
            }));
        }
        if self.account_subscribed.load(Ordering::Relaxed) {
            let snapshot = self.account_snapshot().await;
            self.send(SubscriptionEvent::AccountInfo(snapshot));
        }

        Ok(OrderAck { order_id: request.id.clone(), broker_order_id: Some(broker_order_id) })
    }

    async fn get_account_info(&self, currency: &str) -> Result<AccountInfo> {
        let mut info = self.account_snapshot().await;
        if !info.balances.iter().any(|b| b.asset.eq_ignore_ascii_case(currency)) {
            info.balances.push(Balance {
                asset: currency.to_ascii_uppercase(),
                total: 0.0,
                available: 0.0,
                in_order: 0.0,
            });
        }
        Ok(info)
    }

    async fn get_last_trade_price(&self, symbol: &str) -> Result<f64> {
        if let Some(p) = self.last_prices.lock().await.get(symbol) {
            return Ok(*p);
        }
        self.fill_price.ok_or_else(|| anyhow!("no trade seen for {symbol}"))
    }

    /// Track last prices from the market data stream.
    async fn observe_market(&self, event: &SubscriptionEvent) {
        let (symbol, price) = match event {
            SubscriptionEvent::Trade(t) => (&t.symbol, t.price),
            SubscriptionEvent::Bar(b) => (&b.symbol, b.close),
            _ => return,
        };
        self.last_prices.lock().await.insert(symbol.clone(), price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use br_core::enums::TimeInForce;
    use br_core::market_data::MarketTrade;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn request(amount: Option<f64>, shares: Option<f64>) -> OrderRequest {
        OrderRequest {
            id: "bot1-abc".into(),
            bot_id: "bot1".into(),
            symbol: "ADAUSDT".into(),
            currency: "USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            tif: TimeInForce::Gtc,
            limit_price: None,
            stop_price: None,
            stop_limit_price: None,
            requested_shares: shares,
            requested_amount: amount,
            is_exit: false,
        }
    }

    fn config() -> ProviderConfig {
        let mut cfg = ProviderConfig::named("paper");
        cfg.commission_rate = Some(0.001);
        cfg.balances = Some(HashMap::from([("usdt".to_string(), 1000.0)]));
        cfg
    }

    #[tokio::test]
    async fn fills_at_last_trade_price() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = PaperBroker::new(&config(), tx);
        assert!(broker.submit_order(&request(Some(100.0), None)).await.is_err());

        broker
            .observe_market(&SubscriptionEvent::Trade(MarketTrade {
                symbol: "ADAUSDT".into(),
                trade_id: "x".into(),
                price: 2.0,
                quantity: 1.0,
                is_buyer_maker: false,
                trade_time: 0,
            }))
            .await;
        broker.subscribe_balance().await.unwrap();

        let ack = broker.submit_order(&request(Some(100.0), None)).await.unwrap();
        assert_eq!(ack.order_id, "bot1-abc");

        let Some(SubscriptionEvent::OrderExecution(new)) = rx.recv().await else { panic!() };
        assert_eq!(new.execution_type, ExecutionType::New);
        let Some(SubscriptionEvent::OrderExecution(fill)) = rx.recv().await else { panic!() };
        assert_eq!(fill.order_status, OrderStatus::Filled);
        assert_eq!(fill.last_trade_shares, Some(50.0));
        assert!((fill.commission.unwrap() - 0.1).abs() < 1e-12);
        let Some(SubscriptionEvent::BrokerBalance(bal)) = rx.recv().await else { panic!() };
        assert!((bal.available - (1000.0 - 100.0 - 0.1)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn configured_price_and_account_info() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cfg = config();
        cfg.fill_price = Some(4.0);
        let broker = PaperBroker::new(&cfg, tx);
        assert_eq!(broker.get_last_trade_price("ADAUSDT").await.unwrap(), 4.0);

        broker.submit_order(&request(None, Some(10.0))).await.unwrap();
        let info = broker.get_account_info("BTC").await.unwrap();
        assert!((info.available("USDT") - (1000.0 - 40.0 - 0.04)).abs() < 1e-9);
        assert_eq!(info.available("BTC"), 0.0);
    }
}
