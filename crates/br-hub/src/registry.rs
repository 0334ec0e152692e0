//! Provider registry: factory for upstream sources by config id.
//!
//! Built-ins are `"relay"` (market data from another hub) and `"paper"`
//! (simulated broker). Hosts can register their own adapters under any id
//! before building.

use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Result;
use br_core::SubscriptionEventSender;
use br_core::config::ProviderConfig;
use br_core::error::RelayError;
use br_oms::BrokerSource;
use br_oms::paper::PaperBroker;

use crate::MarketDataSource;
use crate::relay::RelaySource;

pub type MarketDataFactory = fn(&ProviderConfig, SubscriptionEventSender) -> Result<Arc<dyn MarketDataSource>>;
pub type BrokerFactory = fn(&ProviderConfig, SubscriptionEventSender) -> Result<Arc<dyn BrokerSource>>;

#[derive(Default)]
pub struct ProviderRegistry {
    market_data: AHashMap<String, MarketDataFactory>,
    brokers: AHashMap<String, BrokerFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_market_data("relay", build_relay);
        registry.register_broker("paper", build_paper);
        registry
    }

    /// Ids are matched case-insensitively. A later registration replaces an
    /// earlier one.
    pub fn register_market_data(&mut self, id: &str, factory: MarketDataFactory) {
        self.market_data.insert(id.to_lowercase(), factory);
    }

    pub fn register_broker(&mut self, id: &str, factory: BrokerFactory) {
        self.brokers.insert(id.to_lowercase(), factory);
    }

    pub fn build_market_data(
        &self,
        config: &ProviderConfig,
        events: SubscriptionEventSender,
    ) -> Result<Arc<dyn MarketDataSource>> {
        let factory = self
            .market_data
            .get(&config.id.to_lowercase())
            .ok_or_else(|| RelayError::Config(format!("unknown market data provider: {}", config.id)))?;
        factory(config, events)
    }

    pub fn build_broker(&self, config: &ProviderConfig, events: SubscriptionEventSender) -> Result<Arc<dyn BrokerSource>> {
        let factory = self
            .brokers
            .get(&config.id.to_lowercase())
            .ok_or_else(|| RelayError::Config(format!("unknown broker provider: {}", config.id)))?;
        factory(config, events)
    }

    /// Registered ids, sorted, as `(market_data, brokers)`.
    pub fn ids(&self) -> (Vec<String>, Vec<String>) {
        let mut md: Vec<String> = self.market_data.keys().cloned().collect();
        let mut brokers: Vec<String> = self.brokers.keys().cloned().collect();
        md.sort();
        brokers.sort();
        (md, brokers)
    }
}

fn build_relay(config: &ProviderConfig, events: SubscriptionEventSender) -> Result<Arc<dyn MarketDataSource>> {
    Ok(Arc::new(RelaySource::start(config, events)?))
}

fn build_paper(config: &ProviderConfig, events: SubscriptionEventSender) -> Result<Arc<dyn BrokerSource>> {
    Ok(Arc::new(PaperBroker::new(config, events)))
}
