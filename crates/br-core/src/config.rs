//! Configuration parsing for the botrelay system.
//!
//! The runner reads a single JSON config file. It is parsed once at startup
//! into an [`AppConfig`] which is then handed, by reference, to the hub, the
//! execution service and the provider factories.
//!
//! # Example config
//!
//! ```json
//! {
//!   "service": { "module_name": "botrelay", "log_path": "/tmp/log", "log_format": "json" },
//!   "hub": { "listen_addr": "0.0.0.0:3000" },
//!   "market_data": { "id": "relay", "url": "ws://upstream-hub:3000" },
//!   "broker": { "id": "paper", "commission_rate": 0.001 },
//!   "checkpoint": { "dir": "/var/lib/botrelay", "collection": "positions" }
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::RelayError;
use crate::logging::LogFormat;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Service metadata (name, log path).
    #[serde(default)]
    pub service: ServiceMeta,

    /// Downstream WebSocket server settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// Upstream market data provider.
    pub market_data: Option<ProviderConfig>,

    /// Upstream broker provider.
    pub broker: Option<ProviderConfig>,

    /// Position checkpoint sink.
    pub checkpoint: Option<CheckpointConfig>,
}

impl AppConfig {
    /// Reject configs that would only fail later at bind / build time.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.hub.listen_addr.trim().is_empty() {
            return Err(RelayError::Config("hub.listen_addr must not be empty".into()));
        }
        if self.hub.outbound_buffer == 0 {
            return Err(RelayError::Config("hub.outbound_buffer must be positive".into()));
        }
        for (section, provider) in [("market_data", &self.market_data), ("broker", &self.broker)] {
            if let Some(p) = provider {
                if p.id.trim().is_empty() {
                    return Err(RelayError::Config(format!("{section}.id must not be empty")));
                }
            }
        }
        if let Some(cp) = &self.checkpoint {
            if cp.dir.trim().is_empty() {
                return Err(RelayError::Config("checkpoint.dir must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Service name, used as the log file prefix.
    pub fn module_name(&self) -> String {
        self.service.module_name.clone().unwrap_or_else(|| "botrelay".into())
    }
}

/// Service metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Downstream server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Socket address to accept downstream connections on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Identifier sent to every connection in the `initialize` event.
    /// A random UUID when unset.
    pub instance_id: Option<String>,

    /// Per-connection outbound queue depth. Frames beyond it are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            instance_id: None,
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl HubConfig {
    pub fn effective_instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// One upstream provider, resolved through the provider registry by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Registry identifier: `"relay"`, `"paper"`, or anything the host registered.
    pub id: String,

    /// Endpoint URL for network-backed providers.
    pub url: Option<String>,

    /// Ping interval in seconds (WebSocket keep-alive).
    pub ping_interval_sec: Option<u64>,

    /// Extra HTTP headers for the WebSocket handshake (e.g. API key).
    pub extra_headers: Option<HashMap<String, String>>,

    /// Fixed fill price for simulated brokers. Falls back to the last trade.
    pub fill_price: Option<f64>,

    /// Commission charged per fill as a fraction of the fill amount.
    pub commission_rate: Option<f64>,

    /// Asset the commission is charged in (e.g. `"USDT"`).
    pub commission_asset: Option<String>,

    /// Starting cash balances for simulated brokers, keyed by asset.
    pub balances: Option<HashMap<String, f64>>,
}

impl ProviderConfig {
    /// A config with only the id set.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            ping_interval_sec: None,
            extra_headers: None,
            fill_price: None,
            commission_rate: None,
            commission_asset: None,
            balances: None,
        }
    }

    /// Returns `url` or a config error naming the provider.
    pub fn require_url(&self) -> Result<&str, RelayError> {
        self.url
            .as_deref()
            .ok_or_else(|| RelayError::Config(format!("provider '{}' requires a url", self.id)))
    }
}

/// Checkpoint sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// LMDB environment directory, created if missing.
    pub dir: String,

    /// Collection that position snapshots are written to.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".into()
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_collection() -> String {
    "positions".into()
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
