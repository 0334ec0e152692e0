//! Market data source backed by another hub.
//!
//! Subscribes downstream of a remote hub with a [`SubscriptionClient`] and
//! turns its `topic` frames back into [`SubscriptionEvent`]s, so hubs can be
//! chained. Reconnects and subscription replay come from the client.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use br_core::config::ProviderConfig;
use br_core::SubscriptionEventSender;
use br_core::ws::WsConnConfig;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::MarketDataSource;
use crate::client::{ClientEvent, ClientEventReceiver, SubscriptionClient};
use crate::protocol::ServerMessage;

pub struct RelaySource {
    name: String,
    client: SubscriptionClient,
    pump: JoinHandle<()>,
}

impl RelaySource {
    /// Connect to `config.url` and forward its topics into `events`.
    pub fn start(config: &ProviderConfig, events: SubscriptionEventSender) -> Result<Self> {
        let mut ws = WsConnConfig::new(config.require_url()?);
        ws.ping_interval = config.ping_interval_sec.map(Duration::from_secs);
        if let Some(headers) = &config.extra_headers {
            ws.extra_headers = headers.clone();
        }

        let name = format!("relay:{}", ws.url);
        let (mut client, rx) = SubscriptionClient::new(ws);
        client.connect();
        let pump = tokio::spawn(pump(name.clone(), rx, events));
        Ok(Self { name, client, pump })
    }
}

impl Drop for RelaySource {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(name: String, mut rx: ClientEventReceiver, events: SubscriptionEventSender) {
    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::Connected => info!("[{name}] connected"),
            ClientEvent::Disconnected => warn!("[{name}] disconnected"),
            ClientEvent::Message(ServerMessage::Topic { payload, .. }) => {
                let Some(event) = payload.into_subscription_event() else {
                    continue;
                };
                if events.send(event).is_err() {
                    info!("[{name}] event receiver dropped, stopping");
                    return;
                }
            }
            ClientEvent::Message(ServerMessage::SubscriptionFailed { request_type, error, .. }) => {
                warn!("[{name}] remote rejected {request_type}: {}", error.unwrap_or_default());
            }
            ClientEvent::Message(ServerMessage::Initialize { instance_id }) => {
                info!("[{name}] remote instance {instance_id}");
            }
            ClientEvent::Message(_) => {}
        }
    }
}

#[async_trait]
impl MarketDataSource for RelaySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe_bar(&self, symbols: &[String], timeframe: &str) -> Result<()> {
        Ok(self.client.subscribe_bars(symbols, timeframe)?)
    }

    async fn subscribe_book(&self, symbols: &[String]) -> Result<()> {
        Ok(self.client.subscribe_books(symbols)?)
    }

    async fn subscribe_trade(&self, symbols: &[String]) -> Result<()> {
        Ok(self.client.subscribe_trades(symbols)?)
    }
}
