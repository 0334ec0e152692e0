//! WebSocket server in front of a [`ConnectionHub`].
//!
//! One task per accepted socket. Each task owns the socket halves and an
//! outbound queue; the hub only ever sees the queue's sender. The task
//! `select!`s over shutdown, inbound frames and queued outbound frames.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::hub::ConnectionHub;

pub struct HubServer {
    hub: Arc<ConnectionHub>,
    listener: TcpListener,
    outbound_buffer: usize,
}

impl HubServer {
    pub async fn bind(addr: &str, hub: Arc<ConnectionHub>, outbound_buffer: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("[server] listening on {}", listener.local_addr()?);
        Ok(Self { hub, listener, outbound_buffer: outbound_buffer.max(1) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("[server] shutdown signal received, no longer accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let hub = self.hub.clone();
                            let shutdown = shutdown.clone();
                            let buffer = self.outbound_buffer;
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(hub, stream, peer, buffer, shutdown).await {
                                    warn!("[server] {peer}: {e:#}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("[server] accept failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    hub: Arc<ConnectionHub>,
    stream: TcpStream,
    peer: SocketAddr,
    buffer: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let id = uuid::Uuid::new_v4().to_string();
    debug!("[server] {peer} upgraded as {id}");

    let (tx, mut rx) = mpsc::channel::<String>(buffer);
    hub.connect(&id, tx).await;
    let (mut write, mut read) = ws.split();

    // Requests run one at a time, in arrival order, off the socket loop so
    // outbound frames keep draining while an upstream call is pending.
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<String>();
    let worker = {
        let hub = hub.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(text) = req_rx.recv().await {
                if let Err(e) = hub.handle_text(&id, &text).await {
                    warn!("[server] {id}: {e}");
                }
            }
        })
    };

    let result: Result<()> = async {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.close().await;
                    return Ok(());
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    write.send(Message::Text(frame.into())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = req_tx.send(text.as_str().to_owned());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }
    .await;

    hub.disconnect(&id).await;
    // Requests already queued still finish (an order may be mid-submit);
    // their replies have nowhere to go.
    drop(req_tx);
    drop(worker);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Upstream;
    use crate::subscription::SubscriptionKey;
    use br_core::config::ProviderConfig;
    use br_core::enums::TopicType;
    use br_core::market_data::MarketTrade;
    use br_core::SubscriptionEvent;
    use br_oms::BrokerSource;
    use br_oms::paper::PaperBroker;
    use br_oms::service::ExecutionService;
    use serde_json::{Value, json};
    use std::time::Duration;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn recv(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn order_flow_over_loopback() {
        let (md_tx, mut md_rx) = mpsc::unbounded_channel();
        let (oms_tx, mut oms_rx) = mpsc::unbounded_channel();
        let mut cfg = ProviderConfig::named("paper");
        cfg.fill_price = Some(2.0);
        let broker: Arc<dyn BrokerSource> = Arc::new(PaperBroker::new(&cfg, md_tx));
        let execution = Arc::new(ExecutionService::new(broker.clone(), oms_tx));
        let hub = Arc::new(ConnectionHub::new(
            "hub-e2e",
            Upstream { market_data: None, broker: Some(broker), execution: Some(execution.clone()) },
        ));

        // Pumps, as the runner wires them.
        let pump_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(event) = md_rx.recv().await {
                pump_hub.ingest(event).await;
            }
        });
        let pump_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(event) = oms_rx.recv().await {
                pump_hub.publish_oms(event).await;
            }
        });

        let server = HubServer::bind("127.0.0.1:0", hub.clone(), 64).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        assert_eq!(recv(&mut ws).await["instanceId"], "hub-e2e");

        send(&mut ws, json!({"requestType": "addOrderSubscriptions", "options": {"symbols": ["ADAUSDT"]}})).await;
        assert_eq!(recv(&mut ws).await["event"], "addSubscription_success");

        // Market data was never wired.
        send(&mut ws, json!({"requestType": "addTradeSubscriptions", "options": {"symbols": ["ADAUSDT"]}})).await;
        assert_eq!(recv(&mut ws).await["event"], "addSubscription_failed");

        send(
            &mut ws,
            json!({"event": "placeOrder", "orderRequest": {
                "id": "bot1-abc", "botId": "bot1", "symbol": "ADAUSDT",
                "side": "BUY", "type": "MARKET", "requestedAmount": 100
            }}),
        )
        .await;

        let mut seen_results = false;
        let mut position = None;
        while position.is_none() {
            let msg = recv(&mut ws).await;
            match msg["event"].as_str() {
                Some("placeOrder_results") => {
                    assert_eq!(msg["results"]["success"], true);
                    seen_results = true;
                }
                Some("topic") if msg["topic"] == "ADAUSDT.position" => position = Some(msg),
                _ => {}
            }
        }
        assert!(seen_results);
        let position = position.unwrap();
        assert_eq!(position["payload"]["data"]["currentShares"], 50.0);
        assert_eq!(position["payload"]["data"]["status"], "ACTIVE");

        ws.close(None).await.unwrap();
        let key = SubscriptionKey::symbol(TopicType::Order, "ADAUSDT");
        for _ in 0..50 {
            if hub.find(&key).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(hub.find(&key).await.is_none());

        // Trade prints are not routed anywhere once nobody listens.
        let trade = MarketTrade {
            symbol: "ADAUSDT".into(),
            trade_id: "1".into(),
            price: 1.0,
            quantity: 1.0,
            is_buyer_maker: false,
            trade_time: 0,
        };
        assert_eq!(hub.publish_event(SubscriptionEvent::Trade(trade)).await, 0);
        let _ = stop_tx.send(true);
    }

    struct SlowBooks;

    #[async_trait::async_trait]
    impl crate::MarketDataSource for SlowBooks {
        fn name(&self) -> &str {
            "slow-books"
        }
        async fn subscribe_bar(&self, _s: &[String], _tf: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_book(&self, _s: &[String]) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }
        async fn subscribe_trade(&self, _s: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fan_out_keeps_flowing_during_slow_request() {
        let hub = Arc::new(ConnectionHub::new(
            "hub-slow",
            Upstream { market_data: Some(Arc::new(SlowBooks)), ..Default::default() },
        ));
        // Small queue: a stalled writer would start dropping after 4 frames.
        let server = HubServer::bind("127.0.0.1:0", hub.clone(), 4).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        assert_eq!(recv(&mut ws).await["event"], "initialize");
        send(&mut ws, json!({"requestType": "addTradeSubscriptions", "options": {"symbols": ["X"]}})).await;
        assert_eq!(recv(&mut ws).await["event"], "addSubscription_success");

        send(&mut ws, json!({"requestType": "addBookSubscriptions", "options": {"symbols": ["Y"]}})).await;
        for i in 0..20 {
            let trade = MarketTrade {
                symbol: "X".into(),
                trade_id: i.to_string(),
                price: 1.0,
                quantity: 1.0,
                is_buyer_maker: false,
                trade_time: i,
            };
            hub.publish_event(SubscriptionEvent::Trade(trade)).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut trades = 0;
        loop {
            let msg = recv(&mut ws).await;
            match msg["event"].as_str() {
                Some("topic") => trades += 1,
                Some("addSubscription_success") => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(trades, 20);
        let _ = stop_tx.send(true);
    }
}
