//! Connection hub: request dispatch, de-duplicated upstream subscription and
//! fan-out.
//!
//! # Locking
//!
//! All hub state (registry + connection senders) sits behind one `RwLock`.
//! Subscribe requests take the write lock, mutate the registry, release it,
//! and only then call upstream. Publishing takes the read lock and pushes
//! pre-serialized frames into per-connection queues with `try_send`, so no
//! lock is ever held across network I/O.
//!
//! A connection is removed from every subscription before its sender is
//! dropped; a publish that starts afterwards cannot see it.
//!
//! A key new to the hub stays *in flight* until its upstream call returns.
//! Connections joining it meanwhile are acknowledged only after that, with
//! the call's outcome; a failed call takes the key and every joiner with it.

use std::sync::Arc;

use ahash::AHashMap;
use br_core::enums::TopicType;
use br_core::error::RelayError;
use br_core::trading::OrderRequest;
use br_core::{RequestType, SubscriptionEvent};
use br_oms::BrokerSource;
use br_oms::event::OmsEvent;
use br_oms::service::ExecutionService;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::MarketDataSource;
use crate::protocol::{
    ClientMessage, PlaceOrderResult, ServerMessage, ServerStatus, SubscriptionOptions, TopicPayload,
};
use crate::subscription::{ConnectionId, Subscription, SubscriptionKey, SubscriptionRegistry};
use crate::topic::Topic;

/// Queue of serialized frames for one connection.
pub type OutboundSender = mpsc::Sender<String>;

/// Upstream collaborators the hub may call. Any of them may be absent; a
/// request that needs a missing one fails with
/// [`RelayError::MissingUpstream`].
#[derive(Clone, Default)]
pub struct Upstream {
    pub market_data: Option<Arc<dyn MarketDataSource>>,
    pub broker: Option<Arc<dyn BrokerSource>>,
    pub execution: Option<Arc<ExecutionService>>,
}

#[derive(Default)]
struct HubState {
    registry: SubscriptionRegistry,
    connections: AHashMap<ConnectionId, OutboundSender>,
    /// Keys whose first upstream subscribe has not returned yet, tagged with
    /// the call that owns them.
    in_flight: AHashMap<SubscriptionKey, (u64, watch::Receiver<Outcome>)>,
    next_flight: u64,
}

/// Upstream subscribe call decided under the lock, issued after it.
#[derive(Debug, Clone, PartialEq)]
enum UpstreamCall {
    Bar { symbols: Vec<String>, timeframe: String },
    Book(Vec<String>),
    Trade(Vec<String>),
    Orders(Vec<String>),
    Account,
    Balance,
}

impl UpstreamCall {
    fn new(topic_type: TopicType, symbols: Vec<String>, timeframe: String) -> Self {
        match topic_type {
            TopicType::Bar => Self::Bar { symbols, timeframe },
            TopicType::Book => Self::Book(symbols),
            TopicType::Trade => Self::Trade(symbols),
            TopicType::Order => Self::Orders(symbols),
            TopicType::Account => Self::Account,
            TopicType::Balance => Self::Balance,
        }
    }
}

/// Outcome of an upstream subscribe call, `None` while it is running.
type Outcome = Option<Result<(), String>>;

/// An upstream call this request owns.
struct Flight {
    generation: u64,
    done: watch::Sender<Outcome>,
}

/// What one subscribe request changed in the registry.
struct Registration {
    /// `(symbol, key)` pairs new to the hub; symbol is empty for singletons.
    fresh: Vec<(String, SubscriptionKey)>,
    /// Keys joined while another request's upstream call was running.
    waits: Vec<(String, watch::Receiver<Outcome>)>,
    flight: Option<Flight>,
}

pub struct ConnectionHub {
    instance_id: String,
    upstream: Upstream,
    state: RwLock<HubState>,
}

impl ConnectionHub {
    pub fn new(instance_id: impl Into<String>, upstream: Upstream) -> Self {
        Self { instance_id: instance_id.into(), upstream, state: RwLock::new(HubState::default()) }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a connection and greet it with `initialize`.
    pub async fn connect(&self, id: &str, tx: OutboundSender) {
        let greeting = ServerMessage::Initialize { instance_id: self.instance_id.clone() };
        match greeting.to_json() {
            Ok(frame) => {
                let _ = tx.try_send(frame);
            }
            Err(e) => error!("[hub] {e}"),
        }
        let mut state = self.state.write().await;
        state.connections.insert(id.to_string(), tx);
        info!("[hub] {id} connected ({} open)", state.connections.len());
    }

    /// Remove `id` from every subscription, then drop its sender. Returns the
    /// keys nobody subscribes to any more.
    pub async fn disconnect(&self, id: &str) -> Vec<SubscriptionKey> {
        let mut state = self.state.write().await;
        let emptied = state.registry.remove_connection_from_all(id);
        state.connections.remove(id);
        info!(
            "[hub] {id} disconnected ({} open, {} subscriptions released)",
            state.connections.len(),
            emptied.len()
        );
        emptied
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Handle one text frame from connection `id`. Every request gets a
    /// reply; the returned error is for the caller's log.
    pub async fn handle_text(&self, id: &str, text: &str) -> Result<(), RelayError> {
        let msg = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                self.send_to(id, &ServerMessage::Error { message: e.to_string() }).await;
                return Err(e);
            }
        };

        match msg {
            ClientMessage::Subscribe { request_type, options } => {
                match self.subscribe(id, &request_type, options.clone()).await {
                    Ok(reply) => {
                        self.send_to(id, &reply).await;
                        Ok(())
                    }
                    Err(e) => {
                        let reply = ServerMessage::SubscriptionFailed {
                            request_type,
                            options,
                            error: Some(e.to_string()),
                        };
                        self.send_to(id, &reply).await;
                        Err(e)
                    }
                }
            }
            ClientMessage::PlaceOrder(request) => {
                let results = self.place_order(*request).await;
                self.send_to(id, &ServerMessage::PlaceOrderResults { results }).await;
                Ok(())
            }
            ClientMessage::Status => {
                let status = self.status().await;
                self.send_to(id, &ServerMessage::ServerStatus(status)).await;
                Ok(())
            }
        }
    }

    /// Register connection `id` for a subscribe request and, for keys that
    /// are new to the hub, call upstream once.
    ///
    /// Returns the acknowledgement to send. Fails only when the request
    /// type is known but the upstream able to serve it was never wired.
    pub async fn subscribe(
        &self,
        id: &str,
        request_type: &str,
        options: Value,
    ) -> Result<ServerMessage, RelayError> {
        let Some(rt) = RequestType::parse(request_type) else {
            warn!("[hub] {id}: unknown requestType '{request_type}'");
            return Ok(failed(request_type, options, "unknown requestType"));
        };
        self.require_upstream(rt)?;

        let topic_type = rt.topic_type();
        let (keyed, ack_narrows, timeframe) = if topic_type.is_per_symbol() {
            let opts: SubscriptionOptions = match serde_json::from_value(options.clone()) {
                Ok(o) => o,
                Err(e) => return Ok(failed(request_type, options, &format!("bad options: {e}"))),
            };
            let mut symbols: Vec<String> = Vec::with_capacity(opts.symbols.len());
            for s in opts.symbols {
                if !s.is_empty() && !symbols.contains(&s) {
                    symbols.push(s);
                }
            }
            if symbols.is_empty() {
                return Ok(failed(request_type, options, "no symbols"));
            }
            let timeframe = match (topic_type, opts.timeframe) {
                (TopicType::Bar, Some(tf)) => tf,
                (TopicType::Bar, None) => return Ok(failed(request_type, options, "timeframe required")),
                (_, _) => String::new(),
            };
            let keyed: Vec<(String, SubscriptionKey)> = symbols
                .into_iter()
                .map(|s| {
                    let key = match topic_type {
                        TopicType::Bar => SubscriptionKey::bar(&s, &timeframe),
                        other => SubscriptionKey::symbol(other, &s),
                    };
                    (s, key)
                })
                .collect();
            (keyed, true, timeframe)
        } else {
            (vec![(String::new(), SubscriptionKey::singleton(topic_type))], false, String::new())
        };

        let Some(reg) = self.register(id, keyed).await else {
            return Ok(failed(request_type, options, "connection closed"));
        };
        let new_symbols: Vec<String> = reg.fresh.iter().map(|(s, _)| s.clone()).collect();

        let mut ack = options;
        if ack_narrows && !new_symbols.is_empty() {
            if let Some(obj) = ack.as_object_mut() {
                obj.insert("symbols".into(), Value::from(new_symbols.clone()));
            }
        }

        if let Some(flight) = reg.flight {
            let call = UpstreamCall::new(topic_type, new_symbols.clone(), timeframe);
            info!("[hub] {id}: upstream {call:?}");
            let result = self.call_upstream(&call).await;
            self.land(&reg.fresh, flight.generation, result.is_ok()).await;
            let outcome = result.as_ref().map(|_| ()).map_err(|e| format!("{e:#}"));
            flight.done.send_replace(Some(outcome));
            if let Err(e) = result {
                error!("[hub] {id}: upstream subscribe failed: {e:#}");
                return Ok(failed(rt.as_str(), ack, &format!("upstream: {e}")));
            }
        }

        // Keys someone else is still subscribing upstream: acknowledge only
        // once that call has landed, and fail with it.
        let mut lost = Vec::new();
        let mut reason = String::new();
        for (symbol, mut rx) in reg.waits {
            let outcome = match rx.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
                Err(_) => Err("upstream call abandoned".to_string()),
            };
            if let Err(e) = outcome {
                lost.push(symbol);
                reason = e;
            }
        }
        if !lost.is_empty() {
            warn!("[hub] {id}: shared upstream subscribe failed for {lost:?}: {reason}");
            let mut options = ack;
            if ack_narrows {
                if let Some(obj) = options.as_object_mut() {
                    obj.insert("symbols".into(), Value::from(lost));
                }
            }
            return Ok(failed(rt.as_str(), options, &format!("upstream: {reason}")));
        }

        if new_symbols.is_empty() {
            debug!("[hub] {id}: {rt} already covered upstream");
        }
        Ok(ServerMessage::SubscriptionSuccess { request_type: rt.to_string(), options: ack })
    }

    /// Add `id` to every key under the write lock. Keys new to the hub are
    /// marked in flight under one shared outcome; keys another request is
    /// still subscribing upstream are returned to wait on. `None` when the
    /// connection is already gone.
    async fn register(&self, id: &str, keyed: Vec<(String, SubscriptionKey)>) -> Option<Registration> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(id) {
            return None;
        }
        let (done, watch_rx) = watch::channel(None);
        let generation = state.next_flight;
        let mut fresh = Vec::new();
        let mut waits = Vec::new();
        for (symbol, key) in keyed {
            if state.registry.add_subscription(id, key.clone()) {
                state.in_flight.insert(key.clone(), (generation, watch_rx.clone()));
                fresh.push((symbol, key));
            } else if let Some((_, rx)) = state.in_flight.get(&key) {
                if rx.has_changed().is_ok() {
                    waits.push((symbol, rx.clone()));
                } else {
                    // Owner went away without an answer.
                    state.in_flight.remove(&key);
                }
            }
        }
        let flight = if fresh.is_empty() {
            None
        } else {
            state.next_flight += 1;
            Some(Flight { generation, done })
        };
        Some(Registration { fresh, waits, flight })
    }

    /// Clear the in-flight marks of a finished upstream call. On failure the
    /// keys are dropped along with every connection that joined meanwhile;
    /// those connections are told through the shared outcome.
    async fn land(&self, fresh: &[(String, SubscriptionKey)], generation: u64, ok: bool) {
        let mut state = self.state.write().await;
        for (_, key) in fresh {
            // The key may have emptied and been claimed by a newer call.
            if state.in_flight.get(key).map(|(g, _)| *g) != Some(generation) {
                continue;
            }
            state.in_flight.remove(key);
            if !ok {
                state.registry.remove_key(key);
            }
        }
    }

    fn require_upstream(&self, rt: RequestType) -> Result<(), RelayError> {
        let wired = match rt.topic_type() {
            TopicType::Bar | TopicType::Book | TopicType::Trade => self.upstream.market_data.is_some(),
            TopicType::Order | TopicType::Account | TopicType::Balance => self.upstream.broker.is_some(),
        };
        if wired { Ok(()) } else { Err(RelayError::MissingUpstream(rt)) }
    }

    async fn call_upstream(&self, call: &UpstreamCall) -> anyhow::Result<()> {
        let md = || {
            self.upstream.market_data.as_ref().ok_or(RelayError::MissingUpstream(RequestType::AddBarSubscriptions))
        };
        let broker = || {
            self.upstream.broker.as_ref().ok_or(RelayError::MissingUpstream(RequestType::AddOrderSubscriptions))
        };
        match call {
            UpstreamCall::Bar { symbols, timeframe } => md()?.subscribe_bar(symbols, timeframe).await,
            UpstreamCall::Book(symbols) => md()?.subscribe_book(symbols).await,
            UpstreamCall::Trade(symbols) => md()?.subscribe_trade(symbols).await,
            UpstreamCall::Orders(symbols) => broker()?.subscribe_order_events(symbols).await,
            UpstreamCall::Account => broker()?.subscribe_account().await,
            UpstreamCall::Balance => broker()?.subscribe_balance().await,
        }
    }

    /// Submit an order through the execution service.
    pub async fn place_order(&self, request: OrderRequest) -> PlaceOrderResult {
        let order_id = request.id.clone();
        let Some(execution) = &self.upstream.execution else {
            return PlaceOrderResult {
                success: false,
                order_id,
                broker_order_id: None,
                error: Some("no broker configured".into()),
            };
        };
        match execution.place_order(request).await {
            Ok(ack) => PlaceOrderResult {
                success: true,
                order_id: ack.order_id,
                broker_order_id: ack.broker_order_id,
                error: None,
            },
            Err(e) => PlaceOrderResult {
                success: false,
                order_id,
                broker_order_id: None,
                error: Some(format!("{e:#}")),
            },
        }
    }

    pub async fn status(&self) -> ServerStatus {
        let state = self.state.read().await;
        ServerStatus {
            instance_id: self.instance_id.clone(),
            connections: state.connections.len(),
            subscriptions: state.registry.snapshot(),
        }
    }

    pub async fn find(&self, key: &SubscriptionKey) -> Option<Subscription> {
        self.state.read().await.registry.find(key).cloned()
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Deliver `payload` to every connection subscribed to `topic`. Returns
    /// the number of connections it was queued for. Topics nobody subscribes
    /// to are dropped silently, malformed ones with a warning.
    pub async fn publish(&self, topic: &str, payload: TopicPayload) -> usize {
        let Some(key) = Topic::parse(topic).and_then(|t| t.subscription_key(&payload)) else {
            warn!("[hub] unroutable topic '{topic}', dropped");
            return 0;
        };
        let frame = match (ServerMessage::Topic { topic: topic.to_string(), payload }).to_json() {
            Ok(f) => f,
            Err(e) => {
                error!("[hub] {topic}: {e}");
                return 0;
            }
        };

        let state = self.state.read().await;
        let Some(sub) = state.registry.find(&key) else {
            return 0;
        };
        let mut delivered = 0;
        for conn in &sub.connections {
            let Some(tx) = state.connections.get(conn) else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("[hub] {conn}: outbound queue full, dropping {topic}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("[hub] {conn}: closed, skipping {topic}");
                }
            }
        }
        delivered
    }

    /// Route one upstream event: prices to the broker, execution reports
    /// through the execution service, then out to subscribers. A report
    /// that came without a symbol takes it from the order it resolved to.
    pub async fn ingest(&self, mut event: SubscriptionEvent) -> usize {
        if let Some(broker) = &self.upstream.broker {
            broker.observe_market(&event).await;
        }
        if let (SubscriptionEvent::OrderExecution(report), Some(execution)) = (&mut event, &self.upstream.execution) {
            if let Some(order) = execution.handle_execution(report).await {
                if report.symbol.is_empty() {
                    report.symbol = order.symbol;
                }
            }
        }
        self.publish_event(event).await
    }

    pub async fn publish_event(&self, event: SubscriptionEvent) -> usize {
        let topic = event.topic();
        self.publish(&topic, event.into()).await
    }

    pub async fn publish_oms(&self, event: OmsEvent) -> usize {
        let topic = event.topic();
        self.publish(&topic, event.into()).await
    }

    async fn send_to(&self, id: &str, msg: &ServerMessage) {
        let frame = match msg.to_json() {
            Ok(f) => f,
            Err(e) => {
                error!("[hub] {id}: {e}");
                return;
            }
        };
        let state = self.state.read().await;
        if let Some(tx) = state.connections.get(id) {
            if tx.try_send(frame).is_err() {
                warn!("[hub] {id}: reply dropped");
            }
        }
    }
}

fn failed(request_type: &str, options: Value, error: &str) -> ServerMessage {
    ServerMessage::SubscriptionFailed {
        request_type: request_type.to_string(),
        options,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use br_core::market_data::Bar;
    use br_core::enums::{ExecutionType, OrderStatus};
    use br_core::trading::{AccountInfo, BrokerBalance, OrderAck, OrderExecution};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSource {
        fn record(&self, call: String) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail { anyhow::bail!("upstream down") } else { Ok(()) }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MarketDataSource for RecordingSource {
        fn name(&self) -> &str {
            "recording"
        }
        async fn subscribe_bar(&self, symbols: &[String], timeframe: &str) -> anyhow::Result<()> {
            self.record(format!("bar {} {timeframe}", symbols.join(",")))
        }
        async fn subscribe_book(&self, symbols: &[String]) -> anyhow::Result<()> {
            self.record(format!("book {}", symbols.join(",")))
        }
        async fn subscribe_trade(&self, symbols: &[String]) -> anyhow::Result<()> {
            self.record(format!("trade {}", symbols.join(",")))
        }
    }

    #[async_trait]
    impl BrokerSource for RecordingSource {
        fn name(&self) -> &str {
            "recording"
        }
        async fn subscribe_order_events(&self, symbols: &[String]) -> anyhow::Result<()> {
            self.record(format!("orders {}", symbols.join(",")))
        }
        async fn subscribe_account(&self) -> anyhow::Result<()> {
            self.record("account".into())
        }
        async fn subscribe_balance(&self) -> anyhow::Result<()> {
            self.record("balance".into())
        }
        async fn submit_order(&self, request: &OrderRequest) -> anyhow::Result<OrderAck> {
            Ok(OrderAck { order_id: request.id.clone(), broker_order_id: None })
        }
        async fn get_account_info(&self, _currency: &str) -> anyhow::Result<AccountInfo> {
            Ok(AccountInfo { last_update_time: 0, balances: vec![] })
        }
        async fn get_last_trade_price(&self, _symbol: &str) -> anyhow::Result<f64> {
            Ok(1.0)
        }
    }

    fn hub_with(source: Arc<RecordingSource>) -> ConnectionHub {
        ConnectionHub::new(
            "hub-test",
            Upstream { market_data: Some(source.clone()), broker: Some(source), execution: None },
        )
    }

    async fn join(hub: &ConnectionHub, id: &str) -> mpsc::Receiver<String> {
        let (tx, mut rx) = mpsc::channel(64);
        hub.connect(id, tx).await;
        let hello: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(hello, json!({"event": "initialize", "instanceId": hub.instance_id()}));
        rx
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    fn bar_request() -> String {
        json!({"requestType": "addBarSubscriptions", "options": {"symbols": ["ADAUSDT"], "timeframe": "1h"}})
            .to_string()
    }

    fn bar(timeframe: &str) -> SubscriptionEvent {
        SubscriptionEvent::Bar(Bar {
            provider_id: "test".into(),
            symbol: "ADAUSDT".into(),
            timeframe: timeframe.into(),
            start: 0,
            end: None,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            trades: None,
            in_progress: false,
        })
    }

    #[tokio::test]
    async fn shared_bar_subscription_lifecycle() {
        let source = Arc::new(RecordingSource::default());
        let hub = hub_with(source.clone());
        let mut a = join(&hub, "A").await;
        let mut b = join(&hub, "B").await;
        let key = SubscriptionKey::bar("ADAUSDT", "1h");

        hub.handle_text("A", &bar_request()).await.unwrap();
        assert_eq!(source.calls(), vec!["bar ADAUSDT 1h"]);
        let ack = next(&mut a);
        assert_eq!(ack["event"], "addSubscription_success");
        assert_eq!(ack["options"]["symbols"], json!(["ADAUSDT"]));

        hub.handle_text("B", &bar_request()).await.unwrap();
        assert_eq!(source.calls().len(), 1);
        assert_eq!(next(&mut b)["event"], "addSubscription_success");
        assert_eq!(hub.find(&key).await.unwrap().connections, vec!["A", "B"]);

        assert_eq!(hub.publish_event(bar("1h")).await, 2);
        assert_eq!(next(&mut a)["payload"]["kind"], "bar");
        assert_eq!(next(&mut b)["topic"], "ADAUSDT.bar");
        assert_eq!(hub.publish_event(bar("1m")).await, 0);

        hub.disconnect("A").await;
        assert_eq!(hub.find(&key).await.unwrap().connections, vec!["B"]);
        assert_eq!(hub.publish_event(bar("1h")).await, 1);

        let emptied = hub.disconnect("B").await;
        assert_eq!(emptied, vec![key.clone()]);
        assert!(hub.find(&key).await.is_none());
    }

    #[tokio::test]
    async fn only_new_symbols_go_upstream() {
        let source = Arc::new(RecordingSource::default());
        let hub = hub_with(source.clone());
        let _a = join(&hub, "A").await;
        let mut b = join(&hub, "B").await;

        hub.subscribe("A", "addBookSubscriptions", json!({"symbols": ["X", "Y", "X"]})).await.unwrap();
        let reply = hub.subscribe("B", "addBookSubscriptions", json!({"symbols": ["Y", "Z"]})).await.unwrap();
        assert_eq!(source.calls(), vec!["book X,Y", "book Z"]);
        let ServerMessage::SubscriptionSuccess { options, .. } = reply else { panic!() };
        assert_eq!(options["symbols"], json!(["Z"]));

        // Fully covered: no upstream call, original symbols echoed.
        hub.handle_text("B", &json!({"requestType": "addBookSubscriptions", "options": {"symbols": ["X"]}}).to_string())
            .await
            .unwrap();
        assert_eq!(source.calls().len(), 2);
        assert_eq!(next(&mut b)["options"]["symbols"], json!(["X"]));
    }

    #[tokio::test]
    async fn singleton_topics_register_every_connection() {
        let source = Arc::new(RecordingSource::default());
        let hub = hub_with(source.clone());
        let mut a = join(&hub, "A").await;
        let mut b = join(&hub, "B").await;

        hub.subscribe("A", "addBalanceSubscription", Value::Null).await.unwrap();
        hub.subscribe("B", "addBalanceSubscription", Value::Null).await.unwrap();
        assert_eq!(source.calls(), vec!["balance"]);

        let bal = BrokerBalance { asset: "USDT".into(), available: 1.0, locked: 0.0 };
        assert_eq!(hub.publish_event(SubscriptionEvent::BrokerBalance(bal)).await, 2);
        assert_eq!(next(&mut a)["topic"], "brokerBalance");
        assert_eq!(next(&mut b)["payload"]["data"]["asset"], "USDT");
    }

    #[tokio::test]
    async fn unknown_request_type_fails_softly() {
        let hub = hub_with(Arc::new(RecordingSource::default()));
        let mut a = join(&hub, "A").await;
        hub.handle_text("A", r#"{"requestType":"addCandleSubscriptions","options":{"symbols":["X"]}}"#)
            .await
            .unwrap();
        let reply = next(&mut a);
        assert_eq!(reply["event"], "addSubscription_failed");
        assert_eq!(reply["options"]["symbols"], json!(["X"]));
    }

    #[tokio::test]
    async fn missing_upstream_is_an_error() {
        let hub = ConnectionHub::new("hub-test", Upstream::default());
        let mut a = join(&hub, "A").await;
        let err = hub.handle_text("A", &bar_request()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingUpstream(RequestType::AddBarSubscriptions)));
        assert_eq!(next(&mut a)["event"], "addSubscription_failed");
        assert!(hub.status().await.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn failed_upstream_rolls_back() {
        let source = Arc::new(RecordingSource { fail: true, ..Default::default() });
        let hub = hub_with(source.clone());
        let _a = join(&hub, "A").await;
        let reply = hub.subscribe("A", "addTradeSubscriptions", json!({"symbols": ["X"]})).await.unwrap();
        assert!(matches!(reply, ServerMessage::SubscriptionFailed { .. }));
        assert!(hub.status().await.subscriptions.is_empty());
    }

    struct SlowSource {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }
        async fn subscribe_bar(&self, _s: &[String], _tf: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_book(&self, _s: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_trade(&self, _s: &[String]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.fail { anyhow::bail!("upstream down") } else { Ok(()) }
        }
    }

    /// A subscribes trade X; B asks for X 50ms later, while A's upstream
    /// call is still running. Returns both replies.
    async fn overlapping_trade_subscribes(hub: &Arc<ConnectionHub>) -> (ServerMessage, ServerMessage) {
        let _a = join(hub, "A").await;
        let _b = join(hub, "B").await;
        let first = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.subscribe("A", "addTradeSubscriptions", json!({"symbols": ["X"]})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = hub.subscribe("B", "addTradeSubscriptions", json!({"symbols": ["X"]})).await.unwrap();
        (first.await.unwrap().unwrap(), second)
    }

    #[tokio::test]
    async fn joiner_shares_failure_of_running_upstream_call() {
        let source = Arc::new(SlowSource { fail: true, calls: AtomicUsize::new(0) });
        let hub = Arc::new(ConnectionHub::new(
            "hub-test",
            Upstream { market_data: Some(source.clone()), ..Default::default() },
        ));
        let (first, second) = overlapping_trade_subscribes(&hub).await;

        assert!(matches!(first, ServerMessage::SubscriptionFailed { .. }));
        let ServerMessage::SubscriptionFailed { options, .. } = &second else {
            panic!("joiner acked while its key was rolled back: {second:?}");
        };
        assert_eq!(options["symbols"], json!(["X"]));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(hub.find(&SubscriptionKey::symbol(TopicType::Trade, "X")).await.is_none());
    }

    #[tokio::test]
    async fn joiner_acked_after_running_upstream_call() {
        let source = Arc::new(SlowSource { fail: false, calls: AtomicUsize::new(0) });
        let hub = Arc::new(ConnectionHub::new(
            "hub-test",
            Upstream { market_data: Some(source.clone()), ..Default::default() },
        ));
        let started = Instant::now();
        let (first, second) = overlapping_trade_subscribes(&hub).await;

        assert!(matches!(first, ServerMessage::SubscriptionSuccess { .. }));
        assert!(matches!(second, ServerMessage::SubscriptionSuccess { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let sub = hub.find(&SubscriptionKey::symbol(TopicType::Trade, "X")).await.unwrap();
        assert_eq!(sub.connections, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn symbol_less_report_routes_by_its_order() {
        let source = Arc::new(RecordingSource::default());
        let (oms_tx, _oms_rx) = mpsc::unbounded_channel();
        let execution = Arc::new(ExecutionService::new(source.clone(), oms_tx));
        let hub = ConnectionHub::new(
            "hub-test",
            Upstream { market_data: None, broker: Some(source), execution: Some(execution) },
        );
        let mut a = join(&hub, "A").await;
        hub.subscribe("A", "addOrderSubscriptions", json!({"symbols": ["ADAUSDT"]})).await.unwrap();

        let request: OrderRequest = serde_json::from_value(json!({
            "id": "o1", "botId": "bot1", "symbol": "ADAUSDT", "side": "BUY", "type": "MARKET", "requestedAmount": 100
        }))
        .unwrap();
        assert!(hub.place_order(request).await.success);

        let report = OrderExecution::new("o1", ExecutionType::New, OrderStatus::Open);
        assert!(report.symbol.is_empty());
        assert_eq!(hub.ingest(SubscriptionEvent::OrderExecution(report)).await, 1);
        assert_eq!(next(&mut a)["topic"], "ADAUSDT.orderExecution");

        // Nothing to take a symbol from.
        let ghost = OrderExecution::new("ghost", ExecutionType::New, OrderStatus::Open);
        assert_eq!(hub.ingest(SubscriptionEvent::OrderExecution(ghost)).await, 0);
    }

    #[tokio::test]
    async fn malformed_and_status() {
        let hub = hub_with(Arc::new(RecordingSource::default()));
        let mut a = join(&hub, "A").await;
        assert!(hub.handle_text("A", "{oops").await.is_err());
        assert_eq!(next(&mut a)["event"], "error");

        hub.subscribe("A", "addOrderSubscriptions", json!({"symbols": ["ADAUSDT"]})).await.unwrap();
        hub.handle_text("A", r#"{"event":"status"}"#).await.unwrap();
        let status = next(&mut a);
        assert_eq!(status["event"], "serverStatus");
        assert_eq!(status["connections"], 1);
        assert_eq!(status["subscriptions"][0]["topicType"], "ORDER");
        assert_eq!(status["subscriptions"][0]["params"]["symbol"], "ADAUSDT");
    }

    #[tokio::test]
    async fn place_order_without_broker() {
        let hub = ConnectionHub::new("hub-test", Upstream::default());
        let mut a = join(&hub, "A").await;
        hub.handle_text(
            "A",
            r#"{"event":"placeOrder","orderRequest":{"id":"o1","symbol":"ADAUSDT","side":"BUY","type":"MARKET","requestedAmount":100}}"#,
        )
        .await
        .unwrap();
        let reply = next(&mut a);
        assert_eq!(reply["event"], "placeOrder_results");
        assert_eq!(reply["results"]["success"], false);
        assert_eq!(reply["results"]["orderId"], "o1");
    }
}
