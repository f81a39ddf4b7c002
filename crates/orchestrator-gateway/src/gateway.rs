//! [`Gateway`] – reliable publish/subscribe over a [`Transport`].
//!
//! Responsibilities:
//!
//! * validate topics and patterns before any transport I/O,
//! * stamp outgoing JSON objects with a `timestamp` when they lack one,
//! * route inbound messages to every matching callback, each isolated from
//!   the others' errors and panics,
//! * keep the session alive: on loss, reconnect with exponential backoff,
//!   re-subscribe every pattern and flush messages queued while offline,
//! * stop all of that promptly when [`Gateway::disconnect`] is called.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use orchestrator_types::{EmergencyStop, GatewayConfig, HalError, StatusReport, TelemetrySample};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::topic::{Topics, parse_topic, topic_matches, validate_pattern};
use crate::transport::{Message, QoS, Transport, TransportEvent};

/// Callback invoked for every message matching a subscription.
pub type MessageCallback = Arc<dyn Fn(&Message) -> Result<(), HalError> + Send + Sync>;

/// Callback invoked with `true` on connect and `false` on disconnect.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`Gateway::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Route {
    id: SubscriptionId,
    pattern: String,
    qos: QoS,
    callback: MessageCallback,
}

struct Outgoing {
    topic: String,
    payload: String,
    qos: QoS,
}

/// Snapshot returned by [`Gateway::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStatus {
    pub connected: bool,
    pub broker: String,
    pub subscriptions: Vec<String>,
    pub reconnect_attempt: u32,
    pub next_delay_ms: u64,
    pub pending: usize,
}

struct GatewayInner {
    topics: Topics,
    transport: Arc<dyn Transport>,
    routes: RwLock<Vec<Route>>,
    connection_callbacks: RwLock<Vec<ConnectionCallback>>,
    connected: AtomicBool,
    backoff: Mutex<Backoff>,
    pending: Mutex<VecDeque<Outgoing>>,
    pending_capacity: usize,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Shared gateway handle.  Clone it cheaply – all clones share one session,
/// one routing table and one reconnect task.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, transport: Arc<dyn Transport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(GatewayInner {
                topics: Topics::new(config.namespace.clone()),
                transport,
                routes: RwLock::new(Vec::new()),
                connection_callbacks: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                backoff: Mutex::new(Backoff::new(
                    config.reconnect_base_delay(),
                    config.reconnect_max_delay(),
                )),
                pending: Mutex::new(VecDeque::new()),
                pending_capacity: config.offline_buffer.max(1),
                next_id: AtomicU64::new(1),
                shutdown,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    /// Open the session and start the background supervisor.
    ///
    /// When the first attempt fails the supervisor is still started and
    /// keeps retrying with backoff; the error is returned so the caller knows
    /// the gateway is not yet connected.
    pub async fn connect(&self) -> Result<(), HalError> {
        if self.inner.supervisor.lock().is_some() {
            return if self.is_connected() {
                Ok(())
            } else {
                Err(HalError::Connection("reconnect already in progress".to_string()))
            };
        }
        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();

        let (first, result) = match self.inner.transport.connect().await {
            Ok(events) => {
                self.inner.on_connected().await;
                (Some(events), Ok(()))
            }
            Err(e) => {
                warn!(broker = %self.inner.transport.describe(), error = %e, "initial connect failed, retrying in background");
                (None, Err(e))
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.supervise(first, shutdown).await });
        *self.inner.supervisor.lock() = Some(handle);
        result
    }

    /// Stop the reconnect loop, wait for it to exit, and close the session.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "gateway supervisor ended abnormally");
        }
        self.inner.transport.disconnect().await;
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.notify_connection(false);
        }
        info!(broker = %self.inner.transport.describe(), "gateway disconnected");
    }

    /// Register a callback fired on every connection state change.
    pub fn on_connection_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.connection_callbacks.write().push(Arc::new(callback));
    }

    pub fn status(&self) -> GatewayStatus {
        let backoff = self.inner.backoff.lock().clone();
        let mut subscriptions: Vec<String> =
            self.inner.routes.read().iter().map(|r| r.pattern.clone()).collect();
        subscriptions.sort();
        subscriptions.dedup();
        GatewayStatus {
            connected: self.is_connected(),
            broker: self.inner.transport.describe(),
            subscriptions,
            reconnect_attempt: backoff.attempt(),
            next_delay_ms: u64::try_from(backoff.peek().as_millis()).unwrap_or(u64::MAX),
            pending: self.inner.pending.lock().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Serialise `payload` and publish it on `topic`.
    ///
    /// `Ok` means the message reached the transport or, for reliable tiers
    /// while offline, was queued for delivery after reconnect.
    ///
    /// # Errors
    ///
    /// * [`HalError::Validation`] for a malformed topic; nothing is sent.
    /// * [`HalError::Connection`] for at-most-once traffic while offline.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
    ) -> Result<(), HalError> {
        parse_topic(self.inner.topics.namespace(), topic)?;
        let mut value = serde_json::to_value(payload)?;
        stamp(&mut value);
        let body = serde_json::to_string(&value)?;
        self.inner.send(topic.to_string(), body, qos).await
    }

    /// Publish using the default tier for the topic's class.
    pub async fn publish_default<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), HalError> {
        let qos = QoS::for_topic(&parse_topic(self.inner.topics.namespace(), topic)?);
        self.publish(topic, payload, qos).await
    }

    pub async fn publish_telemetry<T: Serialize>(&self, sample: &TelemetrySample<T>) -> Result<(), HalError> {
        let topic = self.inner.topics.data(&sample.device_id);
        self.publish(&topic, sample, QoS::AtMostOnce).await
    }

    pub async fn publish_status(&self, report: &StatusReport) -> Result<(), HalError> {
        let topic = self.inner.topics.status(&report.device_id);
        self.publish(&topic, report, QoS::AtLeastOnce).await
    }

    pub async fn publish_emergency_stop(&self, estop: &EmergencyStop) -> Result<(), HalError> {
        let topic = self.inner.topics.estop();
        self.publish(&topic, estop, QoS::ExactlyOnce).await
    }

    // -----------------------------------------------------------------------
    // Subscribing
    // -----------------------------------------------------------------------

    /// Register `callback` for every topic matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for a malformed pattern.  A transport
    /// failure is logged only; the pattern is re-sent on reconnect.
    pub async fn subscribe<F>(&self, pattern: &str, qos: QoS, callback: F) -> Result<SubscriptionId, HalError>
    where
        F: Fn(&Message) -> Result<(), HalError> + Send + Sync + 'static,
    {
        validate_pattern(self.inner.topics.namespace(), pattern)?;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let first_for_pattern = {
            let mut routes = self.inner.routes.write();
            let first = !routes.iter().any(|r| r.pattern == pattern);
            routes.push(Route {
                id,
                pattern: pattern.to_string(),
                qos,
                callback: Arc::new(callback),
            });
            first
        };
        if first_for_pattern && self.is_connected() {
            if let Err(e) = self.inner.transport.subscribe(pattern, qos).await {
                warn!(pattern, error = %e, "subscribe failed, will retry after reconnect");
            }
        }
        debug!(pattern, ?qos, "subscribed");
        Ok(id)
    }

    /// Subscribe and receive matching messages on a bounded channel.
    ///
    /// When the receiver falls behind, further messages are dropped and the
    /// drop is logged by the dispatcher.
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
        qos: QoS,
        capacity: usize,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Message>), HalError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let label = pattern.to_string();
        let id = self
            .subscribe(pattern, qos, move |msg| {
                tx.try_send(msg.clone()).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        HalError::Connection(format!("subscriber queue for {label} is full"))
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        HalError::Connection(format!("subscriber for {label} has gone away"))
                    }
                })
            })
            .await?;
        Ok((id, rx))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut routes = self.inner.routes.write();
            let Some(pos) = routes.iter().position(|r| r.id == id) else {
                return;
            };
            let route = routes.remove(pos);
            let still_used = routes.iter().any(|r| r.pattern == route.pattern);
            (!still_used).then_some(route.pattern)
        };
        if let Some(pattern) = removed
            && self.is_connected()
            && let Err(e) = self.inner.transport.unsubscribe(&pattern).await
        {
            warn!(pattern = %pattern, error = %e, "unsubscribe failed");
        }
    }
}

impl GatewayInner {
    async fn send(&self, topic: String, payload: String, qos: QoS) -> Result<(), HalError> {
        if self.connected.load(Ordering::SeqCst) {
            match self.transport.publish(&topic, &payload, qos).await {
                Ok(()) => return Ok(()),
                Err(e) if !qos.is_reliable() => return Err(e),
                Err(e) => warn!(topic = %topic, error = %e, "publish failed, queueing for retry"),
            }
        } else if !qos.is_reliable() {
            return Err(HalError::Connection(format!("not connected, dropped {topic}")));
        }
        self.enqueue(Outgoing { topic, payload, qos });
        Ok(())
    }

    fn enqueue(&self, msg: Outgoing) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.pending_capacity
            && let Some(dropped) = pending.pop_front()
        {
            warn!(topic = %dropped.topic, "offline buffer full, dropping oldest message");
        }
        pending.push_back(msg);
    }

    async fn flush_pending(&self) {
        let drained: Vec<Outgoing> = self.pending.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        let (urgent, normal): (Vec<Outgoing>, Vec<Outgoing>) =
            drained.into_iter().partition(|m| m.qos == QoS::ExactlyOnce);
        info!(urgent = urgent.len(), normal = normal.len(), "flushing offline buffer");
        let mut failed = Vec::new();
        for msg in urgent.into_iter().chain(normal) {
            if let Err(e) = self.transport.publish(&msg.topic, &msg.payload, msg.qos).await {
                warn!(topic = %msg.topic, error = %e, "flush failed, keeping message");
                failed.push(msg);
            }
        }
        if !failed.is_empty() {
            let mut pending = self.pending.lock();
            for msg in failed.into_iter().rev() {
                pending.push_front(msg);
            }
        }
    }

    async fn on_connected(&self) {
        self.backoff.lock().reset();
        // Raised before the snapshot: a route added after it sees the flag
        // and subscribes itself.
        self.connected.store(true, Ordering::SeqCst);
        let patterns: Vec<(String, QoS)> = {
            let routes = self.routes.read();
            let mut seen: Vec<(String, QoS)> = Vec::new();
            for route in routes.iter() {
                if !seen.iter().any(|(p, _)| *p == route.pattern) {
                    seen.push((route.pattern.clone(), route.qos));
                }
            }
            seen
        };
        for (pattern, qos) in &patterns {
            if let Err(e) = self.transport.subscribe(pattern, *qos).await {
                warn!(pattern = %pattern, error = %e, "re-subscribe failed");
            }
        }
        info!(broker = %self.transport.describe(), subscriptions = patterns.len(), "gateway connected");
        self.flush_pending().await;
        self.notify_connection(true);
    }

    fn on_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(broker = %self.transport.describe(), reason, "gateway connection lost");
            self.notify_connection(false);
        }
    }

    fn notify_connection(&self, connected: bool) {
        let callbacks: Vec<ConnectionCallback> = self.connection_callbacks.read().clone();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(connected))).is_err() {
                error!(connected, "connection callback panicked");
            }
        }
    }

    fn dispatch(&self, msg: &Message) {
        let matched: Vec<(String, MessageCallback)> = self
            .routes
            .read()
            .iter()
            .filter(|r| topic_matches(&r.pattern, &msg.topic))
            .map(|r| (r.pattern.clone(), r.callback.clone()))
            .collect();
        for (pattern, callback) in matched {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(msg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(topic = %msg.topic, pattern = %pattern, error = %e, "subscriber callback failed")
                }
                Err(_) => error!(topic = %msg.topic, pattern = %pattern, "subscriber callback panicked"),
            }
        }
    }

    /// Pump inbound events while connected, reconnect with backoff while not.
    async fn supervise(
        self: Arc<Self>,
        mut events: Option<mpsc::Receiver<TransportEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if let Some(mut rx) = events.take() {
                let reason = loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return,
                        event = rx.recv() => match event {
                            Some(TransportEvent::Message(msg)) => self.dispatch(&msg),
                            Some(TransportEvent::Disconnected(reason)) => break reason,
                            None => break "transport closed".to_string(),
                        },
                    }
                };
                self.on_disconnected(&reason);
            }

            let (delay, attempt) = {
                let mut backoff = self.backoff.lock();
                let attempt = backoff.attempt();
                (backoff.next_delay(), attempt)
            };
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                return;
            }
            match self.transport.connect().await {
                Ok(rx) => {
                    self.on_connected().await;
                    events = Some(rx);
                }
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }
}

/// Insert an RFC 3339 `timestamp` into JSON objects that lack one.
fn stamp(value: &mut Value) {
    if let Value::Object(map) = value
        && !map.contains_key("timestamp")
    {
        map.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
#[doc(hidden)]
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBroker;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            reconnect_base_delay_secs: 0.01,
            reconnect_max_delay_secs: 0.05,
            ..GatewayConfig::default()
        }
    }

    fn gateway(broker: &LocalBroker, client: &str) -> Gateway {
        Gateway::new(&fast_config(), Arc::new(broker.transport(client)))
    }

    #[tokio::test]
    async fn malformed_topic_is_rejected_without_io() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        gw.connect().await?;

        let result = gw.publish("orchestrator/bogus/lidar", &json!({"x": 1}), QoS::AtMostOnce).await;
        assert!(matches!(result, Err(HalError::Validation(_))));
        assert!(gw.publish("lidar", &json!({}), QoS::AtMostOnce).await.is_err());
        assert_eq!(broker.published_count(), 0);
        gw.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_pattern_is_rejected() {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        let result = gw.subscribe("orchestrator/#/x", QoS::AtMostOnce, |_| Ok(())).await;
        assert!(matches!(result, Err(HalError::Validation(_))));
    }

    #[tokio::test]
    async fn wildcard_dispatch_isolates_failing_callbacks() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        gw.connect().await?;

        let hits = Arc::new(AtomicUsize::new(0));
        gw.subscribe("orchestrator/data/+", QoS::AtMostOnce, |_| {
            Err(HalError::validation("boom"))
        })
        .await?;
        gw.subscribe("orchestrator/data/+", QoS::AtMostOnce, |_| panic!("callback bug")).await?;
        let counter = hits.clone();
        gw.subscribe("orchestrator/#", QoS::AtMostOnce, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await?;
        let counter = hits.clone();
        gw.subscribe("orchestrator/data/lidar", QoS::AtMostOnce, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await?;

        gw.publish("orchestrator/data/lidar", &json!({"ranges": []}), QoS::AtMostOnce).await?;
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 2).await);

        // The gateway keeps routing after the panic.
        gw.publish("orchestrator/data/lidar", &json!({}), QoS::AtMostOnce).await?;
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 4).await);
        gw.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn outgoing_objects_get_a_timestamp() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        gw.connect().await?;
        let (_, mut rx) = gw.subscribe_channel("orchestrator/status/+", QoS::AtLeastOnce, 8).await?;

        gw.publish("orchestrator/status/robot", &json!({"status": "idle"}), QoS::AtLeastOnce).await?;
        gw.publish(
            "orchestrator/status/robot",
            &json!({"status": "idle", "timestamp": "2024-01-01T00:00:00Z"}),
            QoS::AtLeastOnce,
        )
        .await?;

        let first: Value = rx.recv().await.ok_or("no message")?.json()?;
        assert!(first["timestamp"].is_string());
        let second: Value = rx.recv().await.ok_or("no message")?.json()?;
        assert_eq!(second["timestamp"], "2024-01-01T00:00:00Z");
        gw.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes_after_broker_drop() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        gw.on_connection_change(move |up| seen.lock().push(up));
        gw.on_connection_change(|_| panic!("faulty listener"));
        gw.connect().await?;
        let (_, mut rx) = gw.subscribe_channel("orchestrator/cmd/+", QoS::AtLeastOnce, 8).await?;

        broker.drop_sessions();
        assert!(wait_until(Duration::from_secs(2), || transitions.lock().len() >= 2).await);
        assert_eq!(transitions.lock()[..2], [true, false]);
        assert!(wait_until(Duration::from_secs(2), || gw.is_connected()).await);
        assert_eq!(gw.status().reconnect_attempt, 0);

        let other = gateway(&broker, "ops");
        other.connect().await?;
        other.publish("orchestrator/cmd/left_motor", &json!({"action": "stop"}), QoS::AtLeastOnce).await?;
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.ok_or("closed")?;
        assert_eq!(msg.topic, "orchestrator/cmd/left_motor");
        other.disconnect().await;
        gw.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn offline_reliable_messages_flush_emergency_first() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let listener = gateway(&broker, "listener");
        listener.connect().await?;
        let (_, mut rx) = listener.subscribe_channel("orchestrator/#", QoS::AtLeastOnce, 16).await?;

        broker.set_available(false);
        let gw = gateway(&broker, "hal");
        assert!(gw.connect().await.is_err());

        let telemetry = gw.publish("orchestrator/data/lidar", &json!({}), QoS::AtMostOnce).await;
        assert!(matches!(telemetry, Err(HalError::Connection(_))));
        gw.publish("orchestrator/status/left_motor", &json!({"status": "ready"}), QoS::AtLeastOnce).await?;
        gw.publish_emergency_stop(&EmergencyStop::new("operator", None)).await?;
        assert_eq!(gw.status().pending, 2);

        broker.set_available(true);
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.ok_or("closed")?;
        assert_eq!(first.topic, "orchestrator/cmd/estop");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.ok_or("closed")?;
        assert_eq!(second.topic, "orchestrator/status/left_motor");
        assert_eq!(gw.status().pending, 0);
        gw.disconnect().await;
        listener.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_stops_the_reconnect_loop() {
        let broker = LocalBroker::default();
        broker.set_available(false);
        let gw = gateway(&broker, "hal");
        assert!(gw.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gw.status().reconnect_attempt > 0);

        let done = tokio::time::timeout(Duration::from_secs(1), gw.disconnect()).await;
        assert!(done.is_ok(), "disconnect must join the reconnect task promptly");
        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!gw.is_connected());
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let gw = gateway(&broker, "hal");
        gw.connect().await?;
        let (id, mut rx) = gw.subscribe_channel("orchestrator/data/+", QoS::AtMostOnce, 8).await?;
        gw.unsubscribe(id).await;
        gw.publish("orchestrator/data/lidar", &json!({}), QoS::AtMostOnce).await?;
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(nothing, Ok(None) | Err(_)));
        assert!(gw.status().subscriptions.is_empty());
        gw.disconnect().await;
        Ok(())
    }

    /// Records subscriptions and holds the first one until released.
    #[derive(Default)]
    struct GatedTransport {
        subscribed: Mutex<Vec<String>>,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, HalError> {
            let (tx, rx) = mpsc::channel(8);
            *self.events.lock() = Some(tx);
            Ok(rx)
        }

        async fn publish(&self, _topic: &str, _payload: &str, _qos: QoS) -> Result<(), HalError> {
            Ok(())
        }

        async fn subscribe(&self, pattern: &str, _qos: QoS) -> Result<(), HalError> {
            let first = {
                let mut subscribed = self.subscribed.lock();
                subscribed.push(pattern.to_string());
                subscribed.len() == 1
            };
            if first {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(())
        }

        async fn unsubscribe(&self, _pattern: &str) -> Result<(), HalError> {
            Ok(())
        }

        async fn disconnect(&self) {
            self.events.lock().take();
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_during_resubscribe_reaches_the_transport() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(GatedTransport::default());
        let gw = Gateway::new(&fast_config(), transport.clone());
        gw.subscribe("orchestrator/cmd/left_motor", QoS::AtLeastOnce, |_| Ok(())).await?;

        let connecting = tokio::spawn({
            let gw = gw.clone();
            async move { gw.connect().await }
        });
        // The existing pattern is being re-sent; the routing snapshot is taken.
        tokio::time::timeout(Duration::from_secs(1), transport.entered.notified()).await?;
        gw.subscribe("orchestrator/cmd/right_motor", QoS::AtLeastOnce, |_| Ok(())).await?;
        transport.release.notify_one();
        connecting.await??;

        let subscribed = transport.subscribed.lock().clone();
        assert!(
            subscribed.iter().any(|p| p == "orchestrator/cmd/right_motor"),
            "{subscribed:?}"
        );
        assert!(gw.is_connected());
        gw.disconnect().await;
        Ok(())
    }
}
