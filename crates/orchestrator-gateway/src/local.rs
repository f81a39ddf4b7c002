//! In-process broker.
//!
//! [`LocalBroker`] keeps one session per connected client and routes each
//! publish to every session holding a matching pattern.  Every session gets
//! its own bounded queue so a slow subscriber never blocks the others:
//! at-most-once traffic is dropped for a full queue, reliable traffic waits.
//!
//! The broker also backs the WebSocket relay in [`crate::ws`], so in-process
//! components and external processes share one routing table.
//!
//! Fault injection ([`LocalBroker::set_available`],
//! [`LocalBroker::drop_sessions`]) lets tests exercise reconnection without a
//! network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use orchestrator_types::HalError;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::topic::topic_matches;
use crate::transport::{Message, QoS, Transport, TransportEvent};

/// Per-session queue capacity.
const DEFAULT_CAPACITY: usize = 1024;

struct Session {
    client_id: String,
    patterns: HashMap<String, QoS>,
    tx: mpsc::Sender<TransportEvent>,
}

struct BrokerInner {
    sessions: RwLock<HashMap<u64, Session>>,
    next_session: AtomicU64,
    available: AtomicBool,
    published: AtomicU64,
    capacity: usize,
}

/// Shared in-process broker.  Clone it cheaply – all clones share the same
/// routing table.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                available: AtomicBool::new(true),
                published: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// A transport that opens sessions on this broker under `client_id`.
    pub fn transport(&self, client_id: impl Into<String>) -> LocalTransport {
        LocalTransport {
            broker: self.clone(),
            client_id: client_id.into(),
            session: Mutex::new(None),
        }
    }

    /// When `false`, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Disconnect every session, as a broker restart would.
    pub fn drop_sessions(&self) {
        let sessions: Vec<Session> = self.inner.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            debug!(client = %session.client_id, "dropping broker session");
            let _ = session
                .tx
                .try_send(TransportEvent::Disconnected("broker dropped the session".to_string()));
        }
    }

    /// Total number of publishes the broker has accepted.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    fn open_session(&self, client_id: &str) -> Result<(u64, mpsc::Receiver<TransportEvent>), HalError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(HalError::Connection("local broker unavailable".to_string()));
        }
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions.write().insert(
            id,
            Session {
                client_id: client_id.to_string(),
                patterns: HashMap::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    fn close_session(&self, id: u64) {
        self.inner.sessions.write().remove(&id);
    }

    fn has_session(&self, id: u64) -> bool {
        self.inner.sessions.read().contains_key(&id)
    }

    fn set_pattern(&self, id: u64, pattern: &str, qos: Option<QoS>) -> Result<(), HalError> {
        let mut sessions = self.inner.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| HalError::Connection("session closed".to_string()))?;
        match qos {
            Some(qos) => {
                session.patterns.insert(pattern.to_string(), qos);
            }
            None => {
                session.patterns.remove(pattern);
            }
        }
        Ok(())
    }

    async fn route(&self, topic: &str, payload: &str, qos: QoS) {
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        let targets: Vec<(String, mpsc::Sender<TransportEvent>)> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|s| s.patterns.keys().any(|p| topic_matches(p, topic)))
            .map(|s| (s.client_id.clone(), s.tx.clone()))
            .collect();

        for (client, tx) in targets {
            let event = TransportEvent::Message(Message::new(topic, payload, qos));
            if qos.is_reliable() {
                if tx.send(event).await.is_err() {
                    debug!(client = %client, topic, "session closed during delivery");
                }
            } else if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
                warn!(client = %client, topic, "subscriber queue full, dropping telemetry");
            }
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// [`Transport`] implementation backed by a [`LocalBroker`].
pub struct LocalTransport {
    broker: LocalBroker,
    client_id: String,
    session: Mutex<Option<u64>>,
}

impl LocalTransport {
    fn current(&self) -> Result<u64, HalError> {
        match *self.session.lock() {
            Some(id) if self.broker.has_session(id) => Ok(id),
            _ => Err(HalError::Connection(format!(
                "{} is not connected",
                self.client_id
            ))),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, HalError> {
        let (id, rx) = self.broker.open_session(&self.client_id)?;
        if let Some(previous) = self.session.lock().replace(id) {
            self.broker.close_session(previous);
        }
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), HalError> {
        self.current()?;
        self.broker.route(topic, payload, qos).await;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), HalError> {
        let id = self.current()?;
        self.broker.set_pattern(id, pattern, Some(qos))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), HalError> {
        let id = self.current()?;
        self.broker.set_pattern(id, pattern, None)
    }

    async fn disconnect(&self) {
        if let Some(id) = self.session.lock().take() {
            self.broker.close_session(id);
        }
    }

    fn describe(&self) -> String {
        format!("local://{}", self.client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn routes_to_matching_sessions_only() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let a = broker.transport("a");
        let b = broker.transport("b");
        let mut rx_a = a.connect().await?;
        let mut rx_b = b.connect().await?;
        a.subscribe("orchestrator/data/+", QoS::AtMostOnce).await?;
        b.subscribe("orchestrator/cmd/+", QoS::AtLeastOnce).await?;

        b.publish("orchestrator/data/lidar", "{}", QoS::AtMostOnce).await?;

        match rx_a.recv().await {
            Some(TransportEvent::Message(m)) => assert_eq!(m.topic, "orchestrator/data/lidar"),
            other => panic!("unexpected event {other:?}"),
        }
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(nothing.is_err(), "b must not receive data it did not subscribe to");
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_connections() {
        let broker = LocalBroker::default();
        broker.set_available(false);
        let t = broker.transport("a");
        assert!(matches!(t.connect().await, Err(HalError::Connection(_))));
        assert!(t.publish("orchestrator/data/x", "{}", QoS::AtMostOnce).await.is_err());
    }

    #[tokio::test]
    async fn dropped_sessions_are_notified() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let t = broker.transport("a");
        let mut rx = t.connect().await?;
        broker.drop_sessions();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Disconnected(_))));
        assert!(t.subscribe("orchestrator/#", QoS::AtLeastOnce).await.is_err());
        assert_eq!(broker.session_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_drops_telemetry_without_blocking() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::new(4);
        let slow = broker.transport("slow");
        let _rx = slow.connect().await?;
        slow.subscribe("orchestrator/data/+", QoS::AtMostOnce).await?;
        let fast = broker.transport("fast");
        let _fast_rx = fast.connect().await?;
        for _ in 0..100 {
            fast.publish("orchestrator/data/lidar", "{}", QoS::AtMostOnce).await?;
        }
        assert_eq!(broker.published_count(), 100);
        Ok(())
    }
}
