//! The [`Transport`] trait – the seam between the gateway and a broker.
//!
//! A transport knows how to move raw JSON strings to and from a broker.  It
//! knows nothing about topic conventions, callbacks, or reconnection; those
//! live in [`Gateway`][crate::Gateway].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_types::HalError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::topic::{TopicClass, TopicName};

/// Delivery guarantee tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Telemetry: dropped rather than delayed.
    AtMostOnce,
    /// Commands and status.
    AtLeastOnce,
    /// Emergency stop: highest tier, sent ahead of everything else.
    ExactlyOnce,
}

impl QoS {
    /// Default tier for a topic.
    pub fn for_topic(topic: &TopicName<'_>) -> QoS {
        if topic.is_emergency_stop() {
            return QoS::ExactlyOnce;
        }
        match topic.class {
            TopicClass::Data => QoS::AtMostOnce,
            TopicClass::Cmd | TopicClass::Status => QoS::AtLeastOnce,
        }
    }

    pub fn is_reliable(&self) -> bool {
        *self != QoS::AtMostOnce
    }
}

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            received_at: Utc::now(),
        }
    }

    /// Decode the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HalError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            HalError::validation(format!("malformed payload on {}: {e}", self.topic))
        })
    }
}

/// Events a transport session emits.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    /// The session ended; carries a human-readable reason.
    Disconnected(String),
}

/// Broker connection used by the gateway.
///
/// `connect` opens a session and returns the receiver for its inbound
/// events.  The receiver closing, or a [`TransportEvent::Disconnected`], both
/// mean the session is gone.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, HalError>;

    async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), HalError>;

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), HalError>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), HalError>;

    async fn disconnect(&self);

    /// Broker address for status reporting.
    fn describe(&self) -> String;
}
