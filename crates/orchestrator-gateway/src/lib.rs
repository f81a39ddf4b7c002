//! `orchestrator-gateway` – the communication layer
//!
//! Every component talks to every other component through a [`Gateway`]:
//! commands in, telemetry and status out, emergency stops ahead of all else.
//!
//! # Modules
//!
//! - [`topic`] – `<namespace>/{cmd|data|status}/<component>` naming and
//!   wildcard matching.
//! - [`transport`] – the [`Transport`] seam and the QoS tiers.
//! - [`local`] – in-process broker used by the HAL service and tests.
//! - [`ws`] – WebSocket relay exposing the local broker to other processes.
//! - [`backoff`] – exponential reconnect delay.
//! - [`gateway`] – validation, dispatch, reconnection and offline buffering.

pub mod backoff;
pub mod gateway;
pub mod local;
pub mod topic;
pub mod transport;
pub mod ws;

pub use backoff::Backoff;
pub use gateway::{
    ConnectionCallback, Gateway, GatewayStatus, MessageCallback, SubscriptionId, wait_until,
};
pub use local::{LocalBroker, LocalTransport};
pub use topic::{TopicClass, TopicName, Topics, parse_topic, topic_matches, validate_pattern};
pub use transport::{Message, QoS, Transport, TransportEvent};
pub use ws::{BrokerServer, Frame, WsTransport};
