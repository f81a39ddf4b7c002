//! WebSocket relay for out-of-process components.
//!
//! [`BrokerServer`] exposes a [`LocalBroker`] over WebSocket; each client
//! connection becomes one broker session.  [`WsTransport`] is the matching
//! client-side [`Transport`], used by the standalone safety monitor.
//!
//! Frames are JSON text messages tagged by `op`:
//!
//! ```text
//! {"op":"publish","topic":"orchestrator/cmd/estop","qos":"exactly_once","payload":"{...}"}
//! {"op":"subscribe","pattern":"orchestrator/data/lidar","qos":"at_most_once"}
//! {"op":"unsubscribe","pattern":"orchestrator/data/lidar"}
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use orchestrator_types::HalError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::local::LocalBroker;
use crate::transport::{Message, QoS, Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Publish { topic: String, qos: QoS, payload: String },
    Subscribe { pattern: String, qos: QoS },
    Unsubscribe { pattern: String },
}

impl Frame {
    fn encode(&self) -> Result<WsMessage, HalError> {
        let json = serde_json::to_string(self)?;
        Ok(WsMessage::Text(json.into()))
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves a [`LocalBroker`] to WebSocket clients.
#[derive(Clone)]
pub struct BrokerServer {
    broker: LocalBroker,
}

impl BrokerServer {
    pub fn new(broker: LocalBroker) -> Self {
        Self { broker }
    }

    /// Bind `addr` and serve until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Connection`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), HalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HalError::Connection(format!("ws bind error on {addr}: {e}")))?;
        info!(addr = %addr, "broker relay listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept clients on an already bound listener.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_client(stream, peer, client_shutdown).await {
                                error!(peer = %peer, error = %e, "ws client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "ws accept error"),
                },
            }
        }
        info!("broker relay stopped");
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HalError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| HalError::Connection(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let session = self.broker.transport(format!("ws_{peer}"));
        let mut events = session.connect().await?;
        info!(peer = %peer, "relay client connected");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Message(msg)) => {
                        let frame = Frame::Publish { topic: msg.topic, qos: msg.qos, payload: msg.payload };
                        if ws_tx.send(frame.encode()?).await.is_err() {
                            break;
                        }
                    }
                    Some(TransportEvent::Disconnected(_)) | None => break,
                },
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(Frame::Publish { topic, qos, payload }) => {
                            session.publish(&topic, &payload, qos).await?;
                        }
                        Ok(Frame::Subscribe { pattern, qos }) => session.subscribe(&pattern, qos).await?,
                        Ok(Frame::Unsubscribe { pattern }) => session.unsubscribe(&pattern).await?,
                        Err(e) => warn!(peer = %peer, error = %e, "ignoring malformed frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        session.disconnect().await;
        info!(peer = %peer, "relay client disconnected");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct WsSession {
    normal: mpsc::Sender<WsMessage>,
    urgent: mpsc::Sender<WsMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// [`Transport`] that talks to a [`BrokerServer`].
///
/// Outgoing frames go through two queues; the writer always drains the
/// emergency queue first so a stop command never waits behind telemetry.
pub struct WsTransport {
    url: String,
    session: Mutex<Option<WsSession>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    fn sender(&self, qos: QoS) -> Result<mpsc::Sender<WsMessage>, HalError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| HalError::Connection(format!("not connected to {}", self.url)))?;
        Ok(if qos == QoS::ExactlyOnce {
            session.urgent.clone()
        } else {
            session.normal.clone()
        })
    }

    async fn send_frame(&self, frame: Frame, qos: QoS) -> Result<(), HalError> {
        let tx = self.sender(qos)?;
        tx.send(frame.encode()?)
            .await
            .map_err(|_| HalError::Connection(format!("ws writer for {} has stopped", self.url)))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, HalError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| HalError::Connection(format!("ws connect to {}: {e}", self.url)))?;
        let (mut sink, mut source) = stream.split();

        let (normal, mut normal_rx) = mpsc::channel::<WsMessage>(1024);
        let (urgent, mut urgent_rx) = mpsc::channel::<WsMessage>(64);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let writer = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    Some(m) = urgent_rx.recv() => m,
                    Some(m) = normal_rx.recv() => m,
                    else => break,
                };
                if sink.send(next).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(Frame::Publish { topic, qos, payload }) => {
                            let event = TransportEvent::Message(Message::new(topic, payload, qos));
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "ignoring malformed frame from broker"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break "broker closed the connection".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    Some(Ok(_)) => {}
                }
            };
            let _ = events_tx.send(TransportEvent::Disconnected(reason)).await;
        });

        let previous = self.session.lock().replace(WsSession {
            normal,
            urgent,
            writer,
            reader,
        });
        if let Some(old) = previous {
            old.reader.abort();
            old.writer.abort();
        }
        info!(url = %self.url, "ws transport connected");
        Ok(events_rx)
    }

    async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), HalError> {
        let frame = Frame::Publish {
            topic: topic.to_string(),
            qos,
            payload: payload.to_string(),
        };
        self.send_frame(frame, qos).await
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), HalError> {
        let frame = Frame::Subscribe {
            pattern: pattern.to_string(),
            qos,
        };
        self.send_frame(frame, QoS::AtLeastOnce).await
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), HalError> {
        let frame = Frame::Unsubscribe {
            pattern: pattern.to_string(),
        };
        self.send_frame(frame, QoS::AtLeastOnce).await
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(WsSession {
            normal,
            urgent,
            writer,
            reader,
        }) = session
        {
            drop(normal);
            drop(urgent);
            // The writer exits once both queues are closed and drained.
            let _ = writer.await;
            reader.abort();
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
