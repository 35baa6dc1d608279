//! Transport seam between a relay connection and the network.
//!
//! A [`Transport`] opens a message-oriented channel to a relay. The default
//! [`WebSocketTransport`] speaks WebSocket through `tokio-tungstenite`;
//! [`MemoryTransport`] keeps everything in process so the pool can be driven
//! deterministically from tests or embedded relays.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::relay_url::RelayUrl;

/// Inbound unit delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    /// Traffic that carries no protocol message (ping, pong, binary).
    Heartbeat,
    /// The channel is gone; carries a reason when one is known.
    Closed(Option<String>),
}

/// An open channel to one relay. Dropping `outbound` closes the channel.
#[derive(Debug)]
pub struct TransportChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportFrame>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel. Resolves once the relay accepted the connection.
    async fn open(&self, url: &RelayUrl) -> Result<TransportChannel>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &RelayUrl) -> Result<TransportChannel> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_url = url.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    warn!("websocket write error on {}: {}", writer_url, error);
                    break;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
            debug!("websocket writer stopped for {}", writer_url);
        });

        let reader_url = url.clone();
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = reader.next().await {
                let forwarded = match frame {
                    Ok(Message::Text(text)) => TransportFrame::Text(text.as_str().to_string()),
                    Ok(Message::Close(close)) => {
                        reason = close.map(|frame| frame.reason.to_string());
                        break;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {
                        TransportFrame::Heartbeat
                    }
                    Ok(Message::Frame(_)) => continue,
                    Err(error) => {
                        warn!("websocket read error on {}: {}", reader_url, error);
                        reason = Some(error.to_string());
                        break;
                    }
                };
                if inbound_tx.send(forwarded).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportFrame::Closed(reason));
        });

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// How a [`MemoryTransport`] answers a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    Refuse,
    /// Never resolves, so only a connect timeout ends the attempt.
    Hang,
}

/// Relay side of an accepted in-memory connection.
#[derive(Debug)]
pub struct MemorySession {
    pub url: RelayUrl,
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<TransportFrame>,
}

impl MemorySession {
    /// Next text frame written by the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next client frame decoded as JSON. Undecodable frames are skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(text) = self.recv().await {
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(error) => warn!("memory session {} got non-JSON frame: {}", self.url, error),
            }
        }
        None
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.to_client
            .send(TransportFrame::Text(text.into()))
            .map_err(|_| ClientError::Connection(format!("{} client side is gone", self.url)))
    }

    pub fn send_json(&self, value: &Value) -> Result<()> {
        self.send_text(serde_json::to_string(value)?)
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.to_client
            .send(TransportFrame::Heartbeat)
            .map_err(|_| ClientError::Connection(format!("{} client side is gone", self.url)))
    }

    /// Close from the relay side.
    pub fn close(self) {
        let _ = self
            .to_client
            .send(TransportFrame::Closed(Some("closed by relay".to_string())));
    }
}

/// In-process transport. Every accepted connection is handed out as a
/// [`MemorySession`] on the receiver returned by [`MemoryTransport::new`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    sessions: mpsc::UnboundedSender<MemorySession>,
    behaviors: Arc<Mutex<HashMap<RelayUrl, ConnectBehavior>>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
        let (sessions, accepted) = mpsc::unbounded_channel();
        (
            Self {
                sessions,
                behaviors: Arc::new(Mutex::new(HashMap::new())),
            },
            accepted,
        )
    }

    /// Change how future connect attempts to `url` are answered.
    pub fn set_behavior(&self, url: &RelayUrl, behavior: ConnectBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), behavior);
    }

    fn behavior(&self, url: &RelayUrl) -> ConnectBehavior {
        self.behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &RelayUrl) -> Result<TransportChannel> {
        match self.behavior(url) {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Refuse => {
                return Err(ClientError::Connection(format!("{url} refused connection")));
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.sessions
            .send(MemorySession {
                url: url.clone(),
                from_client,
                to_client,
            })
            .map_err(|_| ClientError::Connection(format!("{url} has no listener")))?;

        Ok(TransportChannel { outbound, inbound })
    }
}
