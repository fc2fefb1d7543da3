//! Duplex channel transports.
//!
//! The [`ConnectionManager`][crate::connection::ConnectionManager] never
//! touches a socket directly. It asks a [`Transport`] to open a
//! [`DuplexChannel`] and then only deals with text frames:
//!
//! - [`WebSocketTransport`] – the production transport (`ws://` / `wss://`).
//! - Tests plug in scripted in-memory transports built from plain channels.

use async_trait::async_trait;
use fleetwatch_types::FleetError;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// An open channel: a sender for outbound text frames and a stream of inbound
/// ones.
///
/// The inbound stream yields `Err` (or simply ends) when the channel is lost.
/// Dropping `outbound` closes the write half.
pub struct DuplexChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: BoxStream<'static, Result<String, FleetError>>,
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Something that can open a [`DuplexChannel`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh channel.
    async fn open(&self) -> Result<DuplexChannel, FleetError>;

    /// Human-readable endpoint, used in logs.
    fn describe(&self) -> String;
}

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<DuplexChannel, FleetError> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FleetError::Channel(format!("connect to {}: {e}", self.url)))?;

        let (mut ws_tx, ws_rx) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        // Writer: pump queued frames into the socket until every sender is
        // dropped, then close politely.
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    warn!(url = %url, error = %e, "ws write failed");
                    return;
                }
            }
            let _ = ws_tx.close().await;
            debug!(url = %url, "ws writer closed");
        });

        let inbound = ws_rx
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_string())),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!("dropping non-utf8 binary frame");
                            None
                        }
                    },
                    Ok(Message::Close(_)) => {
                        Some(Err(FleetError::Channel("closed by peer".to_string())))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(FleetError::Channel(e.to_string()))),
                }
            })
            .boxed();

        Ok(DuplexChannel { outbound, inbound })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
