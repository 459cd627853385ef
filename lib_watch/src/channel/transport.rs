//! Transport seam between the channel client and the wire.
//!
//! The client only sees a pair of envelope channels; the WebSocket specifics
//! live behind [`Transport`]. `WsTransport` is the production implementation,
//! `MemoryTransport` is an in-process implementation used by tests and the
//! scenario runners.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use crate::channel::envelope::Envelope;
use crate::error::{CoreError, CoreResult};

/// A live bidirectional connection: envelopes pushed into `outbound` go to
/// the backend, envelopes arriving from the backend appear on `inbound`.
/// Closure of `inbound` means the connection is gone.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

pub trait Transport: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, CoreResult<Connection>>;
}

/// WebSocket transport speaking JSON text frames.
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, CoreResult<Connection>> {
        let url = url.to_string();
        Box::pin(async move {
            log::info!("Connecting to backend: {}", url);
            let (ws_stream, _) = connect_async(&url)
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            log::info!("Connected to backend.");

            let (mut write, mut read) = ws_stream.split();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

            // Outbound pump: envelope -> JSON text frame.
            tokio::spawn(async move {
                while let Some(envelope) = out_rx.recv().await {
                    match serde_json::to_string(&envelope) {
                        Ok(text) => {
                            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                log::error!("WSS write error: {}", e);
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to encode outbound envelope: {}", e),
                    }
                }
                let _ = write.close().await;
            });

            // Inbound pump: JSON text frame -> envelope. Dropping `in_tx`
            // closes the client's inbound stream, which the client treats as
            // a connection error.
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    if in_tx.send(envelope).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Discarding malformed envelope: {}", e);
                                }
                            }
                        }
                        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                        Ok(WsMessage::Close(_)) => {
                            log::warn!("WSS stream closed by remote host.");
                            break;
                        }
                        Err(e) => {
                            log::error!("WSS read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            });

            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// The backend-side handles of one in-memory connection.
pub struct BackendPeer {
    /// Push envelopes toward the client.
    pub to_client: mpsc::UnboundedSender<Envelope>,
    /// Receive envelopes the client sent.
    pub from_client: mpsc::UnboundedReceiver<Envelope>,
}

/// In-process transport. Every `connect` yields a fresh channel pair and
/// hands the backend side to whoever holds the peer receiver; once that
/// receiver is dropped, further connects fail — convenient for simulating a
/// backend outage.
pub struct MemoryTransport {
    peers: Mutex<mpsc::UnboundedSender<BackendPeer>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: Mutex::new(tx),
            },
            rx,
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, _url: &str) -> BoxFuture<'static, CoreResult<Connection>> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let peer = BackendPeer {
            to_client: in_tx,
            from_client: out_rx,
        };
        let accepted = self
            .peers
            .lock()
            .expect("MemoryTransport lock poisoned")
            .send(peer)
            .is_ok();
        Box::pin(async move {
            if !accepted {
                return Err(CoreError::Transport("backend unavailable".to_string()));
            }
            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
