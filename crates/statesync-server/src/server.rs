//! WebSocket transport for the event hub.
//!
//! This module provides the server that handles:
//! - Client connections (one hub connection per socket)
//! - Subscribe/unsubscribe control frames
//! - Inbound event frames, dispatched to the hub
//! - Outbound frames queued by the hub through [`ChannelSink`]

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use serde_json::Value;
use statesync_core::{ConnectionSink, EventHub, OriginId, SinkClosed};
use statesync_protocol::{decode_client_frame, encode_server_frame, ClientFrame, CodecError, ServerFrame};

/// Outbound side of one connection: encodes hub frames and queues them for
/// the socket task. Never blocks.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl ConnectionSink for ChannelSink {
    fn send(&self, event: &str, payload: &Value) -> Result<(), SinkClosed> {
        let frame = ServerFrame::new(event, payload.clone());
        match encode_server_frame(&frame) {
            Ok(text) => self.tx.send(text).map_err(|_| SinkClosed),
            Err(e) => {
                warn!(event, error = %e, "failed to encode frame");
                Ok(())
            }
        }
    }
}

/// The WebSocket event server.
pub struct EventSocketServer {
    hub: Arc<EventHub>,
}

impl EventSocketServer {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn run(self, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Event server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<EventHub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let id = hub.open_connection(Arc::new(ChannelSink::new(tx)));
    info!(connection = %id, "New connection from {}", addr);

    let result = connection_loop(ws_stream, &hub, &id, rx).await;

    hub.close_connection(&id);
    info!(connection = %id, "Connection from {} closed", addr);
    result
}

async fn connection_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    hub: &Arc<EventHub>,
    id: &OriginId,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            // Handle incoming frames from client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Update handlers may block on storage.
                        let hub = hub.clone();
                        let conn = id.clone();
                        let handled = tokio::task::spawn_blocking(move || {
                            handle_client_text(&hub, &conn, &text)
                        })
                        .await;
                        if let Err(e) = handled {
                            error!(connection = %id, "Frame handler failed: {}", e);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection = %id, "{}", CodecError::BinaryFrame);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Client closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {} // Ignore other message types
                }
            }

            // Frames queued by the hub
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            warn!(connection = %id, "Failed to send frame: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Apply one text frame to the hub. Malformed or rejected frames are
/// logged and dropped; the connection stays open.
fn handle_client_text(hub: &EventHub, id: &OriginId, text: &str) {
    let frame = match decode_client_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %id, error = %e, "Dropping malformed frame");
            return;
        }
    };

    let result = match frame {
        ClientFrame::Subscribe(event) => {
            debug!(connection = %id, event = %event, "subscribe");
            hub.subscribe(id, &event)
        }
        ClientFrame::Unsubscribe(event) => {
            debug!(connection = %id, event = %event, "unsubscribe");
            hub.unsubscribe(id, &event)
        }
        ClientFrame::Event { event, data } => {
            debug!(connection = %id, event = %event, "event");
            hub.dispatch(id, &event, &data).map(|_| ())
        }
    };

    if let Err(e) = result {
        warn!(connection = %id, error = %e, "Dropping frame");
    }
}
