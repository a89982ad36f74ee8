//! WebSocket client for the realtime channel.
//!
//! Used by the `watch` command and by the integration tests. It speaks the
//! same opaque protocol as browsers: whatever is sent is relayed by the hub,
//! and everything the hub relays shows up as [`ClientEvent::Message`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Payload;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// A payload relayed by the server
    Message(Payload),
    /// Connection lost or closed
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("not connected")]
    NotConnected,
}

/// The board client.
pub struct BoardClient {
    /// Server URL, e.g. `ws://127.0.0.1:8080/ws`
    url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl BoardClient {
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect {
                    url: self.url.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = msg.is_close();
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        log::info!("Connected to {}", self.url);

        // Reader task: surface relayed payloads as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(msg) => {
                        if let Some(payload) = Payload::from_message(msg) {
                            if event_tx.send(ClientEvent::Message(payload)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a payload to the server for relay.
    pub async fn send(&self, payload: Payload) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(payload.into_message())
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Payload::text(text)).await
    }

    /// Send a close frame and stop the writer. The reader reports
    /// [`ClientEvent::Disconnected`] once the server acknowledges.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.take().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Close(None))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}
