//! Frame-level protocol for the realtime channel.
//!
//! The hub never looks inside a payload. Whatever a peer sends as a text or
//! binary WebSocket frame is relayed verbatim, with the same frame kind:
//!
//! ```text
//! ┌─────────┐  Text/Binary   ┌─────────┐  Payload (opaque)  ┌─────────┐
//! │ Peer A  │ ─────────────► │ Reader  │ ─────────────────► │   Hub   │
//! └─────────┘                └─────────┘                    └────┬────┘
//!                                                                │ fan-out
//!                       Ping/Pong → Inbound::Heartbeat           ▼
//!                       Close / error → end of stream       every outbox
//! ```

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Opaque frame content relayed between peers.
///
/// Wraps the data frame it arrived in so the text/binary distinction
/// survives the trip through the hub. Cloning is cheap: the bytes are
/// reference counted, so fan-out to N outboxes does not copy the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Message);

impl Payload {
    /// A text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self(Message::text(text.into()))
    }

    /// A binary payload.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Message::binary(bytes.into()))
    }

    /// Extract the payload of a data frame. Control frames yield `None`.
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(_) | Message::Binary(_) => Some(Self(msg)),
            _ => None,
        }
    }

    /// Whether this payload travels as a text frame.
    pub fn is_text(&self) -> bool {
        self.0.is_text()
    }

    /// Raw payload bytes (UTF-8 for text payloads).
    pub fn as_bytes(&self) -> &[u8] {
        match &self.0 {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            _ => &[],
        }
    }

    /// The payload as text, if it arrived as a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match &self.0 {
            Message::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Convert back into a frame for the wire.
    pub fn into_message(self) -> Message {
        self.0
    }
}

/// One unit of inbound activity on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A data frame to be broadcast.
    Payload(Payload),
    /// Ping or pong: proves the peer is alive, carries nothing to relay.
    Heartbeat,
}

/// Turn a raw WebSocket read half into a lazy sequence of inbound activity.
///
/// The sequence ends on a close frame, on end of stream, or on the first
/// read error. Raw frames are skipped.
pub fn receive<S>(stream: S) -> impl Stream<Item = Inbound>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    futures_util::stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some((Inbound::Payload(Payload(Message::Text(text))), stream));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Some((Inbound::Payload(Payload(Message::Binary(bytes))), stream));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    return Some((Inbound::Heartbeat, stream));
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Peer sent close frame: {frame:?}");
                    return None;
                }
                Some(Err(e)) => {
                    log::debug!("Read error, ending inbound stream: {e}");
                    return None;
                }
                None => return None,
            }
        }
    })
}
