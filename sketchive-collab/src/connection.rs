//! One client connection: a bounded outbound buffer, a shared close flag, and
//! the reader/writer tasks that move frames between the hub and the socket.
//!
//! ```text
//!            ┌──────────── Connection (owned by the hub registry) ───────────┐
//!  Hub ────► │ send(): try_send into bounded mpsc ──► Outbox ──► write_loop  │ ──► socket
//!            │ CloseSignal (shared) ─────────────────────────┬──────────────│
//!  Hub ◄──── │ read_loop ◄── receive(stream) ◄───────────────┘              │ ◄── socket
//!            └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping the `Connection` alone closes the outbox: the writer drains what
//! is left, sends a close frame and exits. Unregister and eviction fire the
//! close signal first, so anything still queued is discarded and only the
//! close frame goes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::hub::HubHandle;
use crate::protocol::{receive, Inbound, Payload};

/// Opaque connection identity.
pub type ConnectionId = Uuid;

/// Upper bound on how long the final close frame may take to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a payload could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Idempotent transport-close flag shared by a connection and its tasks.
#[derive(Debug, Clone)]
pub struct CloseSignal(Arc<watch::Sender<bool>>);

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Mark the transport closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the transport has been closed.
    pub async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub-side half of a client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Payload>,
    signal: CloseSignal,
}

/// Writer-side half: the consumer end of the outbound buffer.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Payload>,
    signal: CloseSignal,
}

impl Connection {
    /// Create a connection with an outbound buffer of `capacity` payloads.
    pub fn new(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let signal = CloseSignal::new();
        let connection = Self {
            id: Uuid::new_v4(),
            peer_addr: None,
            outbound: tx,
            signal: signal.clone(),
        };
        (connection, Outbox { rx, signal })
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a payload for delivery without waiting.
    ///
    /// A full buffer is reported, never waited on: the caller evicts.
    pub fn send(&self, payload: Payload) -> Result<(), SendError> {
        if self.signal.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the transport. Safe to call any number of times.
    pub fn close(&self) -> bool {
        self.signal.close()
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }
}

impl Outbox {
    /// Next queued payload; `None` once the connection is dropped and drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Number of payloads waiting to be written.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }
}

/// Reader task: relay inbound payloads to the hub until the peer goes away.
///
/// Ends on close frame, read error, idle timeout, close signal, or hub
/// shutdown, and always asks the hub to unregister the connection.
pub async fn read_loop<S>(
    id: ConnectionId,
    stream: S,
    hub: HubHandle,
    signal: CloseSignal,
    idle_timeout: Option<Duration>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let inbound = receive(stream);
    tokio::pin!(inbound);

    loop {
        let next = tokio::select! {
            _ = signal.closed() => {
                log::debug!("Connection {id}: reader stopping, transport closed");
                break;
            }
            next = next_inbound(&mut inbound, idle_timeout) => next,
        };

        match next {
            Ok(Some(Inbound::Payload(payload))) => {
                log::trace!("Connection {id}: inbound payload ({} bytes)", payload.len());
                if hub.broadcast(id, payload).await.is_err() {
                    log::debug!("Connection {id}: hub gone, reader stopping");
                    break;
                }
            }
            Ok(Some(Inbound::Heartbeat)) => {}
            Ok(None) => {
                log::debug!("Connection {id}: inbound stream ended");
                break;
            }
            Err(_) => {
                log::warn!("Connection {id}: idle for {idle_timeout:?}, dropping");
                break;
            }
        }
    }

    signal.close();
    let _ = hub.unregister(id).await;
}

async fn next_inbound<St>(
    inbound: &mut St,
    idle_timeout: Option<Duration>,
) -> Result<Option<Inbound>, tokio::time::error::Elapsed>
where
    St: Stream<Item = Inbound> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, inbound.next()).await,
        None => Ok(inbound.next().await),
    }
}

/// Writer task: drain the outbox to the socket, pinging on `heartbeat`.
///
/// A closed outbox or a fired close signal ends the loop with a close frame;
/// a write error ends it immediately and fires the close signal so the
/// reader unblocks too.
pub async fn write_loop<K>(id: ConnectionId, mut sink: K, outbox: Outbox, heartbeat: Option<Duration>)
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let Outbox { mut rx, signal } = outbox;
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let frame = tokio::select! {
            biased;
            _ = signal.closed() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload.into_message(),
                None => break,
            },
            _ = tick(&mut ticker) => Message::Ping(Vec::new().into()),
        };

        let written = tokio::select! {
            result = sink.send(frame) => result,
            _ = signal.closed() => break,
        };
        if let Err(e) = written {
            log::warn!("Connection {id}: write failed: {e}");
            signal.close();
            let _ = sink.close().await;
            return;
        }
    }

    let goodbye = async {
        sink.send(Message::Close(None)).await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_GRACE, goodbye).await {
        Ok(Ok(())) => log::debug!("Connection {id}: closed cleanly"),
        Ok(Err(e)) => log::debug!("Connection {id}: close frame not delivered: {e}"),
        Err(_) => log::debug!("Connection {id}: close frame timed out"),
    }
    signal.close();
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
