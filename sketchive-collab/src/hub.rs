//! Session hub: the single serialized loop that owns the connection registry.
//!
//! ```text
//!  reader A ─┐                      ┌──► outbox A ──► writer A
//!  reader B ─┼─► Command stream ─► Hub ─► outbox B ──► writer B
//!  accept  ──┘   (bounded mpsc)     └──► outbox C ──► writer C
//! ```
//!
//! Register, unregister and broadcast are applied one at a time, so the
//! registry needs no lock. Broadcast never waits on a connection: a full or
//! closed outbox gets the connection evicted on the spot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionId};
use crate::protocol::Payload;
use crate::registry::Registry;

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command stream feeding the loop
    pub command_capacity: usize,
    /// Deliver broadcasts back to the connection that sent them
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            echo_to_sender: true,
        }
    }
}

/// Commands accepted by the hub loop.
#[derive(Debug)]
pub enum Command {
    Register(Connection),
    Unregister(ConnectionId),
    Broadcast {
        sender: ConnectionId,
        payload: Payload,
    },
}

/// The hub loop has stopped; no more commands are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session hub is not running")]
pub struct HubClosed;

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub messages_broadcast: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

/// Counters updated by the loop and read from anywhere without locking.
#[derive(Debug, Default)]
struct AtomicHubStats {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    messages_broadcast: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

impl AtomicHubStats {
    fn snapshot(&self) -> HubStats {
        HubStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable entry point for submitting commands to the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    stats: Arc<AtomicHubStats>,
}

impl HubHandle {
    pub async fn register(&self, connection: Connection) -> Result<(), HubClosed> {
        self.submit(Command::Register(connection)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubClosed> {
        self.submit(Command::Unregister(id)).await
    }

    pub async fn broadcast(&self, sender: ConnectionId, payload: Payload) -> Result<(), HubClosed> {
        self.submit(Command::Broadcast { sender, payload }).await
    }

    /// Commands from one submitter are applied in submission order.
    pub async fn submit(&self, command: Command) -> Result<(), HubClosed> {
        self.tx.send(command).await.map_err(|_| HubClosed)
    }

    /// Lock-free counter snapshot.
    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The hub: registry owner and broadcast router.
pub struct Hub {
    registry: Registry,
    commands: mpsc::Receiver<Command>,
    stats: Arc<AtomicHubStats>,
    echo_to_sender: bool,
}

impl Hub {
    /// Create a hub and the handle that feeds it. Nothing runs until
    /// [`Hub::run`] is polled.
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let stats = Arc::new(AtomicHubStats::default());
        let hub = Self {
            registry: Registry::new(),
            commands: rx,
            stats: stats.clone(),
            echo_to_sender: config.echo_to_sender,
        };
        (hub, HubHandle { tx, stats })
    }

    /// Create a hub and run it on the current tokio runtime.
    pub fn spawn(config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Apply commands until every handle is dropped.
    pub async fn run(mut self) {
        log::info!("Session hub started");
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        for connection in self.registry.iter() {
            connection.close();
        }
        log::info!("Session hub stopped ({} connections closed)", self.registry.len());
    }

    /// Apply every command already queued, without waiting. Returns how many
    /// were applied.
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
            applied += 1;
        }
        applied
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Register(connection) => self.register(connection),
            Command::Unregister(id) => {
                if self.remove(&id) {
                    log::info!("Connection {id} unregistered");
                }
            }
            Command::Broadcast { sender, payload } => self.broadcast(sender, payload),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }

    fn register(&mut self, connection: Connection) {
        let id = connection.id();
        match connection.peer_addr() {
            Some(addr) => log::info!("Connection {id} registered from {addr}"),
            None => log::info!("Connection {id} registered"),
        }
        if self.registry.insert(connection).is_some() {
            log::warn!("Connection {id} re-registered; previous entry closed");
        } else {
            self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn broadcast(&mut self, sender: ConnectionId, payload: Payload) {
        let mut delivered = 0u64;
        let mut failed = Vec::new();

        for connection in self.registry.iter() {
            if !self.echo_to_sender && connection.id() == sender {
                continue;
            }
            match connection.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(reason) => failed.push((connection.id(), reason)),
            }
        }

        self.stats.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);
        log::trace!("Broadcast from {sender}: {} bytes to {delivered} peers", payload.len());

        for (id, reason) in failed {
            if self.remove(&id) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                log::warn!("Connection {id} evicted: {reason}");
            }
        }
    }

    /// Shared removal path for unregister and eviction: drop from the
    /// registry, close the transport, and close the outbox by dropping the
    /// sending half.
    fn remove(&mut self, id: &ConnectionId) -> bool {
        match self.registry.remove(id) {
            Some(connection) => {
                connection.close();
                self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbox, SendError};
    use std::time::Duration;

    fn hub_with(config: HubConfig) -> Hub {
        Hub::new(&config).0
    }

    fn join(hub: &mut Hub, capacity: usize) -> (ConnectionId, Outbox) {
        let (conn, outbox) = Connection::new(capacity);
        let id = conn.id();
        hub.apply(Command::Register(conn));
        (id, outbox)
    }

    #[test]
    fn test_register_unregister_set_semantics() {
        let mut hub = hub_with(HubConfig::default());
        let (a, _oa) = join(&mut hub, 4);
        let (b, _ob) = join(&mut hub, 4);
        let (c, _oc) = join(&mut hub, 4);

        hub.apply(Command::Unregister(b));
        hub.apply(Command::Unregister(b));

        let mut ids: Vec<_> = hub.registry().ids().collect();
        ids.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(hub.stats().active_connections, 2);
        assert_eq!(hub.stats().total_connections, 3);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut hub = hub_with(HubConfig::default());
        hub.apply(Command::Unregister(uuid::Uuid::new_v4()));
        assert!(hub.registry().is_empty());
        assert_eq!(hub.stats(), HubStats::default());
    }

    #[test]
    fn test_unregister_closes_transport_and_outbox() {
        let mut hub = hub_with(HubConfig::default());
        let (id, mut outbox) = join(&mut hub, 4);
        let signal = outbox.close_signal();

        hub.apply(Command::Unregister(id));

        assert!(signal.is_closed());
        assert_eq!(outbox.try_recv(), None);
    }

    #[test]
    fn test_broadcast_reaches_everyone_including_sender() {
        let mut hub = hub_with(HubConfig::default());
        let (sender, mut sender_box) = join(&mut hub, 4);
        let (_, mut b) = join(&mut hub, 4);
        let (_, mut c) = join(&mut hub, 4);

        hub.apply(Command::Broadcast {
            sender,
            payload: Payload::text("hello"),
        });

        for outbox in [&mut sender_box, &mut b, &mut c] {
            assert_eq!(outbox.try_recv(), Some(Payload::text("hello")));
        }
        let stats = hub.stats();
        assert_eq!(stats.deliveries, 3);
        assert_eq!(stats.messages_broadcast, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_broadcast_without_echo_skips_sender() {
        let mut hub = hub_with(HubConfig {
            echo_to_sender: false,
            ..HubConfig::default()
        });
        let (sender, mut sender_box) = join(&mut hub, 4);
        let (_, mut peer) = join(&mut hub, 4);

        hub.apply(Command::Broadcast {
            sender,
            payload: Payload::text("only peers"),
        });

        assert_eq!(sender_box.try_recv(), None);
        assert_eq!(peer.try_recv(), Some(Payload::text("only peers")));
        assert_eq!(hub.registry().len(), 2);
    }

    #[test]
    fn test_broadcast_evicts_faulty_connection() {
        let mut hub = hub_with(HubConfig::default());
        let (sender, mut a) = join(&mut hub, 4);
        let (_, mut b) = join(&mut hub, 4);
        let (faulty, faulty_box) = join(&mut hub, 4);
        drop(faulty_box);

        hub.apply(Command::Broadcast {
            sender,
            payload: Payload::text("stroke"),
        });

        assert_eq!(a.try_recv(), Some(Payload::text("stroke")));
        assert_eq!(b.try_recv(), Some(Payload::text("stroke")));
        assert!(!hub.registry().contains(&faulty));
        assert_eq!(hub.registry().len(), 2);
        assert_eq!(hub.stats().deliveries, 2);
        assert_eq!(hub.stats().evictions, 1);
    }

    #[test]
    fn test_saturated_connection_evicted_on_next_broadcast() {
        let mut hub = hub_with(HubConfig::default());
        let (sender, mut fast) = join(&mut hub, 8);
        let (slow, slow_box) = join(&mut hub, 1);
        let slow_signal = slow_box.close_signal();

        hub.apply(Command::Broadcast { sender, payload: Payload::text("1") });
        assert!(hub.registry().contains(&slow));

        hub.apply(Command::Broadcast { sender, payload: Payload::text("2") });
        assert!(!hub.registry().contains(&slow));
        assert!(slow_signal.is_closed());

        hub.apply(Command::Broadcast { sender, payload: Payload::text("3") });
        let received: Vec<_> = std::iter::from_fn(|| fast.try_recv()).collect();
        assert_eq!(
            received,
            vec![Payload::text("1"), Payload::text("2"), Payload::text("3")]
        );
        assert_eq!(hub.stats().evictions, 1);
        drop(slow_box);
    }

    #[test]
    fn test_evicted_writer_drains_then_sees_end() {
        let mut hub = hub_with(HubConfig::default());
        let (sender, _sender_box) = join(&mut hub, 8);
        let (slow, mut slow_box) = join(&mut hub, 1);

        hub.apply(Command::Broadcast { sender, payload: Payload::text("kept") });
        hub.apply(Command::Broadcast { sender, payload: Payload::text("overflow") });

        assert!(!hub.registry().contains(&slow));
        assert_eq!(slow_box.try_recv(), Some(Payload::text("kept")));
        assert_eq!(slow_box.try_recv(), None);
        assert_eq!(SendError::Full.to_string(), "outbound buffer full");
    }

    #[tokio::test]
    async fn test_spawned_hub_processes_commands_in_order() {
        let handle = Hub::spawn(&HubConfig::default());
        let (conn, mut outbox) = Connection::new(16);
        let id = conn.id();
        handle.register(conn).await.unwrap();

        for i in 0..10 {
            handle.broadcast(id, Payload::text(i.to_string())).await.unwrap();
        }

        for i in 0..10 {
            let got = tokio::time::timeout(Duration::from_secs(1), outbox.recv())
                .await
                .unwrap();
            assert_eq!(got, Some(Payload::text(i.to_string())));
        }

        handle.unregister(id).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), outbox.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
        assert_eq!(handle.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_hub() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        drop(hub);
        let (conn, _outbox) = Connection::new(1);
        assert_eq!(handle.register(conn).await, Err(HubClosed));
        assert!(handle.is_closed());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        #[derive(Debug, Clone)]
        enum Op {
            Register,
            /// Unregister a member, picked by index into the live set.
            UnregisterPresent(usize),
            /// Unregister an id that was never registered.
            UnregisterAbsent,
            /// Unregister any id seen so far, live or already gone.
            UnregisterSeen(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                2 => Just(Op::Register),
                any::<usize>().prop_map(Op::UnregisterPresent),
                Just(Op::UnregisterAbsent),
                any::<usize>().prop_map(Op::UnregisterSeen),
            ]
        }

        proptest! {
            #[test]
            fn registry_matches_set_model(ops in proptest::collection::vec(op(), 0..64)) {
                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let (mut hub, handle) = Hub::new(&HubConfig::default());
                let mut model: HashSet<ConnectionId> = HashSet::new();
                let mut seen: Vec<ConnectionId> = Vec::new();
                let mut outboxes = Vec::new();
                let mut registered = 0u64;

                runtime.block_on(async {
                    for op in &ops {
                        match op {
                            Op::Register => {
                                let (conn, outbox) = Connection::new(1);
                                model.insert(conn.id());
                                seen.push(conn.id());
                                outboxes.push(outbox);
                                registered += 1;
                                handle.register(conn).await.unwrap();
                            }
                            Op::UnregisterPresent(i) => {
                                let mut live: Vec<_> = model.iter().copied().collect();
                                live.sort();
                                if !live.is_empty() {
                                    let id = live[i % live.len()];
                                    model.remove(&id);
                                    handle.unregister(id).await.unwrap();
                                }
                            }
                            Op::UnregisterAbsent => {
                                handle.unregister(uuid::Uuid::new_v4()).await.unwrap();
                            }
                            Op::UnregisterSeen(i) => {
                                if !seen.is_empty() {
                                    let id = seen[i % seen.len()];
                                    model.remove(&id);
                                    handle.unregister(id).await.unwrap();
                                }
                            }
                        }
                    }
                });
                hub.drain_pending();

                let actual: HashSet<ConnectionId> = hub.registry().ids().collect();
                prop_assert_eq!(&actual, &model);
                prop_assert_eq!(hub.registry().len(), model.len());
                let stats = hub.stats();
                prop_assert_eq!(stats.active_connections, model.len() as u64);
                prop_assert_eq!(stats.total_connections, registered);
                prop_assert_eq!(stats.evictions, 0);
            }
        }
    }
}
