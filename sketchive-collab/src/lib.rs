//! # sketchive-collab: Realtime whiteboard collaboration backend
//!
//! Relays live drawing activity between connected peers and persists
//! whiteboards and strokes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ BoardClient │ ◄─────────────────► │ SketchServer │
//! │ (browser)   │   opaque frames     │  (upgrade)   │
//! └─────────────┘                     └──────┬───────┘
//!                                            │ Connection per peer
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │     Hub      │  single serialized loop
//!                                     │  (Registry)  │  register / unregister /
//!                                     └──────┬───────┘  broadcast
//!                                            │ fan-out, evict on full
//!                                            ▼
//!                                      every outbox
//!
//! ┌──────────────┐  WhiteboardStore  ┌──────────────────────┐
//! │ BoardService │ ────────────────► │ RocksStore / Memory  │
//! └──────────────┘                   └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Opaque payloads and the inbound frame stream
//! - [`connection`]: Per-connection outbox, close signal, reader/writer tasks
//! - [`registry`]: The set of live connections
//! - [`hub`]: Serialized register/unregister/broadcast loop
//! - [`server`]: WebSocket server and its configuration
//! - [`client`]: WebSocket client
//! - [`storage`]: Whiteboard/stroke persistence (RocksDB or in-memory)
//! - [`service`]: REST-shaped operations over the store

pub mod protocol;
pub mod connection;
pub mod registry;
pub mod hub;
pub mod server;
pub mod client;
pub mod storage;
pub mod service;

// Re-exports for convenience
pub use protocol::{Inbound, Payload};
pub use connection::{CloseSignal, Connection, ConnectionId, Outbox, SendError};
pub use registry::Registry;
pub use hub::{Command, Hub, HubClosed, HubConfig, HubHandle, HubStats};
pub use server::{ConfigError, ServerConfig, SketchServer};
pub use client::{BoardClient, ClientError, ClientEvent, ConnectionState};
pub use storage::{
    BoundingBox, MemoryStore, NewStroke, Point, RocksStore, StoreConfig, StoreError, Stroke,
    Whiteboard, WhiteboardStore, WhiteboardUpdate,
};
pub use service::{Acknowledgement, ApiError, BoardService, EraseRequest};
