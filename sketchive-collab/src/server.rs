//! Realtime WebSocket server.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ── upgrade (ws_path only, else 404)
//!                              │
//!                              ├── Connection ──► Hub (register)
//!                              ├── write_loop  (outbox → socket, pings)
//!                              └── read_loop   (socket → Hub broadcast)
//! ```
//!
//! The server never parses payloads and never touches storage. Every frame a
//! client sends is handed to the hub, which relays it to every registered
//! connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::connection::{read_loop, write_loop, Connection};
use crate::hub::{Hub, HubConfig, HubHandle};

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path of the upgrade endpoint
    pub ws_path: String,
    /// Per-connection outbound buffer; a connection that falls this far
    /// behind is evicted
    pub outbound_capacity: usize,
    /// Hub command stream capacity
    pub command_capacity: usize,
    /// Relay broadcasts back to their sender
    pub echo_to_sender: bool,
    /// Ping interval in seconds (0 = no pings)
    pub heartbeat_interval_secs: u64,
    /// Drop connections silent for this long (0 = never)
    pub idle_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
            outbound_capacity: 256,
            command_capacity: 1024,
            echo_to_sender: true,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            storage_path: None,
        }
    }
}

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.command_capacity,
            echo_to_sender: self.echo_to_sender,
        }
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// The realtime server. Owns the hub until [`serve`](SketchServer::serve)
/// starts it.
pub struct SketchServer {
    config: Arc<ServerConfig>,
    hub: Hub,
    handle: HubHandle,
}

impl SketchServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let (hub, handle) = Hub::new(&config.hub_config());
        Self {
            config: Arc::new(config),
            hub,
            handle,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle to the session hub, for stats or server-side broadcasts.
    pub fn hub(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Bind `bind_addr` and serve until the process exits.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let Self { config, hub, handle } = self;
        tokio::spawn(hub.run());

        log::info!(
            "Realtime server listening on ws://{}{}",
            listener.local_addr()?,
            config.ws_path
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = handle.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Upgrade one TCP stream and run its reader and writer to completion.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    config: Arc<ServerConfig>,
) -> Result<(), WsError> {
    let ws_path = config.ws_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            log::warn!("Rejected upgrade from {addr} for {}", request.uri().path());
            Err(not_found())
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (sink, stream) = ws_stream.split();

    let (connection, outbox) = Connection::new(config.outbound_capacity);
    let connection = connection.with_peer_addr(addr);
    let id = connection.id();
    let signal = connection.close_signal();

    if hub.register(connection).await.is_err() {
        log::warn!("Hub is not running; dropping connection from {addr}");
        return Ok(());
    }

    let writer = tokio::spawn(write_loop(id, sink, outbox, config.heartbeat()));
    read_loop(id, stream, hub, signal, config.idle_timeout()).await;
    if let Err(e) = writer.await {
        log::error!("Connection {id}: writer task failed: {e}");
    }

    log::info!("Connection {id} from {addr} finished");
    Ok(())
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
