//! `sketchive`: realtime whiteboard server and storage admin tool.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use sketchive_collab::client::{BoardClient, ClientEvent};
use sketchive_collab::server::{ServerConfig, SketchServer};
use sketchive_collab::service::{ApiError, BoardService};
use sketchive_collab::storage::{RocksStore, StoreConfig, WhiteboardStore};

#[derive(Parser, Debug)]
#[command(name = "sketchive", version, about = "Realtime collaborative whiteboard backend")]
struct CliArgs {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind, overrides the config file
    #[arg(long, global = true)]
    bind: Option<String>,

    /// RocksDB directory, overrides the config file
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the realtime server (default)
    Serve,
    /// Whiteboard records
    Board {
        #[command(subcommand)]
        action: BoardAction,
    },
    /// Strokes on a whiteboard
    Stroke {
        #[command(subcommand)]
        action: StrokeAction,
    },
    /// Connect to a running server and print every relayed payload
    Watch {
        /// e.g. ws://127.0.0.1:8080/ws
        url: String,
    },
}

#[derive(Subcommand, Debug)]
enum BoardAction {
    Create,
    Get {
        id: String,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// Opaque state blob stored as-is
        #[arg(long)]
        data: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Remove every stroke of the board
    Clear {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum StrokeAction {
    /// JSON body: {"whiteboardID", "ownerID", "path": [{"x","y"}], "color", "width"}
    Add {
        json: String,
    },
    List {
        whiteboard_id: String,
    },
    /// JSON body: {"whiteboardID", "minX", "maxX", "minY", "maxY"}
    Erase {
        json: String,
    },
}

fn load_config(args: &CliArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(storage) = &args.storage {
        config.storage_path = Some(storage.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch { url } => {
            watch(url).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Board { action } => {
            let service = admin_service(&config)?;
            Ok(match action {
                BoardAction::Create => respond(service.create_whiteboard()),
                BoardAction::Get { id } => respond(service.get_whiteboard(Some(&id))),
                BoardAction::Update { id, name, data } => {
                    let body = serde_json::json!({ "name": name, "data": data });
                    respond(service.update_whiteboard(Some(&id), body.to_string().as_bytes()))
                }
                BoardAction::Delete { id } => respond(service.delete_whiteboard(Some(&id))),
                BoardAction::Clear { id } => respond(service.clear_strokes(Some(&id))),
            })
        }
        Command::Stroke { action } => {
            let service = admin_service(&config)?;
            Ok(match action {
                StrokeAction::Add { json } => respond(service.add_stroke(json.as_bytes())),
                StrokeAction::List { whiteboard_id } => {
                    respond(service.list_strokes(Some(&whiteboard_id)))
                }
                StrokeAction::Erase { json } => respond(service.erase_region(json.as_bytes())),
            })
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    // A bad storage path stops the process here. The store is closed again
    // before serving; admin subcommands open it themselves.
    match &config.storage_path {
        Some(path) => {
            let boards = RocksStore::verify(&StoreConfig::at(path))
                .with_context(|| format!("opening store at {}", path.display()))?;
            log::info!("Storage ready at {} ({boards} whiteboards)", path.display());
        }
        None => log::warn!("No storage path configured; storage commands are unavailable"),
    }

    let server = SketchServer::new(config);
    let hub = server.hub();
    tokio::select! {
        result = server.run() => result.context("realtime server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            let stats = hub.stats();
            log::info!(
                "Shutting down ({} active connections, {} messages relayed)",
                stats.active_connections,
                stats.messages_broadcast
            );
        }
    }
    Ok(())
}

fn admin_service(config: &ServerConfig) -> Result<BoardService> {
    let Some(path) = &config.storage_path else {
        bail!("storage commands need --storage or storage_path in the config file");
    };
    let store: Arc<dyn WhiteboardStore> = Arc::new(
        RocksStore::open(StoreConfig::at(path))
            .with_context(|| format!("opening store at {}", path.display()))?,
    );
    Ok(BoardService::new(store))
}

/// Print a result as JSON: the value on stdout, or the error body on stderr.
fn respond<T: Serialize>(result: Result<T, ApiError>) -> ExitCode {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            log::debug!("Request failed with status {}", e.status());
            eprintln!("{}", e.body());
            ExitCode::FAILURE
        }
    }
}

async fn watch(url: String) -> Result<()> {
    let mut client = BoardClient::new(url);
    let mut events = client
        .take_event_rx()
        .context("event receiver already taken")?;
    client.connect().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Connected) => log::info!("Watching {}", client.url()),
                Some(ClientEvent::Message(payload)) => match payload.as_text() {
                    Some(text) => println!("{text}"),
                    None => println!("<{} bytes binary>", payload.len()),
                },
                Some(ClientEvent::Disconnected) | None => {
                    log::info!("Server closed the connection");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = client.close().await;
                break;
            }
        }
    }
    Ok(())
}
