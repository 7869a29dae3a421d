//! taskflow server: room broker, WebSocket sync and the `GET /todos` listing.
//!
//! Configuration comes from flags with environment fallbacks; `RUST_LOG`
//! controls log output.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use taskflow_collab::{ServerConfig, SyncServer};

/// Real-time task list server.
#[derive(Debug, Parser)]
#[command(name = "taskflow-server")]
#[command(about = "Room-based real-time sync server for hierarchical task lists")]
#[command(version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "TASKFLOW_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// RocksDB directory. Records are kept in memory when omitted.
    #[arg(long, env = "TASKFLOW_STORAGE")]
    storage: Option<PathBuf>,

    /// Events buffered per connection before it starts skipping.
    #[arg(long, env = "TASKFLOW_BROADCAST_CAPACITY", default_value = "256")]
    broadcast_capacity: usize,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        ServerConfig {
            bind_addr: cli.bind,
            broadcast_capacity: cli.broadcast_capacity,
            storage_path: cli.storage,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let config = ServerConfig::from(Cli::parse());

    info!("Starting taskflow server on {}...", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Persisting to {}", path.display()),
        None => info!("No storage path; records live in memory"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    let running = Arc::clone(&server);
    let result = tokio::select! {
        result = running.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            server.shutdown();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
