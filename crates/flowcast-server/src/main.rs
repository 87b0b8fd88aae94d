//! Flowcast server binary
//!
//! init → serve → shutdown. Fatal startup errors (bind failure, store init
//! failure) exit non-zero; everything after startup flows through the HTTP
//! error surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowcast_broker::{BrokerConfig, EventBroker};
use flowcast_event_store::{BoxedEventStore, InMemoryEventStore, SqliteConfig, SqliteEventStore};
use flowcast_http_server::FlowcastServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageBackend {
    /// In-process buffers; history is lost on restart
    Memory,
    /// Embedded SQLite with WAL; streams and events survive restarts
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(name = "flowcast-server", about = "Real-time event streaming broker")]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// Event store backend
    #[arg(long, value_enum, default_value = "memory")]
    storage: StorageBackend,

    /// SQLite database path (sqlite backend only)
    #[arg(long, default_value = "flowcast_events.db")]
    database: PathBuf,

    /// Maximum concurrent stream sessions
    #[arg(long, default_value_t = 1_000)]
    max_streams: usize,

    /// Retention cap per stream
    #[arg(long, default_value_t = 1_000)]
    max_events_per_stream: u32,

    /// Transport heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Idle session TTL in seconds
    #[arg(long, default_value_t = 3_600)]
    stream_ttl_secs: u64,

    /// Disable CORS headers
    #[arg(long)]
    no_cors: bool,

    /// Log filter directive (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = BrokerConfig {
        max_streams: args.max_streams,
        stream_ttl: Duration::from_secs(args.stream_ttl_secs),
        ..BrokerConfig::default()
    };
    config.default_session.max_events = args.max_events_per_stream;
    config.default_session.heartbeat_interval = Duration::from_secs(args.heartbeat_secs);

    let store: Arc<BoxedEventStore> = match args.storage {
        StorageBackend::Memory => Arc::new(InMemoryEventStore::new()),
        StorageBackend::Sqlite => {
            let sqlite_config = SqliteConfig {
                database_path: args.database.clone(),
                max_events_per_stream: args.max_events_per_stream,
                ..SqliteConfig::default()
            };
            match SqliteEventStore::with_config(sqlite_config).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    error!("event store initialization failed: {err}");
                    std::process::exit(1);
                }
            }
        }
    };

    let broker = EventBroker::new(store, config);
    let server = FlowcastServer::builder(Arc::clone(&broker))
        .bind_address(args.bind)
        .cors(!args.no_cors)
        .build();

    let shutdown_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown_broker.shutdown().await;
        }
    });

    if let Err(err) = server.run().await {
        error!("server failed to start: {err}");
        std::process::exit(1);
    }
}
