//! surfsync-server: block store and metadata store server
//!
//! Runs a block store, a metadata store, or both in one process, serving
//! the binary protocol over TCP with one task per connection.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use tokio::net::TcpListener;
use tracing::info;

use surfsync_core::{BlockStore, BlockStoreLocation, MetaStore};
use surfsync_transport::Server;
use surfsync_transport::server::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Service {
    /// Metadata store only
    Meta,
    /// Block store only
    Block,
    /// Both stores in one process
    Both,
}

#[derive(Parser)]
#[command(name = "surfsync-server")]
#[command(version)]
#[command(about = "Serve surfsync block and metadata stores")]
struct Cli {
    /// Which stores this process runs
    #[arg(short, long, value_enum, default_value = "both")]
    service: Service,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Only listen on localhost
    #[arg(short, long)]
    localhost: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Close connections that send nothing for this long (milliseconds)
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_millis() as u64)]
    idle_timeout_ms: u64,

    /// Connections served at once; further clients wait to be accepted
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Ring members that are administratively removed
    #[arg(long = "down", value_name = "ADDR")]
    down: Vec<String>,

    /// Block store addresses (host:port) reported to clients
    #[arg(value_name = "BLOCK_STORE_ADDR")]
    block_stores: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let host = if cli.localhost { "localhost" } else { "0.0.0.0" };
    let bind_addr = format!("{host}:{}", cli.port);

    let blocks = matches!(cli.service, Service::Block | Service::Both)
        .then(|| Arc::new(BlockStore::new()));

    let meta = if matches!(cli.service, Service::Meta | Service::Both) {
        let members = block_store_members(&cli)?;
        let Some(location) = BlockStoreLocation::from_members(&members, &cli.down) else {
            bail!("every block store is marked down, clients would have nowhere to put blocks");
        };
        info!(?location, "block store location");
        Some(Arc::new(MetaStore::new(location)))
    } else {
        None
    };

    if cli.max_connections == 0 {
        bail!("--max-connections must be at least 1");
    }

    let listener = TcpListener::bind(&bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {bind_addr}"))?;
    Server::new(blocks, meta)
        .with_idle_timeout(Duration::from_millis(cli.idle_timeout_ms))
        .with_max_connections(cli.max_connections)
        .serve(listener)
        .await
}

/// Block store addresses the metadata store reports.
///
/// A combined server with no explicit addresses reports itself.
fn block_store_members(cli: &Cli) -> Result<Vec<String>> {
    if !cli.block_stores.is_empty() {
        return Ok(cli.block_stores.clone());
    }
    match cli.service {
        Service::Both => Ok(vec![format!("localhost:{}", cli.port)]),
        _ => bail!("a metadata server needs at least one block store address"),
    }
}
