//! surfsync: block-based file synchronization client
//!
//! Keeps a local directory in sync with a surfsync metadata store and its
//! block stores:
//! - Fixed-size blocks addressed by BLAKE3 hash
//! - Optimistic versioning, a stale local edit never overwrites newer data
//! - Consistent-hash sharding over several block stores
//! - File watching with debouncing

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use surfsync_core::index::STATE_DIR;
use surfsync_core::config::check_block_size;
use surfsync_core::{Scanner, SurfConfig, SyncClient, SyncReport};
use surfsync_transport::{RemoteMetaStore, TcpConnector};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "surfsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Block-based file sync against a surfsync server")]
#[command(long_about = r#"
surfsync keeps a directory in sync with a surfsync server.

Files are split into fixed-size blocks addressed by their BLAKE3 hash; only
blocks the server lacks are uploaded. Every file carries a version, and a
local edit made against an old version loses to the newer remote one.

Settings can live in .surfsync.toml inside the synced directory:

  meta_addr = "server:8080"
  block_size = 4096

  [timeouts]
  read_ms = 1000
  write_ms = 5000

Examples:
  surfsync sync ./docs --meta server:8080     One sync pass
  surfsync watch ./docs --meta server:8080    Sync on every change
  surfsync sync ./docs --ignore '*.tmp'       Leave scratch files local
  surfsync scan ./docs                        Show local block hashes
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Target {
    /// Directory to synchronize
    dir: PathBuf,

    /// Metadata server address (host:port), overrides .surfsync.toml
    #[arg(short, long)]
    meta: Option<String>,

    /// Block size in bytes, overrides .surfsync.toml
    #[arg(short, long)]
    block_size: Option<usize>,

    /// Extra ignore pattern in .surfignore syntax (repeatable)
    #[arg(short, long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass
    Sync {
        #[command(flatten)]
        target: Target,

        /// Print the pass report as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Sync, then sync again whenever the directory changes
    Watch {
        #[command(flatten)]
        target: Target,

        /// Debounce delay in milliseconds
        #[arg(short, long, default_value = "250")]
        debounce: u64,
    },

    /// Scan a directory and print its block hashes
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Block size in bytes, overrides .surfsync.toml
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Extra ignore pattern in .surfignore syntax (repeatable)
        #[arg(short, long = "ignore", value_name = "PATTERN")]
        ignore: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "summary")]
        format: Format,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Summary,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let session = debug_log::init(cli.verbose);
    debug!("debug log at {}", session.log_path.display());

    match cli.command {
        Commands::Version => {
            eprintln!("surfsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan {
            path,
            block_size,
            ignore,
            format,
        } => {
            scan_command(&path, block_size, &ignore, format)?;
        }
        Commands::Sync { target, json } => {
            let report = sync_command(&target).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::Watch { target, debounce } => {
            watch_command(&target, debounce).await?;
        }
    }

    drop(session.guard);
    Ok(())
}

fn scan_command(
    path: &Path,
    block_size: Option<usize>,
    ignore: &[String],
    format: Format,
) -> Result<()> {
    let config = SurfConfig::load(path)?;
    let block_size = block_size.unwrap_or(config.block_size);
    check_block_size(block_size)?;
    info!("Scanning {} with {block_size}-byte blocks...", path.display());

    let scanner = ignore
        .iter()
        .fold(Scanner::new(path, block_size), |s, p| s.ignore(p.clone()));
    let files = scanner.scan()?;

    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Format::Summary => {
            let total_size: u64 = files.iter().map(|f| f.size).sum();
            let total_blocks: usize = files.iter().map(|f| f.block_hashes.len()).sum();
            eprintln!("Files: {}", files.len());
            eprintln!(
                "Total size: {} in {total_blocks} blocks",
                humansize::format_size(total_size, humansize::BINARY)
            );

            if files.len() <= 20 {
                eprintln!("\nFiles:");
                for file in &files {
                    eprintln!(
                        "  {} ({} bytes, {} blocks)",
                        file.name,
                        file.size,
                        file.block_hashes.len()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Build a sync client from `.surfsync.toml` plus command-line overrides
fn build_client(target: &Target) -> Result<SyncClient> {
    let config = SurfConfig::load(&target.dir)?;

    let meta_addr = target
        .meta
        .clone()
        .or(config.meta_addr)
        .ok_or_else(|| eyre!("no metadata server given, pass --meta or set meta_addr"))?;
    let block_size = target.block_size.unwrap_or(config.block_size);
    check_block_size(block_size)?;

    debug!(%meta_addr, block_size, ?config.timeouts, ignore = ?target.ignore, "client settings");

    let client = SyncClient::new(
        &target.dir,
        block_size,
        Arc::new(RemoteMetaStore::new(meta_addr, config.timeouts)),
        Arc::new(TcpConnector::new(config.timeouts)),
    );
    Ok(target
        .ignore
        .iter()
        .fold(client, |c, pattern| c.ignore(pattern.clone())))
}

async fn sync_command(target: &Target) -> Result<SyncReport> {
    let client = build_client(target)?;
    run_pass(&client).await
}

async fn run_pass(client: &SyncClient) -> Result<SyncReport> {
    let progress = progress::SyncProgress::new();
    let report = client.sync().await?;
    progress.finish(&report);
    Ok(report)
}

/// Whether any event path lies outside the client's state directory
fn touches_synced_files(root: &Path, paths: &[&PathBuf]) -> bool {
    let state_dir = root.join(STATE_DIR);
    paths.iter().any(|p| !p.starts_with(&state_dir))
}

async fn watch_command(target: &Target, debounce_ms: u64) -> Result<()> {
    let client = build_client(target)?;
    let base_dir = client.base_dir().to_path_buf();

    // Initial sync
    run_pass(&client).await?;

    // Setup file watcher
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        None,
        move |result: DebounceEventResult| {
            if let Ok(events) = result {
                let _ = tx.send(events);
            }
        },
    )?;

    debouncer
        .watch(&base_dir, RecursiveMode::Recursive)
        .wrap_err_with(|| format!("failed to watch {}", base_dir.display()))?;

    progress::watching(&base_dir);

    // Event paths are absolute; compare against the canonical root
    let root = base_dir.canonicalize().unwrap_or_else(|_| base_dir.clone());

    while let Some(events) = rx.recv().await {
        let paths: Vec<_> = events.iter().flat_map(|e| e.paths.iter()).collect();

        if paths.is_empty() || !touches_synced_files(&root, &paths) {
            continue;
        }

        info!("Detected {} changed paths, syncing...", paths.len());
        for path in &paths {
            debug!("  Changed: {}", path.display());
        }

        if let Err(e) = run_pass(&client).await {
            error!("Sync failed: {e}");
            progress::failed(&e);
        }
    }

    error!("Watcher stopped delivering events");
    Ok(())
}
