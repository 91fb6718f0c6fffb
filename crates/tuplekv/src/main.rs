//! TupleKV - command-line access to a tuple-key store
//!
//! Reads and writes entries of a TupleKV database file:
//! - Point reads, writes and deletes by key segments
//! - Prefix and range scans
//!
//! Output is one JSON document per line on stdout; logs go to stderr.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tuplekv_common::config::{BackendKind, LoggingConfig};
use tuplekv_storage::KvStore;

mod cli;
mod config;

#[derive(Parser)]
#[command(name = "tuplekv")]
#[command(author, version, about = "TupleKV - ordered tuple-key store", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database file (`:memory:` for a throwaway store)
    #[arg(long, global = true, env = "TUPLEKV_DB")]
    db: Option<String>,

    /// Storage driver (sqlite, sqlx)
    #[arg(long, global = true, env = "TUPLEKV_BACKEND")]
    backend: Option<BackendKind>,

    /// Configuration file path (TOML or JSON)
    #[arg(short, long, global = true, env = "TUPLEKV_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its table
    Init,

    /// Read one key
    Get {
        /// Key segments
        #[arg(required = true)]
        segments: Vec<String>,
    },

    /// Write one key
    Set {
        /// Key segments
        #[arg(required = true)]
        segments: Vec<String>,

        /// JSON value
        #[arg(short, long)]
        value: String,
    },

    /// Delete one key
    Delete {
        /// Key segments
        #[arg(required = true)]
        segments: Vec<String>,
    },

    /// Scan by prefix, or by range with --start and --end
    List {
        #[arg(long, num_args = 1..)]
        prefix: Vec<String>,

        #[arg(long, num_args = 1.., requires = "end")]
        start: Vec<String>,

        #[arg(long, num_args = 1.., requires = "start")]
        end: Vec<String>,

        /// Maximum number of entries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Descending key order
        #[arg(short, long)]
        reverse: bool,
    },

    /// Show version information
    Version,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::from_default_env().add_directive(format!("tuplekv={}", logging.level).parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn version_line() -> String {
    format!("TupleKV version {}", env!("CARGO_PKG_VERSION"))
}

async fn run(command: Commands, store: &KvStore, out: &mut impl std::io::Write) -> Result<()> {
    match command {
        Commands::Init => {
            info!("Database initialized");
        }

        Commands::Get { segments } => cli::handle_get(store, &segments, out).await?,

        Commands::Set { segments, value } => cli::handle_set(store, &segments, &value, out).await?,

        Commands::Delete { segments } => cli::handle_delete(store, &segments, out).await?,

        Commands::List {
            prefix,
            start,
            end,
            limit,
            reverse,
        } => {
            let args = cli::ListArgs {
                prefix,
                start,
                end,
                limit,
                reverse,
            };
            cli::handle_list(store, &args, out).await?;
        }

        Commands::Version => writeln!(out, "{}", version_line())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("{}", version_line());
        return Ok(());
    }

    let config = config::load(cli.config.as_deref()).await?;
    let config = config::apply_overrides(config, cli.db, cli.backend)?;
    init_tracing(&config.logging)?;

    info!(path = %config.storage.path, backend = ?config.storage.backend, "Opening store");
    let store = KvStore::open(&config.storage).await?;
    let mut out = std::io::stdout().lock();
    let result = run(cli.command, &store, &mut out).await;
    store.close().await?;
    result
}
