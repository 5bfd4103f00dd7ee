use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use marmot_group::GroupConfig;
use marmot_sidecar::daemon::{self, Exit};
use marmot_sidecar::identity::{
    IDENTITY_FILE, load_or_create_keys, open_memory_engine, open_sqlite_engine,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Storage {
    /// SQLite database in the state dir
    Sqlite,
    /// Nothing survives a restart
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "marmot-sidecar")]
#[command(about = "Holds Marmot group state and serves it to one host over stdin/stdout")]
struct Cli {
    /// State directory (identity + group database persist here between runs)
    #[arg(long, default_value = ".marmot-sidecar")]
    state_dir: PathBuf,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Storage::Sqlite)]
    storage: Storage,

    /// Identity file (defaults to <state-dir>/identity.json)
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the IPC frames
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("create state dir {}", cli.state_dir.display()))?;
    let identity_path = cli
        .identity
        .clone()
        .unwrap_or_else(|| cli.state_dir.join(IDENTITY_FILE));
    let keys = load_or_create_keys(&identity_path)?;
    let config = GroupConfig::default();

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let exit = match cli.storage {
        Storage::Sqlite => {
            let engine = open_sqlite_engine(&cli.state_dir, keys, config)?;
            daemon::serve(engine, stdin, stdout).await?
        }
        Storage::Memory => daemon::serve(open_memory_engine(keys, config), stdin, stdout).await?,
    };

    match exit {
        Exit::Shutdown => tracing::info!("Sidecar shut down by host"),
        Exit::Disconnected => tracing::info!("Host disconnected"),
    }
    Ok(())
}
