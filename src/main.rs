//! querybridge entry point
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout. stdout carries protocol frames
//! only; logs go to stderr.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use querybridge::config::{default_data_dir, BridgeConfig};
use querybridge::{Bridge, DatabaseRegistry, FrameWriter, NativeConnector};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Streaming database query bridge
#[derive(Parser, Debug)]
#[command(name = "querybridge")]
#[command(about = "Session-oriented streaming database bridge over stdio JSON-RPC")]
#[command(version)]
struct Cli {
    /// Directory holding databases.json and credentials.json
    #[arg(long, env = "QUERYBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Keep saved databases in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Default log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Batch size used when a query does not ask for one
    #[arg(long)]
    default_batch_size: Option<usize>,

    /// Upper bound for requested batch sizes
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Per-fetch timeout in milliseconds
    #[arg(long)]
    fetch_timeout_ms: Option<u64>,

    /// Handshake timeout in milliseconds for connections without `connectTimeoutMs`
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
}

impl Cli {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        let mut config = BridgeConfig { data_dir, ephemeral: self.ephemeral, ..BridgeConfig::default() };
        if let Some(size) = self.default_batch_size {
            config.default_batch_size = size.max(1);
        }
        if let Some(size) = self.max_batch_size {
            config.max_batch_size = size.max(1);
        }
        if let Some(ms) = self.fetch_timeout_ms.filter(|ms| *ms > 0) {
            config.fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms.filter(|ms| *ms > 0) {
            config.connect_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = cli.bridge_config()?;
    let registry = DatabaseRegistry::open(&config).context("failed to open database registry")?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        ephemeral = config.ephemeral,
        version = env!("CARGO_PKG_VERSION"),
        "starting querybridge"
    );

    let bridge = Arc::new(Bridge::new(
        config,
        registry,
        Arc::new(NativeConnector),
        FrameWriter::stdout(),
    ));
    bridge.serve(tokio::io::stdin()).await.context("bridge stopped unexpectedly")?;

    tracing::info!("querybridge exited");
    Ok(())
}
