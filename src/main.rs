//! TreeCache
//!
//! Command-line driver: opens a file-backed tree, writes a test pattern
//! through the cache, syncs it, reads it back and reports cache metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         treecache                          │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐    ┌────────────┐    ┌────────────┐        │
//! │  │    Tree    │───▶│ Controller │───▶│  Storage   │        │
//! │  │  (blocks)  │    │ (workers)  │    │   (file)   │        │
//! │  └────────────┘    └────────────┘    └────────────┘        │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use treecache::{Controller, ControllerConfig, IoState, LevelTable, Tree};

const POLL: Duration = Duration::from_millis(1);

// =============================================================================
// CLI Arguments
// =============================================================================

/// TreeCache - memory-cached block trees over flat files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backing file (created if missing)
    #[arg(long, env = "TREECACHE_FILE")]
    file: PathBuf,

    /// Per-level address widths, root first, summing to 64
    #[arg(long, env = "TREECACHE_LEVELS", default_value = "40,3,2,3,4,12")]
    levels: String,

    /// Controller configuration file (YAML); flags override its watermarks
    #[arg(long, env = "TREECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Lower cache watermark in bytes
    #[arg(long, env = "TREECACHE_LOWER")]
    lower: Option<u64>,

    /// Upper cache watermark in bytes
    #[arg(long, env = "TREECACHE_UPPER")]
    upper: Option<u64>,

    /// Worker threads (0 = one per core)
    #[arg(long, env = "TREECACHE_WORKERS")]
    workers: Option<usize>,

    /// Bytes of test pattern to write
    #[arg(long, env = "TREECACHE_BYTES", default_value = "1048576")]
    bytes: usize,

    /// Offset of the test pattern
    #[arg(long, env = "TREECACHE_OFFSET", default_value = "0")]
    offset: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if let Err(e) = run(&args).await {
        error!("treecache failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let levels: LevelTable = args.levels.parse().context("invalid --levels")?;

    info!("Starting treecache");
    info!("  File: {}", args.file.display());
    info!("  Levels: {}", levels);
    info!(
        "  Watermarks: {} / {} bytes",
        config.lower_watermark, config.upper_watermark
    );
    info!("  Workers: {}", config.resolved_concurrency());

    let ctrl = Controller::with_config(config)?;
    let tree = Tree::open(&args.file, levels)
        .with_context(|| format!("failed to open {}", args.file.display()))?;

    let pattern: Vec<u8> = (0..args.bytes).map(|i| b'0' + (i % 10) as u8).collect();
    let started = Instant::now();

    let written = tree
        .write(&ctrl, args.offset, pattern.clone())
        .wait_async(POLL)
        .await;
    expect_done("write", written)?;
    let synced = tree.sync(&ctrl).wait_async(POLL).await;
    expect_done("sync", synced)?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Pattern written and synced");

    let read = tree.read(&ctrl, args.offset, args.bytes);
    expect_done("read", read.wait_async(POLL).await)?;
    let bytes = read.into_bytes()?;
    if bytes.as_ref() != pattern.as_slice() {
        bail!("read back {} bytes that differ from the written pattern", bytes.len());
    }
    info!(bytes = bytes.len(), "Read back matches");

    expect_done("detach", tree.detach(&ctrl).wait_async(POLL).await)?;

    let metrics = ctrl.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    ctrl.shutdown();
    info!("treecache finished");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(lower) = args.lower {
        config.lower_watermark = lower;
    }
    if let Some(upper) = args.upper {
        config.upper_watermark = upper;
    }
    if let Some(workers) = args.workers {
        config.concurrency = workers;
    }
    config.validate()?;
    Ok(config)
}

fn expect_done(operation: &str, state: IoState) -> anyhow::Result<()> {
    match state {
        IoState::Done => Ok(()),
        other => bail!("{} finished as {}", operation, other),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
