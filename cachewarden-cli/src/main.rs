//! cachewarden CLI - disk-cache eviction daemon.
//!
//! Watches a listen directory for cache traffic, tracks hot keys in a
//! bounded sketch, and evicts cold files from the cache directory when the
//! disk runs low. The producing cache server and any metrics exporter run
//! as separate processes; this binary only observes and deletes.
//!
//! # Architecture
//!
//! - `Cli`: argument parsing (clap)
//! - `CliError`: centralized error handling with user-friendly messages
//! - `serve`: runtime wiring for the watcher, controller and gauge reporter

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use error::CliError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cachewarden::config::EvictionConfig;
use cachewarden::disk::{DiskCache, StatvfsProbe, UsageProbe};
use cachewarden::eviction::EvictionController;
use cachewarden::logging;
use cachewarden::metrics::run_disk_gauges;
use cachewarden::watch::{PathMapper, TreeWatcher};

#[derive(Parser)]
#[command(name = "cachewarden")]
#[command(version = cachewarden::VERSION)]
#[command(about = "Disk-cache eviction daemon for content-addressed build caches", long_about = None)]
struct Cli {
    /// Directory the cache server writes into (watched recursively)
    #[arg(long)]
    listen_dir: PathBuf,

    /// Directory holding the evictable cache files
    #[arg(long)]
    cache_dir: PathBuf,

    /// Minimum percent of blocks free before evicting entries
    #[arg(long, default_value_t = 5.0)]
    min_percent_blocks_free: f64,

    /// Continue evicting until at least this percent of blocks are free
    #[arg(long, default_value_t = 20.0)]
    evict_until_percent_blocks_free: f64,

    /// Seconds between sweep-eligibility checks
    #[arg(long, default_value_t = 900)]
    sweep_interval_secs: u64,

    /// Seconds between disk gauge refreshes
    #[arg(long, default_value_t = 10)]
    metrics_update_interval_secs: u64,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: String,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let _logging_guard = logging::init_logging(&cli.log_dir, logging::default_log_file())
        .map_err(CliError::LoggingInit)?;

    let config = EvictionConfig::new(cli.listen_dir, cli.cache_dir)
        .with_min_percent_blocks_free(cli.min_percent_blocks_free)
        .with_evict_until_percent_blocks_free(cli.evict_until_percent_blocks_free)
        .with_sweep_tick(Duration::from_secs(cli.sweep_interval_secs))
        .with_metrics_update_interval(Duration::from_secs(cli.metrics_update_interval_secs));

    config
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;
    config
        .validate_dirs()
        .map_err(|e| CliError::Config(e.to_string()))?;

    info!(
        version = cachewarden::VERSION,
        listen_dir = %config.listen_dir.display(),
        cache_dir = %config.cache_dir.display(),
        "cachewarden starting"
    );

    let runtime = tokio::runtime::Runtime::new().map_err(CliError::Runtime)?;
    runtime.block_on(serve(config))
}

async fn serve(config: EvictionConfig) -> Result<(), CliError> {
    let watcher = TreeWatcher::new(&config.listen_dir)?;

    let disk = Arc::new(DiskCache::new(config.cache_dir.clone()));
    let mapper = PathMapper::new(&config.listen_dir, &config.cache_dir);
    let probe: Arc<dyn UsageProbe> = Arc::new(StatvfsProbe);

    let controller =
        EvictionController::new(config.clone(), Arc::clone(&disk), mapper, Arc::clone(&probe));

    let shutdown = CancellationToken::new();
    let events = watcher.spawn(shutdown.clone());
    let handle = controller.spawn(events, shutdown.clone());

    let gauges = tokio::spawn(run_disk_gauges(
        Arc::clone(&probe),
        config.cache_dir.clone(),
        config.metrics_update_interval,
        shutdown.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }

    shutdown.cancel();
    handle.join().await;
    let _ = gauges.await;

    info!("cachewarden stopped");
    Ok(())
}
