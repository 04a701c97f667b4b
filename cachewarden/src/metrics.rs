//! Disk occupancy gauges.
//!
//! The daemon exposes three gauges for an external collector to scrape:
//! `disk_free_gb`, `disk_used_gb` and `disk_total_gb`. They are published
//! through the `metrics` facade; wiring an exporter (or not) is the
//! embedder's business.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::disk::UsageProbe;

/// Periodically refreshes the disk gauges for `cache_dir` until cancelled.
pub async fn run_disk_gauges(
    probe: Arc<dyn UsageProbe>,
    cache_dir: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        cache_dir = %cache_dir.display(),
        interval_secs = interval.as_secs(),
        "Disk gauge reporter started"
    );

    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Disk gauge reporter shutting down");
                break;
            }

            _ = tick.tick() => match probe.usage(&cache_dir) {
                Ok(usage) => {
                    gauge!("disk_free_gb").set(usage.bytes_free as f64 / 1e9);
                    gauge!("disk_used_gb").set(usage.bytes_used as f64 / 1e9);
                    gauge!("disk_total_gb").set(usage.total_bytes() as f64 / 1e9);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read disk usage for gauges");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::disk::DiskUsage;

    struct CountingProbe {
        calls: Arc<AtomicUsize>,
    }

    impl UsageProbe for CountingProbe {
        fn usage(&self, _path: &Path) -> io::Result<DiskUsage> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(DiskUsage {
                percent_blocks_free: 50.0,
                bytes_free: 500_000_000_000,
                bytes_used: 500_000_000_000,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_polls_the_probe_until_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(CountingProbe {
            calls: Arc::clone(&calls),
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_disk_gauges(
            probe,
            PathBuf::from("/"),
            Duration::from_secs(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.cancel();
        task.await.unwrap();

        // First immediate tick plus three interval ticks.
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }
}
