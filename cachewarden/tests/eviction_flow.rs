//! End-to-end flow: producer writes into the listen tree, the watcher feeds
//! the controller, and a pressured disk loses its cold files while hot ones
//! survive.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cachewarden::config::EvictionConfig;
use cachewarden::disk::{DiskCache, DiskUsage, UsageProbe};
use cachewarden::eviction::EvictionController;
use cachewarden::watch::{PathMapper, TreeWatcher};

/// Usage probe pinned to a fixed free percentage.
struct FixedProbe {
    percent_blocks_free: f64,
}

impl UsageProbe for FixedProbe {
    fn usage(&self, _path: &Path) -> std::io::Result<DiskUsage> {
        Ok(DiskUsage {
            percent_blocks_free: self.percent_blocks_free,
            bytes_free: 1_000_000,
            bytes_used: 9_000_000,
        })
    }
}

/// Creates a cache file with an access time planted in the past.
fn plant_cache_file(cache_root: &Path, name: &str, age_secs: u64) -> std::path::PathBuf {
    let path = cache_root.join(name);
    std::fs::write(&path, b"artifact").unwrap();
    let atime = SystemTime::now() - Duration::from_secs(age_secs);
    filetime::set_file_atime(&path, filetime::FileTime::from_system_time(atime)).unwrap();
    path
}

/// Waits until `pred` holds or the deadline passes.
async fn wait_for(mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    pred()
}

#[tokio::test(flavor = "multi_thread")]
async fn produced_files_survive_the_sweep_while_cold_files_are_evicted() {
    let listen = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    std::fs::create_dir(listen.path().join("disk1")).unwrap();

    // A cold artifact from a previous life, and its hot sibling.
    let cold = plant_cache_file(cache.path(), "stale-artifact", 3600);
    let hot = plant_cache_file(cache.path(), "fresh-artifact", 10);

    // Aggressive knobs so the flow completes within the test: every write
    // makes the next tick sweep-eligible, and the disk reads as pressured.
    let mut config = EvictionConfig::new(listen.path(), cache.path())
        .with_hot_key_capacity(64)
        .with_sketch_width_factor(1)
        .with_min_count_to_keep(1)
        .with_sweep_tick(Duration::from_millis(200));
    config.write_threshold_high_pressure = 0;
    config.write_threshold_low_pressure = 0;

    let watcher = TreeWatcher::new(listen.path()).unwrap();
    let controller = EvictionController::new(
        config,
        Arc::new(DiskCache::new(cache.path())),
        PathMapper::new(listen.path(), cache.path()),
        Arc::new(FixedProbe {
            percent_blocks_free: 10.0,
        }),
    );

    let shutdown = CancellationToken::new();
    let events = watcher.spawn(shutdown.clone());
    let handle = controller.spawn(events, shutdown.clone());

    // The producer writes the hot entry through the listen tree; the mapper
    // strips the per-disk shard, so the sketch tracks the cache-side path.
    std::fs::write(listen.path().join("disk1/fresh-artifact"), b"artifact").unwrap();

    let cold_evicted = wait_for(|| !cold.exists()).await;
    assert!(cold_evicted, "cold artifact should be swept");
    assert!(hot.exists(), "hot artifact must survive the sweep");

    shutdown.cancel();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn quiet_disk_never_deletes_anything() {
    let listen = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    std::fs::create_dir(listen.path().join("disk1")).unwrap();

    let cold = plant_cache_file(cache.path(), "stale-artifact", 3600);

    let mut config = EvictionConfig::new(listen.path(), cache.path())
        .with_hot_key_capacity(64)
        .with_sketch_width_factor(1)
        .with_min_count_to_keep(1)
        .with_sweep_tick(Duration::from_millis(100));
    config.write_threshold_high_pressure = 0;
    config.write_threshold_low_pressure = 0;

    let watcher = TreeWatcher::new(listen.path()).unwrap();
    let controller = EvictionController::new(
        config,
        Arc::new(DiskCache::new(cache.path())),
        PathMapper::new(listen.path(), cache.path()),
        Arc::new(FixedProbe {
            percent_blocks_free: 80.0,
        }),
    );

    let shutdown = CancellationToken::new();
    let events = watcher.spawn(shutdown.clone());
    let handle = controller.spawn(events, shutdown.clone());

    // Plenty of write traffic, but the disk has room: sweeps fade only.
    for i in 0..5 {
        std::fs::write(
            listen.path().join(format!("disk1/artifact-{i}")),
            b"artifact",
        )
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(cold.exists(), "no deletion may happen while the disk is free");

    shutdown.cancel();
    handle.join().await;
}
