//! The eviction controller: drives events into the sketch and cold files
//! off the disk.
//!
//! # Architecture
//!
//! Two long-lived loops cooperate around the shared sketch:
//!
//! 1. **Ingest loop** - consumes watcher events, maps them to cache keys and
//!    feeds the sketch (creations weigh 10, opens weigh 1, so freshly
//!    produced artifacts rank ahead of equally-read old ones). A slow ticker
//!    checks whether enough writes accumulated to justify a full sweep.
//! 2. **Expelled loop** - consumes demotion hints from the sketch and, only
//!    while the disk is under pressure, deletes the demoted files. Disk
//!    usage is cached between refreshes so the hint path stays cheap.
//!
//! A full sweep ages the sketch, snapshots the hot set, and deletes every
//! cache file outside it, coldest first. Sweeps are expensive, so they are
//! double-gated: by write volume (`maybe_sweep`) and by actual disk
//! pressure (`full_sweep` returns after fading when there is room).
//!
//! The sketch is the only shared mutable state; one mutex covers its slots
//! and heap, with critical sections bounded by depth + log K. The event and
//! write counters are relaxed atomics - only monotonicity between resets
//! matters, not exactness.
//!
//! Shutdown is cooperative: cancelling the token stops the watcher, the
//! event stream ends, and both loops exit.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EvictionConfig;
use crate::disk::{DiskCache, DiskUsage, UsageProbe};
use crate::sketch::{ExpelledEvent, TopkSketch};
use crate::watch::{PathMapper, WatchEvent};

/// Sketch weight of a file creation.
const CREATE_WEIGHT: u32 = 10;

/// Sketch weight of a file open.
const OPEN_WEIGHT: u32 = 1;

/// Free-block percentage above which demotion hints are ignored.
const EXPELLED_PRESSURE_PERCENT: f64 = 50.0;

/// Free-block percentage above which a sweep stops after fading.
const SWEEP_PRESSURE_PERCENT: f64 = 30.0;

/// Result of one full sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// Files enumerated from the cache tree.
    pub examined: usize,
    /// Files deleted (including races where another actor got there first).
    pub deleted: usize,
    /// Files that failed to delete and were skipped.
    pub failed: usize,
    /// Files retained because they are in the hot set.
    pub kept_hot: usize,
    /// True when the disk was not under pressure and only fading ran.
    pub faded_only: bool,
    /// Wall-clock duration of the sweep.
    pub duration_ms: u64,
}

/// Join handle for the controller's two loops.
pub struct ControllerHandle {
    ingest: JoinHandle<()>,
    expelled: JoinHandle<()>,
}

impl ControllerHandle {
    /// Waits for both loops to exit. Call after cancelling the shutdown
    /// token.
    pub async fn join(self) {
        if let Err(e) = self.ingest.await {
            warn!(error = %e, "Ingest loop task failed");
        }
        if let Err(e) = self.expelled.await {
            warn!(error = %e, "Expelled loop task failed");
        }
    }
}

/// Owns the sketch, the disk index and the eviction policy.
pub struct EvictionController {
    shared: Arc<Shared>,
    expelled_rx: mpsc::Receiver<ExpelledEvent>,
}

struct Shared {
    config: EvictionConfig,
    disk: Arc<DiskCache>,
    mapper: PathMapper,
    sketch: Mutex<TopkSketch>,
    usage: Arc<dyn UsageProbe>,
    event_count: AtomicI64,
    write_count: AtomicI64,
}

impl EvictionController {
    /// Creates a controller. The sketch is sized from the configuration and
    /// starts empty; after a cold start eviction behaves conservatively
    /// until observed traffic rebuilds the hot set.
    pub fn new(
        config: EvictionConfig,
        disk: Arc<DiskCache>,
        mapper: PathMapper,
        usage: Arc<dyn UsageProbe>,
    ) -> Self {
        let (expelled_tx, expelled_rx) = mpsc::channel(config.expelled_channel_capacity);
        let sketch = TopkSketch::new(
            config.hot_key_capacity,
            config.sketch_width(),
            config.sketch_depth as usize,
            config.decay_base,
            config.min_count_to_keep,
            expelled_tx,
        );

        info!(
            cache_dir = %disk.root().display(),
            sketch_slots = config.sketch_width() * config.sketch_depth as usize,
            hot_key_capacity = config.hot_key_capacity,
            min_percent_blocks_free = config.min_percent_blocks_free,
            evict_until_percent_blocks_free = config.evict_until_percent_blocks_free,
            "Eviction controller created"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                disk,
                mapper,
                sketch: Mutex::new(sketch),
                usage,
                event_count: AtomicI64::new(0),
                write_count: AtomicI64::new(0),
            }),
            expelled_rx,
        }
    }

    /// Spawns the ingest and expelled loops.
    ///
    /// The loops run until `shutdown` is cancelled or `events` closes.
    pub fn spawn(
        self,
        events: mpsc::Receiver<WatchEvent>,
        shutdown: CancellationToken,
    ) -> ControllerHandle {
        let Self {
            shared,
            expelled_rx,
        } = self;

        let ingest = tokio::spawn(Shared::run_ingest(
            Arc::clone(&shared),
            events,
            shutdown.clone(),
        ));
        let expelled = tokio::spawn(Shared::run_expelled(shared, expelled_rx, shutdown));

        ControllerHandle { ingest, expelled }
    }

    /// Feeds a single watcher event through mapping and into the sketch.
    pub fn handle_event(&self, event: WatchEvent) {
        self.shared.handle_event(event);
    }

    /// Runs the sweep-eligibility check the ticker normally runs.
    pub fn maybe_sweep(&self) {
        self.shared.maybe_sweep();
    }

    /// Runs a full sweep unconditionally (still pressure-gated internally).
    pub fn full_sweep(&self) -> io::Result<SweepOutcome> {
        self.shared.full_sweep()
    }

    /// Writes observed since the last counter reset.
    pub fn write_count(&self) -> i64 {
        self.shared.write_count.load(Ordering::Relaxed)
    }

    /// Events observed since the last counter reset.
    pub fn event_count(&self) -> i64 {
        self.shared.event_count.load(Ordering::Relaxed)
    }
}

impl Shared {
    async fn run_ingest(
        shared: Arc<Self>,
        mut events: mpsc::Receiver<WatchEvent>,
        shutdown: CancellationToken,
    ) {
        info!(
            sweep_tick_secs = shared.config.sweep_tick.as_secs(),
            "Ingest loop started"
        );

        let mut tick = tokio::time::interval(shared.config.sweep_tick);
        // Skip the first immediate tick.
        tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Ingest loop shutting down");
                    break;
                }

                maybe_event = events.recv() => match maybe_event {
                    None => {
                        info!("Event stream ended, ingest loop exiting");
                        break;
                    }
                    Some(event) => shared.handle_event(event),
                },

                _ = tick.tick() => shared.maybe_sweep(),
            }
        }
    }

    async fn run_expelled(
        shared: Arc<Self>,
        mut expelled: mpsc::Receiver<ExpelledEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Expelled-key loop started");
        let mut usage = CachedUsage::new(shared.config.usage_cache_ttl);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Expelled-key loop shutting down");
                    break;
                }

                maybe_event = expelled.recv() => match maybe_event {
                    None => {
                        debug!("Expelled channel closed, loop exiting");
                        break;
                    }
                    Some(event) => shared.handle_expelled(event, &mut usage),
                },
            }
        }
    }

    /// Maps one watcher event into the sketch. The watcher already filters
    /// directory events and spurious trailing-slash names.
    fn handle_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Overflow => {
                // Lost events only skew the sketch; nothing to replay.
                debug!("Kernel queue overflow reached the ingest loop");
            }
            WatchEvent::File { path, created } => {
                self.event_count.fetch_add(1, Ordering::Relaxed);

                let key = match self.mapper.map(&path) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "Dropping unmappable event");
                        return;
                    }
                };

                let weight = if created {
                    self.write_count.fetch_add(1, Ordering::Relaxed);
                    CREATE_WEIGHT
                } else {
                    OPEN_WEIGHT
                };
                self.sketch.lock().unwrap().add(&key, weight);
            }
        }
    }

    /// Ticker body: sweep only once enough writes accumulated, with the bar
    /// raised while the disk still has plenty of room.
    fn maybe_sweep(&self) {
        let usage = match self.usage.usage(self.disk.root()) {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Failed to query disk usage, skipping sweep check");
                return;
            }
        };

        let threshold = if usage.percent_blocks_free > self.config.low_pressure_threshold_percent {
            self.config.write_threshold_low_pressure
        } else {
            self.config.write_threshold_high_pressure
        };

        let writes = self.write_count.load(Ordering::Relaxed);
        if writes <= threshold {
            debug!(
                writes,
                threshold,
                percent_free = usage.percent_blocks_free,
                "Write volume below sweep threshold"
            );
            return;
        }

        self.write_count.store(0, Ordering::Relaxed);
        self.event_count.store(0, Ordering::Relaxed);

        match self.full_sweep() {
            Ok(outcome) if outcome.faded_only => {
                info!("Sweep skipped deletion, disk not under pressure")
            }
            Ok(outcome) => info!(
                examined = outcome.examined,
                deleted = outcome.deleted,
                failed = outcome.failed,
                kept_hot = outcome.kept_hot,
                duration_ms = outcome.duration_ms,
                "Sweep complete"
            ),
            Err(e) => warn!(error = %e, "Sweep aborted, disk usage unavailable"),
        }
    }

    /// Ages the sketch, then deletes every cache file outside the hot set,
    /// coldest first.
    ///
    /// A disk-usage failure aborts the sweep (no safe fallback exists);
    /// individual deletion failures are logged and skipped.
    fn full_sweep(&self) -> io::Result<SweepOutcome> {
        let start = Instant::now();

        let hot: HashSet<PathBuf> = {
            let mut sketch = self.sketch.lock().unwrap();
            sketch.fading();
            sketch.list().into_iter().map(|entry| entry.key).collect()
        };

        let usage = self.usage.usage(self.disk.root())?;
        if usage.percent_blocks_free > SWEEP_PRESSURE_PERCENT {
            debug!(
                percent_free = usage.percent_blocks_free,
                "Disk not under pressure, sketch faded only"
            );
            return Ok(SweepOutcome {
                faded_only: true,
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        let mut files = self.disk.entries();
        files.sort_by_key(|file| file.last_access);

        let mut outcome = SweepOutcome {
            examined: files.len(),
            ..Default::default()
        };

        for file in files {
            if hot.contains(&file.path) {
                outcome.kept_hot += 1;
                continue;
            }
            match self.disk.delete(&file.path) {
                Ok(()) => outcome.deleted += 1,
                // Someone else freed the space; that is the goal state.
                Err(e) if e.is_not_found() => outcome.deleted += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        path = %file.path.display(),
                        error = %e,
                        "Failed to delete cache entry, continuing sweep"
                    );
                }
            }
        }

        self.disk.cleanup_empty_dirs();
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    /// Acts on one demotion hint: delete the file, but only while the disk
    /// is actually under pressure. Hints during quiet periods are dropped so
    /// the cache is not whipsawed.
    fn handle_expelled(&self, event: ExpelledEvent, usage: &mut CachedUsage) {
        let Some(reading) = usage.get(self.usage.as_ref(), self.disk.root()) else {
            debug!(
                key = %event.key.display(),
                "No disk usage reading available, ignoring demotion"
            );
            return;
        };

        if reading.percent_blocks_free > EXPELLED_PRESSURE_PERCENT {
            return;
        }

        match self.disk.delete(&event.key) {
            Ok(()) => debug!(
                key = %event.key.display(),
                count = event.count,
                "Deleted demoted cache entry"
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                key = %event.key.display(),
                error = %e,
                "Failed to delete demoted cache entry"
            ),
        }
    }
}

/// Disk-usage reading refreshed at most once per TTL.
///
/// On probe failure the last reading is reused: acting on stale pressure
/// data beats acting blind on an advisory path.
struct CachedUsage {
    ttl: Duration,
    reading: Option<(Instant, DiskUsage)>,
}

impl CachedUsage {
    fn new(ttl: Duration) -> Self {
        Self { ttl, reading: None }
    }

    fn get(&mut self, probe: &dyn UsageProbe, path: &std::path::Path) -> Option<DiskUsage> {
        if let Some((taken_at, reading)) = self.reading {
            if taken_at.elapsed() < self.ttl {
                return Some(reading);
            }
        }
        match probe.usage(path) {
            Ok(reading) => {
                self.reading = Some((Instant::now(), reading));
                Some(reading)
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh disk usage for expelled path");
                self.reading.map(|(_, reading)| reading)
            }
        }
    }
}
