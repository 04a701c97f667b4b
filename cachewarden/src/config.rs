//! Configuration for the eviction daemon.
//!
//! All options are process-lifetime immutable: the CLI resolves flags into
//! an [`EvictionConfig`] once at startup and the daemon never mutates it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default minimum percent of free blocks before eviction becomes eligible.
pub const DEFAULT_MIN_PERCENT_BLOCKS_FREE: f64 = 5.0;

/// Default free-block percentage that eviction aims to restore.
pub const DEFAULT_EVICT_UNTIL_PERCENT_BLOCKS_FREE: f64 = 20.0;

/// Default number of distinct hot keys the sketch is sized for.
pub const DEFAULT_HOT_KEY_CAPACITY: u32 = 2_000_000;

/// Default number of hash rows in the sketch.
pub const DEFAULT_SKETCH_DEPTH: u32 = 4;

/// Default exponential-decay base for counter displacement.
pub const DEFAULT_DECAY_BASE: f64 = 0.925;

/// Default minimum estimated count before a key is admitted to the top-K heap.
pub const DEFAULT_MIN_COUNT_TO_KEEP: u32 = 1024;

/// Default interval between sweep-eligibility checks (15 minutes).
pub const DEFAULT_SWEEP_TICK_SECS: u64 = 15 * 60;

/// Default write-counter threshold when the disk is already under pressure.
pub const DEFAULT_WRITE_THRESHOLD_HIGH_PRESSURE: i64 = 15_000;

/// Default write-counter threshold when the disk has plenty of room.
pub const DEFAULT_WRITE_THRESHOLD_LOW_PRESSURE: i64 = 35_000;

/// Free-block percentage above which the disk counts as low-pressure.
pub const DEFAULT_LOW_PRESSURE_THRESHOLD_PERCENT: f64 = 70.0;

/// Default interval between disk gauge refreshes.
pub const DEFAULT_METRICS_UPDATE_INTERVAL_SECS: u64 = 10;

/// Default maximum age of the cached disk-usage reading used by the
/// expelled-event path.
pub const DEFAULT_USAGE_CACHE_TTL_SECS: u64 = 5 * 60;

/// Default capacity of the advisory expelled-key channel.
pub const DEFAULT_EXPELLED_CHANNEL_CAPACITY: usize = 1024;

/// Columns per sketch row are sized as `1024 * sketch_width_factor`.
const SKETCH_WIDTH_UNIT: usize = 1024;

/// Configuration for the eviction daemon.
///
/// Numeric defaults are tunables, not invariants; they match the deployed
/// values for a multi-terabyte Bazel cache disk.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Directory the producer writes into; watched recursively.
    pub listen_dir: PathBuf,

    /// Directory holding the files eligible for deletion.
    pub cache_dir: PathBuf,

    /// Minimum percent of free blocks before eviction is considered.
    pub min_percent_blocks_free: f64,

    /// Free-block percentage eviction should restore. Accepted and reported
    /// but not consulted by the sweep; reserved for a future controller.
    pub evict_until_percent_blocks_free: f64,

    /// Number of distinct hot keys the top-K heap may track.
    pub hot_key_capacity: u32,

    /// Width multiplier for the sketch rows; derived from the capacity as
    /// `ceil(ln(hot_key_capacity))` unless overridden.
    pub sketch_width_factor: u32,

    /// Number of independent hash rows.
    pub sketch_depth: u32,

    /// Exponential-decay base for contended-slot displacement, in (0, 1).
    pub decay_base: f64,

    /// Minimum estimated count before a key is admitted to the heap.
    pub min_count_to_keep: u32,

    /// Interval between sweep-eligibility checks.
    pub sweep_tick: Duration,

    /// Write-counter threshold used when the disk is under pressure.
    pub write_threshold_high_pressure: i64,

    /// Write-counter threshold used when the disk is low-pressure.
    pub write_threshold_low_pressure: i64,

    /// Free-block percentage above which the low-pressure threshold applies.
    pub low_pressure_threshold_percent: f64,

    /// Interval between disk gauge refreshes.
    pub metrics_update_interval: Duration,

    /// Maximum age of the cached disk-usage reading on the expelled path.
    pub usage_cache_ttl: Duration,

    /// Capacity of the advisory expelled-key channel.
    pub expelled_channel_capacity: usize,
}

/// Configuration validation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be an absolute path to an existing directory: {path}")]
    BadDirectory { name: &'static str, path: PathBuf },

    #[error("decay_base must be in (0, 1), got {0}")]
    BadDecayBase(f64),

    #[error("{name} must be a percentage in [0, 100], got {value}")]
    BadPercent { name: &'static str, value: f64 },

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl EvictionConfig {
    /// Creates a configuration for the given directories with default knobs.
    pub fn new(listen_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_dir: listen_dir.into(),
            cache_dir: cache_dir.into(),
            min_percent_blocks_free: DEFAULT_MIN_PERCENT_BLOCKS_FREE,
            evict_until_percent_blocks_free: DEFAULT_EVICT_UNTIL_PERCENT_BLOCKS_FREE,
            hot_key_capacity: DEFAULT_HOT_KEY_CAPACITY,
            sketch_width_factor: width_factor_for_capacity(DEFAULT_HOT_KEY_CAPACITY),
            sketch_depth: DEFAULT_SKETCH_DEPTH,
            decay_base: DEFAULT_DECAY_BASE,
            min_count_to_keep: DEFAULT_MIN_COUNT_TO_KEEP,
            sweep_tick: Duration::from_secs(DEFAULT_SWEEP_TICK_SECS),
            write_threshold_high_pressure: DEFAULT_WRITE_THRESHOLD_HIGH_PRESSURE,
            write_threshold_low_pressure: DEFAULT_WRITE_THRESHOLD_LOW_PRESSURE,
            low_pressure_threshold_percent: DEFAULT_LOW_PRESSURE_THRESHOLD_PERCENT,
            metrics_update_interval: Duration::from_secs(DEFAULT_METRICS_UPDATE_INTERVAL_SECS),
            usage_cache_ttl: Duration::from_secs(DEFAULT_USAGE_CACHE_TTL_SECS),
            expelled_channel_capacity: DEFAULT_EXPELLED_CHANNEL_CAPACITY,
        }
    }

    /// Sets the hot-key capacity and rederives the width factor from it.
    pub fn with_hot_key_capacity(mut self, capacity: u32) -> Self {
        self.hot_key_capacity = capacity.max(1);
        self.sketch_width_factor = width_factor_for_capacity(self.hot_key_capacity);
        self
    }

    /// Overrides the derived sketch width factor.
    pub fn with_sketch_width_factor(mut self, factor: u32) -> Self {
        self.sketch_width_factor = factor.max(1);
        self
    }

    /// Sets the number of sketch rows.
    pub fn with_sketch_depth(mut self, depth: u32) -> Self {
        self.sketch_depth = depth.max(1);
        self
    }

    /// Sets the displacement decay base.
    pub fn with_decay_base(mut self, base: f64) -> Self {
        self.decay_base = base;
        self
    }

    /// Sets the heap admission threshold.
    pub fn with_min_count_to_keep(mut self, count: u32) -> Self {
        self.min_count_to_keep = count.max(1);
        self
    }

    /// Sets the sweep tick interval.
    pub fn with_sweep_tick(mut self, tick: Duration) -> Self {
        self.sweep_tick = tick;
        self
    }

    /// Sets the eviction floor (percent of free blocks).
    pub fn with_min_percent_blocks_free(mut self, percent: f64) -> Self {
        self.min_percent_blocks_free = percent.clamp(0.0, 100.0);
        self
    }

    /// Sets the eviction restore target (percent of free blocks).
    pub fn with_evict_until_percent_blocks_free(mut self, percent: f64) -> Self {
        self.evict_until_percent_blocks_free = percent.clamp(0.0, 100.0);
        self
    }

    /// Sets the interval between disk gauge refreshes.
    pub fn with_metrics_update_interval(mut self, interval: Duration) -> Self {
        self.metrics_update_interval = interval;
        self
    }

    /// Number of counter columns per sketch row.
    pub fn sketch_width(&self) -> usize {
        SKETCH_WIDTH_UNIT * self.sketch_width_factor as usize
    }

    /// Validates knob ranges. Directory existence is checked separately by
    /// [`validate_dirs`](Self::validate_dirs) so unit tests can build
    /// configurations for paths that do not exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.decay_base > 0.0 && self.decay_base < 1.0) {
            return Err(ConfigError::BadDecayBase(self.decay_base));
        }
        for (name, value) in [
            ("min_percent_blocks_free", self.min_percent_blocks_free),
            (
                "evict_until_percent_blocks_free",
                self.evict_until_percent_blocks_free,
            ),
            (
                "low_pressure_threshold_percent",
                self.low_pressure_threshold_percent,
            ),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::BadPercent { name, value });
            }
        }
        if self.hot_key_capacity == 0 {
            return Err(ConfigError::Zero("hot_key_capacity"));
        }
        if self.sketch_width_factor == 0 {
            return Err(ConfigError::Zero("sketch_width_factor"));
        }
        if self.sketch_depth == 0 {
            return Err(ConfigError::Zero("sketch_depth"));
        }
        if self.expelled_channel_capacity == 0 {
            return Err(ConfigError::Zero("expelled_channel_capacity"));
        }
        Ok(())
    }

    /// Validates that both directories exist, are directories, and are
    /// absolute. Fatal at startup.
    pub fn validate_dirs(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("listen_dir", &self.listen_dir),
            ("cache_dir", &self.cache_dir),
        ] {
            if !path.is_absolute() || !path.is_dir() {
                return Err(ConfigError::BadDirectory {
                    name,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Width factor derived from the hot-key capacity: `ceil(ln(capacity))`,
/// floored at 1 so degenerate capacities still get a usable sketch.
fn width_factor_for_capacity(capacity: u32) -> u32 {
    ((capacity.max(1) as f64).ln().ceil() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let config = EvictionConfig::new("/listen", "/cache");

        assert_eq!(config.min_percent_blocks_free, 5.0);
        assert_eq!(config.evict_until_percent_blocks_free, 20.0);
        assert_eq!(config.hot_key_capacity, 2_000_000);
        assert_eq!(config.sketch_depth, 4);
        assert_eq!(config.decay_base, 0.925);
        assert_eq!(config.min_count_to_keep, 1024);
        assert_eq!(config.sweep_tick, Duration::from_secs(900));
        assert_eq!(config.write_threshold_high_pressure, 15_000);
        assert_eq!(config.write_threshold_low_pressure, 35_000);
        assert_eq!(config.low_pressure_threshold_percent, 70.0);
    }

    #[test]
    fn width_factor_is_ceil_ln_of_capacity() {
        // ln(2_000_000) ~ 14.5 -> 15
        assert_eq!(width_factor_for_capacity(2_000_000), 15);
        // ln(1) = 0 -> floored at 1
        assert_eq!(width_factor_for_capacity(1), 1);
        assert_eq!(width_factor_for_capacity(0), 1);
    }

    #[test]
    fn sketch_width_scales_with_factor() {
        let config = EvictionConfig::new("/listen", "/cache").with_sketch_width_factor(3);
        assert_eq!(config.sketch_width(), 3 * 1024);
    }

    #[test]
    fn capacity_setter_rederives_width_factor() {
        let config = EvictionConfig::new("/listen", "/cache").with_hot_key_capacity(1000);
        // ln(1000) ~ 6.9 -> 7
        assert_eq!(config.sketch_width_factor, 7);
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(EvictionConfig::new("/listen", "/cache").validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_decay_base() {
        let config = EvictionConfig::new("/listen", "/cache").with_decay_base(1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadDecayBase(_))
        ));

        let config = EvictionConfig::new("/listen", "/cache").with_decay_base(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_percent() {
        let mut config = EvictionConfig::new("/listen", "/cache");
        config.low_pressure_threshold_percent = 150.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadPercent { .. })
        ));
    }

    #[test]
    fn percent_setters_clamp() {
        let config = EvictionConfig::new("/listen", "/cache")
            .with_min_percent_blocks_free(-3.0)
            .with_evict_until_percent_blocks_free(250.0);

        assert_eq!(config.min_percent_blocks_free, 0.0);
        assert_eq!(config.evict_until_percent_blocks_free, 100.0);
    }

    #[test]
    fn validate_dirs_rejects_missing_directory() {
        let config = EvictionConfig::new("/nonexistent/listen", "/nonexistent/cache");
        assert!(matches!(
            config.validate_dirs(),
            Err(ConfigError::BadDirectory { name: "listen_dir", .. })
        ));
    }

    #[test]
    fn validate_dirs_rejects_relative_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = EvictionConfig::new("relative/listen", temp.path());
        config.cache_dir = temp.path().to_path_buf();
        assert!(config.validate_dirs().is_err());
    }

    #[test]
    fn validate_dirs_accepts_existing_directories() {
        let listen = tempfile::TempDir::new().unwrap();
        let cache = tempfile::TempDir::new().unwrap();
        let config = EvictionConfig::new(listen.path(), cache.path());
        assert!(config.validate_dirs().is_ok());
    }
}
