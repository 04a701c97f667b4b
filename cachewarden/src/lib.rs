//! cachewarden - disk-cache eviction daemon for content-addressed build caches
//!
//! An external producer (a remote build-cache HTTP server) writes cache
//! entries under a *listen directory*; a mirroring *cache directory* holds
//! the files eligible for eviction. cachewarden watches the listen tree with
//! inotify, keeps a bounded-memory top-K sketch of hot cache keys, and
//! deletes cold files once the disk's free-space ratio falls below the
//! configured floor.
//!
//! # High-Level API
//!
//! ```ignore
//! use cachewarden::config::EvictionConfig;
//! use cachewarden::disk::{DiskCache, StatvfsProbe};
//! use cachewarden::eviction::EvictionController;
//! use cachewarden::watch::{PathMapper, TreeWatcher};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = EvictionConfig::new("/mnt/bazel-disks", "/data/bazel/cache");
//! config.validate()?;
//!
//! let watcher = TreeWatcher::new(&config.listen_dir)?;
//! let controller = EvictionController::new(
//!     config.clone(),
//!     Arc::new(DiskCache::new(config.cache_dir.clone())),
//!     PathMapper::new(&config.listen_dir, &config.cache_dir),
//!     Arc::new(StatvfsProbe),
//! );
//!
//! let shutdown = CancellationToken::new();
//! let events = watcher.spawn(shutdown.clone());
//! let handle = controller.spawn(events, shutdown.clone());
//! // ... shutdown.cancel() and handle.join().await on exit
//! ```

pub mod config;
pub mod disk;
pub mod eviction;
pub mod logging;
pub mod metrics;
pub mod sketch;
pub mod watch;

/// Version of the cachewarden library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
