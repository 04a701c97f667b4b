//! Translation of listen-tree event paths to cache-tree paths.
//!
//! The listen directory is a mount-of-mounts with one subdirectory per disk
//! (`disk1/`, `disk2/`, ...) while the cache layout strips that sharding.
//! The `ac`/`cas`/`content_addressable` markers are the Bazel cache
//! sub-roots; when one appears in an event path the cache path starts there,
//! otherwise the single per-disk shard segment is dropped.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Path segments that mark the start of a cache sub-root.
const CACHE_ROOT_MARKERS: [&str; 3] = ["ac", "cas", "content_addressable"];

/// Errors from mapping an event path.
#[derive(Debug, Error)]
pub enum MapError {
    /// The event path is not under the listen directory.
    #[error("path {path} is not under listen directory {listen_dir}")]
    OutsideListenTree { path: PathBuf, listen_dir: PathBuf },

    /// The event path has no file component below the listen directory.
    #[error("path {path} has no file component below the listen directory")]
    NoFileComponent { path: PathBuf },
}

/// Maps absolute listen-tree paths to the corresponding cache-tree paths.
///
/// The output always lies under the cache directory, which is what makes
/// downstream deletion safe.
#[derive(Debug, Clone)]
pub struct PathMapper {
    listen_dir: PathBuf,
    cache_dir: PathBuf,
}

impl PathMapper {
    /// Creates a mapper between the two roots. Both are absolute paths
    /// without trailing separators; `PathBuf` normalizes either way.
    pub fn new(listen_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_dir: listen_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Translates an event path under the listen tree to its cache path.
    pub fn map(&self, path: &Path) -> Result<PathBuf, MapError> {
        let relative = path
            .strip_prefix(&self.listen_dir)
            .map_err(|_| MapError::OutsideListenTree {
                path: path.to_path_buf(),
                listen_dir: self.listen_dir.clone(),
            })?;

        let segments: Vec<&std::ffi::OsStr> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(segment) => Some(segment),
                _ => None,
            })
            .collect();

        if segments.is_empty() {
            return Err(MapError::NoFileComponent {
                path: path.to_path_buf(),
            });
        }

        let marker = segments
            .iter()
            .position(|s| CACHE_ROOT_MARKERS.iter().any(|m| *s == std::ffi::OsStr::new(m)));

        // Truncate at the first cache sub-root marker; without one, drop the
        // leading per-disk shard segment when there is anything below it.
        let start = match marker {
            Some(idx) => idx,
            None if segments.len() > 1 => 1,
            None => 0,
        };

        let mut mapped = self.cache_dir.clone();
        for segment in &segments[start..] {
            mapped.push(segment);
        }
        Ok(mapped)
    }

    /// The cache directory all mapped paths are rooted at.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
