//! Index over the on-disk cache directory.
//!
//! The cache tree is owned by an external producer; this index only ever
//! enumerates it and unlinks files. Enumeration swallows per-entry errors
//! because partial listings are acceptable for eviction decisions - a few
//! missing keys just means a few files skip one sweep, whereas aborting the
//! walk would skip them all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

/// A cache file observed during an enumeration pass.
///
/// Entries are transient snapshots taken at sweep time; the file may be gone
/// by the time it is acted on.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Absolute path of the file, rooted at the cache directory.
    pub path: PathBuf,
    /// Last access time, falling back to the wall clock when the filesystem
    /// does not report atimes.
    pub last_access: SystemTime,
}

/// Errors from cache index operations.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// Refused to touch a path outside the cache root.
    #[error("refusing to delete {path}: outside cache root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// I/O error from the underlying filesystem.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DiskCacheError {
    /// True when the error is a missing file, which callers on the eviction
    /// path treat as success (someone else already freed the space).
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiskCacheError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Disk-backed cache index rooted at a single directory.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Creates an index over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory containing all on-disk cache entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Converts a cache entry key (relative to the root) to a path on disk.
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Converts a path on disk back to a cache key, assuming the path is
    /// under the root.
    pub fn key_for_path<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    /// Walks the cache tree and returns every regular file with its last
    /// access time.
    ///
    /// Transient failures while walking are logged and tolerated; some keys
    /// missing is fine, returning none of them due to one error is not.
    pub fn entries(&self) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        collect_entries(&self.root, &mut entries);
        entries
    }

    /// Unlinks the file at `path`.
    ///
    /// Paths outside the cache root are rejected; event-to-key mapping is
    /// supposed to make them unrepresentable, so hitting the guard is a bug
    /// upstream, not a condition to recover from here.
    pub fn delete(&self, path: &Path) -> Result<(), DiskCacheError> {
        if !path.starts_with(&self.root) {
            return Err(DiskCacheError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.root.clone(),
            });
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// Removes directories left empty by deletions.
    ///
    /// Walks depth-first; removal of non-empty directories fails silently.
    pub fn cleanup_empty_dirs(&self) {
        cleanup_empty_dirs(&self.root);
    }
}

/// Recursively collects files from a directory, tolerating errors.
fn collect_entries(dir: &Path, entries: &mut Vec<FileEntry>) {
    let dir_entries = match fs::read_dir(dir) {
        Ok(dir_entries) => dir_entries,
        Err(e) => {
            warn!(
                dir = %dir.display(),
                error = %e,
                "Failed to read directory during cache enumeration"
            );
            return;
        }
    };

    for entry in dir_entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to read a cache entry, skipping"
                );
                continue;
            }
        };

        let path = entry.path();
        if path.is_dir() {
            collect_entries(&path, entries);
        } else if let Ok(metadata) = entry.metadata() {
            let last_access = metadata
                .accessed()
                .unwrap_or_else(|_| SystemTime::now());
            entries.push(FileEntry { path, last_access });
        } else {
            debug!(path = %path.display(), "Failed to stat cache entry, skipping");
        }
    }
}

/// Remove empty directories below `dir`, depth-first.
fn cleanup_empty_dirs(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            cleanup_empty_dirs(&path);
            let _ = fs::remove_dir(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, size: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![0u8; size]).unwrap();
    }

    #[test]
    fn entries_empty_for_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path());
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn entries_walks_nested_tree_skipping_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        write_file(&root.join("cas/aa/deadbeef"), 100);
        write_file(&root.join("cas/bb/cafef00d"), 200);
        write_file(&root.join("ac/11/22334455"), 300);

        let cache = DiskCache::new(root);
        let entries = cache.entries();

        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.path.starts_with(root)));
        assert!(entries.iter().all(|e| e.path.is_file()));
    }

    #[test]
    fn entries_tolerates_missing_root() {
        let cache = DiskCache::new("/nonexistent/cachewarden/root");
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn key_path_round_trip() {
        let cache = DiskCache::new("/data1/bazel/cache");

        let path = cache.path_for_key("cas/aa/deadbeef");
        assert_eq!(path, PathBuf::from("/data1/bazel/cache/cas/aa/deadbeef"));

        let key = cache.key_for_path(&path).unwrap();
        assert_eq!(key, Path::new("cas/aa/deadbeef"));
    }

    #[test]
    fn key_for_path_outside_root_is_none() {
        let cache = DiskCache::new("/data1/bazel/cache");
        assert!(cache.key_for_path(Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn delete_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path());
        let path = temp_dir.path().join("cas/aa/deadbeef");
        write_file(&path, 10);

        cache.delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn delete_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path());

        let err = cache.delete(&temp_dir.path().join("gone")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_refuses_paths_outside_root() {
        let temp_dir = TempDir::new().unwrap();
        let other_dir = TempDir::new().unwrap();
        let victim = other_dir.path().join("innocent");
        write_file(&victim, 10);

        let cache = DiskCache::new(temp_dir.path());
        let err = cache.delete(&victim).unwrap_err();

        assert!(matches!(err, DiskCacheError::OutsideRoot { .. }));
        assert!(!err.is_not_found());
        assert!(victim.exists());
    }

    #[test]
    fn cleanup_removes_empty_directories_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("cas/aa/empty")).unwrap();
        write_file(&root.join("cas/bb/kept"), 10);

        let cache = DiskCache::new(root);
        cache.cleanup_empty_dirs();

        assert!(!root.join("cas/aa").exists());
        assert!(root.join("cas/bb/kept").exists());
    }

    #[test]
    fn entries_report_access_times_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let old = root.join("old");
        let new = root.join("new");
        write_file(&old, 10);
        write_file(&new, 10);

        let base = SystemTime::now() - std::time::Duration::from_secs(100);
        filetime::set_file_atime(&old, filetime::FileTime::from_system_time(base)).unwrap();
        filetime::set_file_atime(
            &new,
            filetime::FileTime::from_system_time(base + std::time::Duration::from_secs(50)),
        )
        .unwrap();

        let cache = DiskCache::new(root);
        let mut entries = cache.entries();
        entries.sort_by_key(|e| e.last_access);

        assert_eq!(entries[0].path, old);
        assert_eq!(entries[1].path, new);
    }
}
