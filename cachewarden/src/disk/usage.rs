//! Free-space queries for the cache disk.
//!
//! The eviction controller only ever consumes the [`UsageProbe`] trait, so
//! tests can script arbitrary pressure levels without touching a real
//! filesystem. Production uses [`StatvfsProbe`], a thin wrapper over the
//! `statvfs` syscall.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A point-in-time view of the cache disk's occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    /// `100 * f_bavail / f_blocks` - the fraction of blocks available to
    /// unprivileged writers.
    pub percent_blocks_free: f64,
    /// Bytes available to unprivileged writers.
    pub bytes_free: u64,
    /// Bytes currently occupied.
    pub bytes_used: u64,
}

impl DiskUsage {
    /// Total usable bytes on the filesystem.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_free + self.bytes_used
    }
}

/// Source of [`DiskUsage`] readings for a path.
pub trait UsageProbe: Send + Sync {
    /// Queries the filesystem containing `path`.
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// [`UsageProbe`] backed by `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl UsageProbe for StatvfsProbe {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let fragment_size = stat.f_frsize as u64;
        let percent_blocks_free = if stat.f_blocks > 0 {
            100.0 * stat.f_bavail as f64 / stat.f_blocks as f64
        } else {
            0.0
        };

        Ok(DiskUsage {
            percent_blocks_free,
            bytes_free: stat.f_bavail as u64 * fragment_size,
            bytes_used: (stat.f_blocks as u64).saturating_sub(stat.f_bfree as u64) * fragment_size,
        })
    }
}
