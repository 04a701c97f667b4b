//! On-disk cache index and free-space probing.

mod cache;
mod usage;

pub use cache::{DiskCache, DiskCacheError, FileEntry};
pub use usage::{DiskUsage, StatvfsProbe, UsageProbe};
