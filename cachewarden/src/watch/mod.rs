//! Filesystem-event ingestion: the listen-tree watcher and the path mapper
//! that turns raw event paths into cache keys.

mod mapper;
mod watcher;

pub use mapper::{MapError, PathMapper};
pub use watcher::{TreeWatcher, WatchError, WatchEvent};
