//! Recursive inotify watcher over the listen tree.
//!
//! At construction the watcher walks the listen directory and subscribes
//! every directory for `OPEN | CREATE`. A reader task then translates raw
//! kernel events into [`WatchEvent`]s on an mpsc channel, subscribing newly
//! created directories on the fly so the producer can grow the tree freely.
//!
//! # Contract
//!
//! - Events for one directory arrive in kernel order; there is no ordering
//!   guarantee across directories.
//! - A kernel queue overflow is surfaced as [`WatchEvent::Overflow`] and the
//!   stream keeps running.
//! - Subscription failures (including hitting the inotify watch limit) are
//!   logged and leave coverage degraded, never fatal after startup.
//! - The channel ends when the watcher is shut down.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use inotify::{EventMask, EventOwned, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the buffer handed to the inotify event stream.
const EVENT_BUFFER_SIZE: usize = 4096;

/// Capacity of the channel between the reader task and the ingest loop.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A filesystem observation forwarded to the ingest loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file was created or opened under the listen tree.
    File {
        /// Absolute path of the file.
        path: PathBuf,
        /// True for creation, false for an open.
        created: bool,
    },
    /// The kernel event queue overflowed; events were lost and the sketch
    /// runs with reduced fidelity until traffic re-establishes it.
    Overflow,
}

/// Watcher construction errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Could not create the inotify instance or its event stream.
    #[error("failed to initialize inotify: {0}")]
    Init(#[source] io::Error),

    /// Not even the listen root could be subscribed.
    #[error("listen directory {0} could not be watched")]
    RootUnwatchable(PathBuf),
}

/// Recursive watcher over the listen directory.
pub struct TreeWatcher {
    stream: EventStream<Vec<u8>>,
    watches: Watches,
    dirs: HashMap<WatchDescriptor, PathBuf>,
}

impl TreeWatcher {
    /// Initializes inotify and subscribes every directory under
    /// `listen_dir`.
    ///
    /// Individual subscription failures are logged and skipped; only a
    /// completely unwatchable root is an error.
    pub fn new(listen_dir: &Path) -> Result<Self, WatchError> {
        let mut inotify = Inotify::init().map_err(WatchError::Init)?;
        let watches = inotify.watches();
        let stream = inotify
            .into_event_stream(vec![0u8; EVENT_BUFFER_SIZE])
            .map_err(WatchError::Init)?;

        let mut watcher = Self {
            stream,
            watches,
            dirs: HashMap::new(),
        };
        watcher.subscribe_tree(listen_dir);

        if watcher.dirs.is_empty() {
            return Err(WatchError::RootUnwatchable(listen_dir.to_path_buf()));
        }

        info!(
            listen_dir = %listen_dir.display(),
            directories = watcher.dirs.len(),
            "Watching listen tree"
        );
        Ok(watcher)
    }

    /// Spawns the reader task and returns the event channel.
    ///
    /// The channel yields events until `shutdown` is cancelled or the
    /// inotify stream ends, then closes.
    pub fn spawn(self, shutdown: CancellationToken) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx, shutdown));
        rx
    }

    async fn run(mut self, tx: mpsc::Sender<WatchEvent>, shutdown: CancellationToken) {
        debug!("Watch event reader started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Watcher shutting down");
                    break;
                }

                maybe_event = self.stream.next() => match maybe_event {
                    None => {
                        info!("inotify event stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to read inotify events");
                    }
                    Some(Ok(event)) => {
                        if !self.dispatch(event, &tx).await {
                            // Receiver dropped; nothing left to feed.
                            break;
                        }
                    }
                },
            }
        }
    }

    /// Translates one raw event. Returns false once the receiver is gone.
    async fn dispatch(&mut self, event: EventOwned, tx: &mpsc::Sender<WatchEvent>) -> bool {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            warn!("inotify queue overflowed, some events were lost");
            return tx.send(WatchEvent::Overflow).await.is_ok();
        }
        if event.mask.contains(EventMask::IGNORED) {
            self.dirs.remove(&event.wd);
            return true;
        }

        let Some(dir) = self.dirs.get(&event.wd) else {
            return true;
        };
        let Some(name) = event.name.as_ref() else {
            // Events on the watched directory itself carry no name.
            return true;
        };
        // Names with a trailing separator are spurious directory echoes.
        if name.to_string_lossy().ends_with('/') {
            return true;
        }

        let path = dir.join(name);
        if event.mask.contains(EventMask::ISDIR) {
            if event.mask.contains(EventMask::CREATE) {
                self.subscribe(&path);
            }
            return true;
        }

        let created = event.mask.contains(EventMask::CREATE);
        tx.send(WatchEvent::File { path, created }).await.is_ok()
    }

    /// Adds a watch on a single directory, logging failures.
    fn subscribe(&mut self, dir: &Path) {
        match self.watches.add(dir, WatchMask::OPEN | WatchMask::CREATE) {
            Ok(wd) => {
                debug!(dir = %dir.display(), "Watching directory");
                self.dirs.insert(wd, dir.to_path_buf());
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                warn!(
                    dir = %dir.display(),
                    "inotify watch limit reached, coverage degraded"
                );
            }
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to add watch, coverage degraded"
                );
            }
        }
    }

    /// Subscribes `dir` and every directory below it.
    fn subscribe_tree(&mut self, dir: &Path) {
        self.subscribe(dir);

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to enumerate directory while building watch set"
                );
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.subscribe_tree(&path);
            }
        }
    }
}
