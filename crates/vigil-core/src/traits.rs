//! Collaborator contracts consumed by the reconciliation engine.
//!
//! The engine never touches the OS directly: directory watching and stat
//! calls go through [`Watcher`] / [`FileSystem`], client-visible events go
//! through [`EventSink`], and content-cache warming goes through
//! [`ContentCache`]. Production implementations live in `vigil-view`; the
//! `Noop*` types here serve tests and dry-run wiring.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use crate::error::WatchResult;
use crate::types::{DirEntryInfo, FileMeta};

/// Capability flags advertised by a [`Watcher`] implementation.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherCaps(u8);

impl WatcherCaps {
    /// The watcher delivers a notification per affected file, so crawls can
    /// trust those signals instead of re-statting children.
    pub const PER_FILE_NOTIFICATIONS: Self = Self(1 << 0);
    /// The watcher may coalesce a rename into a single notification,
    /// requiring crawls to stat all children.
    pub const COALESCED_RENAME: Self = Self(1 << 1);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WatcherCaps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for WatcherCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::PER_FILE_NOTIFICATIONS) {
            set.entry(&"PER_FILE_NOTIFICATIONS");
        }
        if self.contains(Self::COALESCED_RENAME) {
            set.entry(&"COALESCED_RENAME");
        }
        set.finish()
    }
}

/// A readable handle over one directory, yielded by
/// [`Watcher::start_watch_dir`].
///
/// Implementations never yield `.` or `..`.
pub trait DirReader: Send + std::fmt::Debug {
    /// Next entry, or `None` at end of directory.
    ///
    /// # Errors
    ///
    /// Returns an error when enumeration fails partway; the caller re-queues
    /// the directory for later re-assessment.
    fn read_next(&mut self) -> io::Result<Option<DirEntryInfo>>;

    /// Hard-link count of the directory itself, used as a subdirectory-count
    /// size hint. `None` when the platform cannot supply it cheaply.
    fn link_count(&self) -> Option<u64>;
}

/// Kernel-level directory watcher.
///
/// `start_watch_dir` atomically begins watching a directory and yields a
/// readable handle over it; whether the open happens before or after the
/// watch registration is implementation-specific, so the two are rolled into
/// one operation.
pub trait Watcher: Send + Sync {
    /// Capability flags for this backend.
    fn caps(&self) -> WatcherCaps;

    /// Begin watching `path` and open it for enumeration.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Open`](crate::WatchError::Open) when the
    /// directory cannot be opened or watched; the `io::ErrorKind` of the
    /// source decides whether the directory is recorded as deleted or a
    /// recrawl is scheduled.
    fn start_watch_dir(&self, path: &Path) -> WatchResult<Box<dyn DirReader>>;

    /// Tear down all watches. Called when the root is stopped or reaped.
    fn stop(&self) {}
}

/// Stat access for single paths.
pub trait FileSystem: Send + Sync {
    /// Stat `path` without following symlinks.
    ///
    /// # Errors
    ///
    /// Propagates the raw `io::Error`; callers dispatch on its kind
    /// (`NotFound`/`NotADirectory` mean the node is gone).
    fn file_information(&self, path: &Path, case_sensitive: bool) -> io::Result<FileMeta>;
}

/// Sink for unilateral (server-initiated) client events such as
/// `{"settled": true}`.
pub trait EventSink: Send + Sync {
    fn enqueue(&self, event: serde_json::Value);
}

/// Discards all events. Default sink when no subscriber transport is wired.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn enqueue(&self, _event: serde_json::Value) {}
}

/// Buffers events in memory. Used by tests and by callers that poll rather
/// than subscribe.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<serde_json::Value>>,
}

impl CollectingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return all buffered events.
    #[must_use]
    pub fn drain(&self) -> Vec<serde_json::Value> {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *events)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingEventSink {
    fn enqueue(&self, event: serde_json::Value) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }
}

/// Content-identity cache warmed when the root settles.
pub trait ContentCache: Send + Sync {
    fn warm(&self);
}

/// No-op cache warmer for deployments without a content cache.
#[derive(Debug, Default)]
pub struct NoopContentCache;

impl ContentCache for NoopContentCache {
    fn warm(&self) {}
}
