//! vigil: a directory-watching service core.
//!
//! vigil maintains a continuously updated, queryable in-memory snapshot of a
//! watched directory tree. A kernel watcher pushes raw change notifications
//! into a coalescing pending queue; one reconciliation worker per root
//! drains it into the view database, handling initial discovery, recrawl
//! recovery, settle detection, and cookie fences for causal sync
//! guarantees.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use vigil::WatchSession;
//!
//! # fn main() -> vigil::WatchResult<()> {
//! let session = WatchSession::builder("/path/to/tree").start()?;
//! session.wait_until_ready(Duration::from_secs(30))?;
//!
//! // ... files change on disk ...
//!
//! // Fence: everything created before this call is now observed.
//! session.sync_to_now(Duration::from_secs(5))?;
//! let changed = session.view().paths_changed_since(0);
//! println!("{} paths observed", changed.len());
//! session.shutdown();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod session;

pub use session::{WatchSession, WatchSessionBuilder};
pub use vigil_core::{
    ClockStamp, CollectingEventSink, ContentCache, DirEntryInfo, DirReader, EventSink, FileMeta,
    FileSystem, NoopContentCache, NoopEventSink, PendingChange, PendingFlags, RootConfig,
    WatchError, WatchResult, Watcher, WatcherCaps, tracing_config,
};
pub use vigil_view::{
    CookieRegistry, DirNode, DrainStatus, FileNode, Flow, IoWorkerState, LiveView, NodeView,
    NotifyWatcher, OsDirReader, OsFileSystem, PassiveWatcher, PendingChanges, PendingCollection,
    RecrawlInfo, Root, SyncPromise, SyncWaiter, ViewDatabase, ViewStats,
};

/// Re-export of the most commonly used types.
pub mod prelude {
    pub use crate::{
        LiveView, PassiveWatcher, PendingFlags, Root, RootConfig, WatchError, WatchResult,
        WatchSession, WatchSessionBuilder, WatcherCaps,
    };
}
