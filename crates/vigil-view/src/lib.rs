//! In-memory filesystem view and I/O reconciliation engine.
//!
//! One reconciliation worker per watched root keeps a queryable snapshot
//! ([`ViewDatabase`]) of the directory tree current by draining a coalescing
//! [`PendingCollection`] fed by a kernel [`Watcher`](vigil_core::Watcher):
//! full crawl on watch start, incremental single-path reconciliation on
//! notifications, forced recrawl on desync or root replacement, settle
//! detection with adaptive backoff, and cookie fences
//! ([`CookieRegistry`]) for causal sync guarantees.

#![forbid(unsafe_code)]

pub mod backend;
pub mod cookies;
mod crawl;
pub mod pending;
pub mod reconcile;
pub mod root;
pub mod signal;
pub mod view;

pub use backend::{NotifyWatcher, OsDirReader, OsFileSystem, PassiveWatcher};
pub use cookies::CookieRegistry;
pub use pending::{PendingChanges, PendingCollection, PendingLock};
pub use reconcile::{DrainStatus, Flow, IoWorkerState, LiveView, ViewStats};
pub use root::{RecrawlInfo, Root};
pub use signal::{SyncPromise, SyncWaiter, pair};
pub use view::{DirNode, FileNode, NodeView, ViewDatabase};
