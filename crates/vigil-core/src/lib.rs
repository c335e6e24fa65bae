//! Core contracts and types for the vigil directory-watching service.
//!
//! This crate defines the shared error type ([`WatchError`]), per-root
//! configuration ([`RootConfig`]), the pending-change and stat types, the
//! collaborator traits ([`Watcher`], [`FileSystem`], [`EventSink`],
//! [`ContentCache`]), and tracing conventions used across all vigil crates.
//!
//! It has minimal external dependencies and is intended to be depended on by
//! every other crate in the workspace.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod tracing_config;
pub mod traits;
pub mod types;

pub use config::RootConfig;
pub use error::{WatchError, WatchResult};
pub use traits::{
    CollectingEventSink, ContentCache, DirReader, EventSink, FileSystem, NoopContentCache,
    NoopEventSink, Watcher, WatcherCaps,
};
pub use types::{ClockStamp, DirEntryInfo, FileMeta, PendingChange, PendingFlags};
