//! Cookie-fence registry: causal "I have observed everything up to here"
//! guarantees for clients.
//!
//! A sync writes a uniquely named sentinel file into the cookie directory
//! and parks on a [`SyncWaiter`]. When the reconciliation worker observes
//! the cookie path flow through the notification pipeline it calls
//! [`CookieRegistry::notify_cookie`], which fulfills the waiters and unlinks
//! the file. Cookie paths never enter the view tree.
//!
//! A recrawl invalidates every in-flight cookie: the watcher may have
//! dropped the corresponding notifications, so the cookies are aborted and
//! callers recreate them, guaranteeing a fresh observation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};
use vigil_core::WatchResult;

use crate::signal::{self, SyncPromise};

#[derive(Debug)]
struct CookieState {
    dir: PathBuf,
    serial: u64,
    in_flight: HashMap<PathBuf, Vec<SyncPromise>>,
}

/// Tracks in-flight sync cookies for one watched root.
#[derive(Debug)]
pub struct CookieRegistry {
    prefix: String,
    state: Mutex<CookieState>,
    observed: AtomicU64,
}

impl CookieRegistry {
    /// Create a registry whose cookie directory is the root itself.
    ///
    /// The prefix embeds the process id, so concurrent watches of the same
    /// root from different processes ignore each other's cookies.
    #[must_use]
    pub fn new(root_path: &Path) -> Self {
        Self {
            prefix: format!(".vigil-cookie-{}-", std::process::id()),
            state: Mutex::new(CookieState {
                dir: root_path.to_owned(),
                serial: 0,
                in_flight: HashMap::new(),
            }),
            observed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CookieState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Move the cookie directory (e.g. when the root itself is read-only
    /// but a writable subdirectory exists).
    pub fn set_cookie_dir(&self, dir: impl Into<PathBuf>) {
        self.lock().dir = dir.into();
    }

    /// The directory cookies are written into.
    #[must_use]
    pub fn cookie_dir(&self) -> PathBuf {
        self.lock().dir.clone()
    }

    /// The filename prefix identifying this registry's cookies.
    #[must_use]
    pub fn cookie_prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `path` names a cookie of this registry.
    #[must_use]
    pub fn is_cookie_prefix(&self, path: &Path) -> bool {
        let state = self.lock();
        path.parent() == Some(state.dir.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&self.prefix))
    }

    /// Write a fresh cookie and block until the worker observes it or the
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// [`WatchError::SyncTimeout`](vigil_core::WatchError::SyncTimeout) when
    /// the cookie is not observed in time,
    /// [`WatchError::SyncAborted`](vigil_core::WatchError::SyncAborted) when
    /// a recrawl invalidated it, or an I/O error when the cookie file cannot
    /// be created.
    pub fn sync_to_now(&self, timeout: Duration) -> WatchResult<()> {
        let (path, waiter) = {
            let mut state = self.lock();
            state.serial += 1;
            let path = state.dir.join(format!("{}{}", self.prefix, state.serial));
            let (promise, waiter) = signal::pair();
            state.in_flight.entry(path.clone()).or_default().push(promise);
            (path, waiter)
        };

        if let Err(source) = fs::File::create(&path) {
            self.lock().in_flight.remove(&path);
            return Err(source.into());
        }
        debug!(cookie = %path.display(), "cookie written, awaiting observation");

        match waiter.wait_for(timeout) {
            Ok(()) => Ok(()),
            Err(err) => {
                // On timeout the fence is dead; reclaim the entry and the
                // file so the next sync starts clean. On abort both were
                // already reclaimed.
                self.lock().in_flight.remove(&path);
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    /// Record that the worker observed `path`. Fulfills the parked syncs
    /// and unlinks the cookie file.
    pub fn notify_cookie(&self, path: &Path) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let promises = self.lock().in_flight.remove(path);
        let _ = fs::remove_file(path);
        if let Some(promises) = promises {
            debug!(cookie = %path.display(), syncs = promises.len(), "cookie observed");
            for promise in promises {
                promise.fulfill();
            }
        }
    }

    /// Abort every in-flight cookie, failing its parked syncs.
    pub fn abort_all_cookies(&self) {
        let drained: Vec<(PathBuf, Vec<SyncPromise>)> = self.lock().in_flight.drain().collect();
        if drained.is_empty() {
            return;
        }
        warn!(cookies = drained.len(), "aborting all pending cookies");
        for (path, promises) in drained {
            let _ = fs::remove_file(&path);
            for promise in promises {
                promise.abort("recrawl invalidated outstanding cookies");
            }
        }
    }

    /// Number of cookies currently awaiting observation.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total cookies observed since the registry was created.
    #[must_use]
    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }
}
