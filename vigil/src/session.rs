//! Session assembly: wire a root, its in-memory view, and a watcher backend
//! together and own the reconciliation worker thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use vigil_core::{
    ContentCache, EventSink, FileSystem, NoopEventSink, RootConfig, WatchError, WatchResult,
    Watcher,
};
use vigil_view::{LiveView, NotifyWatcher, OsFileSystem, PendingCollection, Root, ViewStats};

/// Builder for a [`WatchSession`].
///
/// Defaults: kernel watcher via `notify`, stat through `std::fs`, events
/// discarded, no content cache.
pub struct WatchSessionBuilder {
    root_path: PathBuf,
    config: RootConfig,
    sink: Option<Arc<dyn EventSink>>,
    cache: Option<Arc<dyn ContentCache>>,
    watcher: Option<Arc<dyn Watcher>>,
    fs: Option<Arc<dyn FileSystem>>,
}

impl WatchSessionBuilder {
    #[must_use]
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            config: RootConfig::default(),
            sink: None,
            cache: None,
            watcher: None,
            fs: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: RootConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink for unilateral events such as `{"settled": true}`.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Content cache warmed whenever the root settles.
    #[must_use]
    pub fn content_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the kernel watcher backend (polling setups, tests).
    #[must_use]
    pub fn watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Replace the stat backend.
    #[must_use]
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Validate, assemble, and start the session's worker thread.
    ///
    /// # Errors
    ///
    /// Configuration errors, a root path that does not resolve to a
    /// directory, or failure to create the watcher backend or spawn the
    /// worker.
    pub fn start(self) -> WatchResult<WatchSession> {
        self.config.validate()?;

        let root_path = std::fs::canonicalize(&self.root_path).map_err(|source| {
            WatchError::Open {
                path: self.root_path.clone(),
                source,
            }
        })?;
        let meta = std::fs::symlink_metadata(&root_path).map_err(|source| WatchError::Open {
            path: root_path.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(WatchError::Open {
                path: root_path,
                source: std::io::Error::from(std::io::ErrorKind::NotADirectory),
            });
        }

        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopEventSink));
        let root = Arc::new(Root::new(&root_path, self.config, sink));

        let pending = Arc::new(PendingCollection::new());
        let watcher: Arc<dyn Watcher> = match self.watcher {
            Some(watcher) => watcher,
            None => Arc::new(NotifyWatcher::new(&root_path, Arc::clone(&pending))?),
        };
        let fs: Arc<dyn FileSystem> = self.fs.unwrap_or_else(|| Arc::new(OsFileSystem));

        let mut view = LiveView::with_queue(&root, watcher, fs, pending);
        if let Some(cache) = self.cache {
            view = view.with_content_cache(cache);
        }
        let view = Arc::new(view);

        let worker_view = Arc::clone(&view);
        let worker_root = Arc::clone(&root);
        let worker = thread::Builder::new()
            .name("vigil-io".to_owned())
            .spawn(move || worker_view.run(&worker_root))
            .map_err(WatchError::Io)?;

        debug!(root = %root_path.display(), "watch session started");
        Ok(WatchSession {
            root,
            view,
            worker: Some(worker),
        })
    }
}

/// A running watch: root context, live view, and the worker thread that
/// keeps the view current.
#[derive(Debug)]
pub struct WatchSession {
    root: Arc<Root>,
    view: Arc<LiveView>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WatchSession {
    /// Begin building a session over `root_path`.
    #[must_use]
    pub fn builder(root_path: impl Into<PathBuf>) -> WatchSessionBuilder {
        WatchSessionBuilder::new(root_path)
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Root> {
        &self.root
    }

    #[must_use]
    pub fn view(&self) -> &Arc<LiveView> {
        &self.view
    }

    /// Block until the first full crawl completes.
    ///
    /// # Errors
    ///
    /// Times out with [`WatchError::SyncTimeout`].
    pub fn wait_until_ready(&self, timeout: Duration) -> WatchResult<()> {
        self.view
            .wait_until_ready_to_query(&self.root)
            .wait_for(timeout)
    }

    /// Fence the view against everything that happened before now.
    ///
    /// # Errors
    ///
    /// Per the cookie protocol: timeout, abort, or cookie I/O failure.
    pub fn sync_to_now(&self, timeout: Duration) -> WatchResult<()> {
        self.view.sync_to_now(&self.root, timeout)
    }

    /// Block until the root has been quiet for `period`.
    ///
    /// # Errors
    ///
    /// Times out with [`WatchError::SyncTimeout`].
    pub fn wait_for_settle(&self, period: Duration, timeout: Duration) -> WatchResult<()> {
        self.view
            .wait_for_settle(&self.root, period)
            .wait_for(timeout)
    }

    #[must_use]
    pub fn stats(&self) -> ViewStats {
        self.view.stats()
    }

    /// Stop the worker and join it.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.view.stop();
        self.root.cancel();
        if let Some(worker) = self.worker.take()
            && let Err(error) = worker.join()
        {
            warn!(?error, "reconciliation worker panicked during shutdown");
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
