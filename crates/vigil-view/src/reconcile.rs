//! The I/O reconciliation engine: one worker per root driving full crawls,
//! incremental updates, recrawl recovery, settle detection, and the cookie
//! fence protocol.
//!
//! # Lock order
//!
//! Composite operations touching both the root's recrawl info and the crawl
//! state acquire them as a pair, recrawl info first. The view `RwLock` is
//! taken write-side only by the worker (single-writer / multiple-reader);
//! all locks are released before cookie aborts, promise fulfillment, or
//! logging that could run client code.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};
use vigil_core::{
    ContentCache, DirEntryInfo, FileSystem, NoopContentCache, PendingChange, PendingFlags,
    WatchError, WatchResult, Watcher, WatcherCaps,
};

use crate::pending::{PendingChanges, PendingCollection};
use crate::root::Root;
use crate::signal::{self, SyncPromise, SyncWaiter};
use crate::view::ViewDatabase;

/// Whether the worker loop should keep iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Outcome of draining a working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Every observation in the drain is trustworthy.
    Clean,
    /// The watcher may have dropped events; cookies observed during the
    /// drain were ignored and the outstanding ones must be aborted.
    Desynced,
}

/// Per-worker state for the I/O loop.
#[derive(Debug)]
pub struct IoWorkerState {
    biggest_timeout: Duration,
    current_timeout: Duration,
    local_pending: PendingChanges,
}

impl IoWorkerState {
    #[must_use]
    pub fn new(root: &Root) -> Self {
        let biggest_timeout = biggest_timeout_for(root);
        Self {
            biggest_timeout,
            current_timeout: root.config.trigger_settle(),
            local_pending: PendingChanges::new(),
        }
    }

    /// The current wait timeout (doubles on quiet ticks up to the cap).
    #[must_use]
    pub const fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    #[must_use]
    pub const fn biggest_timeout(&self) -> Duration {
        self.biggest_timeout
    }
}

/// Upper bound for the quiet-period backoff: the largest interval at which
/// the worker still has periodic work (gc or reap). A configured idle reap
/// age below the gc interval takes precedence; 24 hours when neither is
/// set.
fn biggest_timeout_for(root: &Root) -> Duration {
    let mut biggest = root.config.gc_interval();
    let idle_reap_age = root.config.idle_reap_age();
    if biggest.is_zero() || (!idle_reap_age.is_zero() && idle_reap_age < biggest) {
        biggest = idle_reap_age;
    }
    if biggest.is_zero() {
        biggest = Duration::from_secs(24 * 60 * 60);
    }
    biggest
}

#[derive(Debug, Default)]
pub(crate) struct CrawlState {
    promise: Option<SyncPromise>,
    waiter: Option<SyncWaiter>,
}

#[derive(Debug, Default)]
struct SettleState {
    waiters: Vec<(Duration, SyncPromise)>,
    quiet_since: Option<Instant>,
}

/// Lock-free reconciliation counters.
#[derive(Debug, Default)]
struct ViewStatsInner {
    crawls_completed: AtomicU64,
    items_processed: AtomicU64,
    syncs_fulfilled: AtomicU64,
    cookies_intercepted: AtomicU64,
    settles_published: AtomicU64,
}

/// Snapshot of the reconciliation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStats {
    pub crawls_completed: u64,
    pub items_processed: u64,
    pub syncs_fulfilled: u64,
    pub cookies_intercepted: u64,
    pub settles_published: u64,
}

impl ViewStatsInner {
    fn snapshot(&self) -> ViewStats {
        ViewStats {
            crawls_completed: self.crawls_completed.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            syncs_fulfilled: self.syncs_fulfilled.load(Ordering::Relaxed),
            cookies_intercepted: self.cookies_intercepted.load(Ordering::Relaxed),
            settles_published: self.settles_published.load(Ordering::Relaxed),
        }
    }
}

/// The continuously updated, queryable in-memory view of one watched root.
///
/// All tree mutation happens on the root's single reconciliation worker
/// ([`LiveView::run`] / [`LiveView::step`]); query threads read the tree
/// under [`LiveView::view`]. The root context is passed into each call
/// rather than stored, keeping ownership acyclic.
pub struct LiveView {
    pub(crate) root_path: PathBuf,
    pub(crate) case_sensitive: bool,
    view: RwLock<ViewDatabase>,
    pending_from_watcher: Arc<PendingCollection>,
    crawl_state: Mutex<CrawlState>,
    pub(crate) most_recent_tick: AtomicU64,
    pub(crate) stop_threads: AtomicBool,
    pub(crate) watcher: Arc<dyn Watcher>,
    pub(crate) fs: Arc<dyn FileSystem>,
    cache: Arc<dyn ContentCache>,
    settle: Mutex<SettleState>,
    stats: ViewStatsInner,
}

impl std::fmt::Debug for LiveView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveView")
            .field("root_path", &self.root_path)
            .field("tick", &self.most_recent_tick)
            .field("stopped", &self.stop_threads)
            .finish_non_exhaustive()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LiveView {
    #[must_use]
    pub fn new(root: &Root, watcher: Arc<dyn Watcher>, fs: Arc<dyn FileSystem>) -> Self {
        Self::with_queue(root, watcher, fs, Arc::new(PendingCollection::new()))
    }

    /// Construct around an existing pending queue, for backends that were
    /// wired to it before the view existed.
    #[must_use]
    pub fn with_queue(
        root: &Root,
        watcher: Arc<dyn Watcher>,
        fs: Arc<dyn FileSystem>,
        pending_from_watcher: Arc<PendingCollection>,
    ) -> Self {
        Self {
            root_path: root.root_path().to_owned(),
            case_sensitive: root.case_sensitive(),
            view: RwLock::new(ViewDatabase::new(root.root_path(), root.case_sensitive())),
            pending_from_watcher,
            crawl_state: Mutex::new(CrawlState::default()),
            most_recent_tick: AtomicU64::new(0),
            stop_threads: AtomicBool::new(false),
            watcher,
            fs,
            cache: Arc::new(NoopContentCache),
            settle: Mutex::new(SettleState::default()),
            stats: ViewStatsInner::default(),
        }
    }

    /// Install a content cache warmed on settle.
    #[must_use]
    pub fn with_content_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = cache;
        self
    }

    /// The shared queue the watcher backend feeds.
    #[must_use]
    pub fn pending_collection(&self) -> Arc<PendingCollection> {
        Arc::clone(&self.pending_from_watcher)
    }

    /// Current value of the observation clock.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.most_recent_tick.load(Ordering::Acquire)
    }

    /// Read access to the tree for query threads.
    ///
    /// # Panics
    ///
    /// Panics if the view lock is poisoned; the worker never panics while
    /// holding it.
    #[must_use]
    pub fn view(&self) -> RwLockReadGuard<'_, ViewDatabase> {
        self.view.read().expect("view lock poisoned")
    }

    fn view_mut(&self) -> RwLockWriteGuard<'_, ViewDatabase> {
        self.view.write().expect("view lock poisoned")
    }

    #[must_use]
    pub fn stats(&self) -> ViewStats {
        self.stats.snapshot()
    }

    /// Request cooperative stop and interrupt the worker's wait.
    pub fn stop(&self) {
        self.stop_threads.store(true, Ordering::Release);
        self.pending_from_watcher.ping();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop_threads.load(Ordering::Acquire)
    }

    // ── Worker loop ──────────────────────────────────────────────────

    /// Drive the worker until stop or reap. Runs on the root's dedicated
    /// thread.
    pub fn run(&self, root: &Root) {
        let mut state = IoWorkerState::new(root);
        while self.step(root, &mut state) == Flow::Continue {}
        debug!(root = %self.root_path.display(), "reconciliation worker exited");
    }

    /// One iteration of the worker state machine.
    pub fn step(&self, root: &Root, state: &mut IoWorkerState) -> Flow {
        if self.stop_threads.load(Ordering::Acquire) || root.is_cancelled() {
            return Flow::Stop;
        }

        if !root.done_initial() {
            // First order of business: find all the files under the root.
            self.full_crawl(root, &mut state.local_pending);
            state.current_timeout = root.config.trigger_settle();
        }

        // Wait for the watcher to hand us pending items, or for the settle
        // period to expire.
        let pinged;
        {
            debug!(
                timeout_ms =
                    u64::try_from(state.current_timeout.as_millis()).unwrap_or(u64::MAX),
                "waiting for events"
            );
            let (mut lock, was_pinged) = self
                .pending_from_watcher
                .lock_and_wait(state.current_timeout);
            pinged = was_pinged;
            let items = lock.steal_items();
            let syncs = lock.steal_syncs();
            drop(lock);
            state.local_pending.append(items, syncs);
        }

        if self.handle_should_recrawl(root) {
            self.full_crawl(root, &mut state.local_pending);
            state.current_timeout = root.config.trigger_settle();
            return Flow::Continue;
        }

        // The wait timed out with nothing new, so consider the root
        // settled.
        if !pinged && state.local_pending.is_empty() {
            if self.do_settle_things(root) == Flow::Stop {
                return Flow::Stop;
            }
            state.current_timeout = (state.current_timeout * 2).min(state.biggest_timeout);
            return Flow::Continue;
        }

        // We have items to reconcile and are by definition unsettled.
        state.current_timeout = root.config.trigger_settle();
        self.restart_quiet_clock();

        // Some kernels report a notification before the file has left the
        // cache; the configured delay keeps a just-unlinked file from being
        // observed as still present. It adds latency to every sync.
        if let Some(delay) = root.config.notify_sleep() {
            std::thread::sleep(delay);
        }

        self.most_recent_tick.fetch_add(1, Ordering::AcqRel);

        debug_assert!(
            root.done_initial(),
            "a full crawl must not be pending at this point in the loop"
        );

        let drained = {
            let mut view = self.view_mut();
            self.process_all_pending(root, &mut view, &mut state.local_pending)
        };
        if drained == DrainStatus::Desynced {
            warn!("watcher desynchronized; aborting all pending cookies");
            root.cookies.abort_all_cookies();
        }
        Flow::Continue
    }

    /// Populate or refresh the entire tree with a fresh, distinct clock.
    pub(crate) fn full_crawl(&self, root: &Root, local_pending: &mut PendingChanges) {
        root.recrawl_info_mut().crawl_start = Some(Instant::now());
        let crawl_timer = Instant::now();

        let mut view = self.view_mut();
        // A fresh subscription established right after the watch must not
        // get stuck on an empty view until the next change, so these
        // observations get their own tick.
        self.most_recent_tick.fetch_add(1, Ordering::AcqRel);

        // A full crawl re-establishes the root's identity; the previous
        // inode must not veto the rediscovery.
        view.set_root_inode(0);

        let start = SystemTime::now();
        self.pending_from_watcher
            .add(self.root_path.clone(), start, PendingFlags::RECURSIVE);

        // Coalescing means the outstanding set must be consumed before any
        // new kernel notifications are merged in, or changes landing during
        // the crawl could be missed: the outer loop sweeps in watcher data,
        // the inner drain processes it plus everything recursive processing
        // picks up.
        loop {
            {
                let mut shared = self.pending_from_watcher.lock();
                let items = shared.steal_items();
                let syncs = shared.steal_syncs();
                local_pending.append(items, syncs);
                if local_pending.is_empty() {
                    let _ = shared.take_pinged();
                    break;
                }
            }
            let _ = self.process_all_pending(root, &mut view, local_pending);
        }

        let recrawl_count;
        {
            let mut info = root.recrawl_info_mut();
            let mut crawl = lock_or_recover(&self.crawl_state);
            info.should_recrawl = false;
            info.reason = None;
            info.crawl_finish = Some(Instant::now());
            recrawl_count = info.recrawl_count;
            if let Some(promise) = crawl.promise.take() {
                promise.fulfill();
            }
            crawl.waiter = None;
        }
        root.set_done_initial(true);
        drop(view);

        // Cookies written while the crawl ran cannot be trusted as fences;
        // abort them so callers recreate and re-observe. Locks are released
        // above because the abort wakes arbitrary client code.
        root.cookies.abort_all_cookies();

        self.stats.crawls_completed.fetch_add(1, Ordering::Relaxed);
        self.restart_quiet_clock();

        let duration_us = u64::try_from(crawl_timer.elapsed().as_micros()).unwrap_or(u64::MAX);
        if recrawl_count > 0 {
            info!(root = %self.root_path.display(), duration_us, recrawl_count, "recrawl complete");
        } else {
            info!(root = %self.root_path.display(), duration_us, "crawl complete");
        }
    }

    /// One-shot crawl without the worker loop (client-mode discovery).
    pub fn crawl_once(&self, root: &Root) {
        let mut local_pending = PendingChanges::new();
        self.full_crawl(root, &mut local_pending);
    }

    /// Observe a pending recrawl request. Returns whether one was pending;
    /// the flag itself is cleared only by the full crawl that answers it.
    pub(crate) fn handle_should_recrawl(&self, root: &Root) -> bool {
        {
            let info = root.recrawl_info();
            if !info.should_recrawl {
                return false;
            }
        }

        if !root.is_cancelled() {
            let mut info = root.recrawl_info_mut();
            info.recrawl_count += 1;
            root.set_done_initial(false);
        }

        true
    }

    /// No new pending items arrived within the timeout; the root may now be
    /// settled.
    pub(crate) fn do_settle_things(&self, root: &Root) -> Flow {
        if !root.done_initial() {
            // A recrawl is owed; the loop head handles it.
            return Flow::Continue;
        }

        self.cache.warm();

        root.unilateral()
            .enqueue(serde_json::json!({"settled": true}));
        self.stats.settles_published.fetch_add(1, Ordering::Relaxed);
        self.fulfill_settle_waiters();

        if root.consider_reap() {
            info!(root = %self.root_path.display(), "root idle past reap age; stopping watch");
            self.stop_watch(root);
            return Flow::Stop;
        }

        if root.take_age_out_due(Instant::now()) {
            let reclaimed = self
                .view_mut()
                .age_out(root.config.gc_age(), SystemTime::now());
            if reclaimed > 0 {
                debug!(reclaimed, "settled age-out pass");
            }
        }
        Flow::Continue
    }

    fn stop_watch(&self, root: &Root) {
        root.cancel();
        self.watcher.stop();
        self.stop_threads.store(true, Ordering::Release);
    }

    // ── Drain ────────────────────────────────────────────────────────

    /// Drain the working set, reconciling every item and everything
    /// recursive processing enqueues behind it.
    ///
    /// Sync tokens stolen along the way are deferred until the set is fully
    /// drained: a sync observed mid-crawl is not fulfilled before the
    /// recursive work triggered by earlier items completes.
    pub(crate) fn process_all_pending(
        &self,
        root: &Root,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
    ) -> DrainStatus {
        let mut status = DrainStatus::Clean;
        let mut deferred_syncs: Vec<Vec<SyncPromise>> = Vec::new();

        while !coll.is_empty() {
            debug!(
                pending = coll.len(),
                root = %self.root_path.display(),
                "processing pending items"
            );

            let items = coll.steal_items();
            let syncs = coll.steal_syncs();
            if syncs.is_empty() {
                debug_assert!(
                    !items.is_empty(),
                    "a non-empty working set must yield items or syncs"
                );
            } else {
                deferred_syncs.push(syncs);
            }

            for item in items {
                // A stop request skips reconciliation but keeps consuming
                // the chain, so a long backlog unwinds without recursing.
                if self.stop_threads.load(Ordering::Acquire) {
                    continue;
                }

                if item.flags.contains(PendingFlags::IS_DESYNCED)
                    && item.flags.contains(PendingFlags::CRAWL_ONLY)
                {
                    // Cookies seen during this recursive walk are ignored
                    // (they may predate files not yet re-observed), so the
                    // outstanding ones must be aborted and recreated.
                    status = DrainStatus::Desynced;
                }

                // May enqueue further items onto `coll`.
                self.process_path(root, view, coll, &item, None);
                self.stats.items_processed.fetch_add(1, Ordering::Relaxed);
            }
        }

        for batch in deferred_syncs {
            for sync in batch {
                sync.fulfill();
                self.stats.syncs_fulfilled.fetch_add(1, Ordering::Relaxed);
            }
        }

        status
    }

    /// Classify one pending path as cookie / root / generic and route it.
    pub(crate) fn process_path(
        &self,
        root: &Root,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
        pre_stat: Option<&DirEntryInfo>,
    ) {
        debug_assert!(
            pending.path.starts_with(&self.root_path),
            "pending path must be a descendant of the root"
        );

        if root.cookies.is_cookie_prefix(&pending.path) {
            let consider_cookie = if self
                .watcher
                .caps()
                .contains(WatcherCaps::PER_FILE_NOTIFICATIONS)
            {
                // Per-file watchers tell us about the cookie directly; a
                // sighting from a recursive crawl proves nothing about
                // ordering, except during the initial crawl, which is
                // itself the fence.
                pending.flags.contains(PendingFlags::VIA_NOTIFY) || !root.done_initial()
            } else {
                // While desynced, the observation may predate dropped
                // events; the post-crawl abort-and-recreate cycle re-fences.
                !pending.flags.contains(PendingFlags::IS_DESYNCED)
            };

            if consider_cookie {
                self.stats.cookies_intercepted.fetch_add(1, Ordering::Relaxed);
                root.cookies.notify_cookie(&pending.path);
            }

            // Cookie files never show up in the tree.
            return;
        }

        if pending.path == self.root_path || pending.flags.contains(PendingFlags::CRAWL_ONLY) {
            self.crawler(root, view, coll, pending);
        } else {
            self.stat_path(root, view, coll, pending, pre_stat);
        }
    }

    // ── Settle bookkeeping ───────────────────────────────────────────

    pub(crate) fn restart_quiet_clock(&self) {
        lock_or_recover(&self.settle).quiet_since = Some(Instant::now());
    }

    fn fulfill_settle_waiters(&self) {
        let ready: Vec<SyncPromise> = {
            let mut settle = lock_or_recover(&self.settle);
            let quiet = settle
                .quiet_since
                .map_or(Duration::ZERO, |since| since.elapsed());
            let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut settle.waiters)
                .into_iter()
                .partition(|(period, _)| *period <= quiet);
            settle.waiters = keep;
            done.into_iter().map(|(_, promise)| promise).collect()
        };
        for promise in ready {
            promise.fulfill();
        }
    }

    // ── Query surface ────────────────────────────────────────────────

    /// A future satisfied once the first full crawl (or the recrawl
    /// currently owed) completes.
    #[must_use]
    pub fn wait_until_ready_to_query(&self, root: &Root) -> SyncWaiter {
        root.touch();
        // Lock pair order: recrawl info, then crawl state.
        let info = root.recrawl_info();
        let mut crawl = lock_or_recover(&self.crawl_state);

        if let Some(waiter) = &crawl.waiter {
            return waiter.clone();
        }

        if root.done_initial() && !info.should_recrawl {
            return SyncWaiter::ready();
        }

        let (promise, waiter) = signal::pair();
        crawl.promise = Some(promise);
        crawl.waiter = Some(waiter.clone());
        waiter
    }

    /// Fence the view against everything that happened before now.
    ///
    /// Delegates to the cookie protocol: a sentinel file is written into
    /// the root and the call returns once the worker has observed it.
    ///
    /// # Errors
    ///
    /// [`WatchError::SyncTimeout`](vigil_core::WatchError::SyncTimeout) /
    /// [`WatchError::SyncAborted`](vigil_core::WatchError::SyncAborted) per
    /// the cookie registry contract.
    pub fn sync_to_now(&self, root: &Root, timeout: Duration) -> WatchResult<()> {
        if self.is_stopped() || root.is_cancelled() {
            return Err(WatchError::Cancelled {
                phase: "sync_to_now",
            });
        }
        root.touch();
        let result = root.cookies.sync_to_now(timeout);
        if let Err(error) = &result {
            warn!(
                root = %self.root_path.display(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "sync failed"
            );
        }
        result
    }

    /// A future satisfied once the root has been quiet for `period`.
    #[must_use]
    pub fn wait_for_settle(&self, root: &Root, period: Duration) -> SyncWaiter {
        root.touch();
        let mut settle = lock_or_recover(&self.settle);
        let quiet = settle
            .quiet_since
            .map_or(Duration::ZERO, |since| since.elapsed());
        if root.done_initial() && quiet >= period {
            return SyncWaiter::ready();
        }
        let (promise, waiter) = signal::pair();
        settle.waiters.push((period, promise));
        waiter
    }

    /// Paths observed to change strictly after `tick`.
    #[must_use]
    pub fn paths_changed_since(&self, tick: u64) -> Vec<PathBuf> {
        self.view().paths_changed_since(tick)
    }

    /// Read-side snapshot of one node.
    ///
    /// # Errors
    ///
    /// [`WatchError::OutsideRoot`] when `path` does not live under the
    /// watched root.
    pub fn query_path(&self, path: &Path) -> WatchResult<Option<crate::view::NodeView>> {
        if !path.starts_with(&self.root_path) {
            return Err(WatchError::OutsideRoot {
                path: path.to_owned(),
                root: self.root_path.clone(),
            });
        }
        Ok(self.view().lookup(path))
    }

    /// Read-side existence check for one path.
    #[must_use]
    pub fn path_exists(&self, path: &Path) -> bool {
        self.view().lookup(path).is_some_and(|node| node.exists)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use tempfile::TempDir;
    use vigil_core::{CollectingEventSink, EventSink, RootConfig, WatchError};

    use super::*;
    use crate::backend::{OsFileSystem, PassiveWatcher};

    struct Fixture {
        root: Arc<Root>,
        view: LiveView,
        sink: Arc<CollectingEventSink>,
    }

    fn fixture(dir: &Path, caps: WatcherCaps, config: RootConfig) -> Fixture {
        let sink = Arc::new(CollectingEventSink::new());
        let dyn_sink: Arc<dyn EventSink> = Arc::clone(&sink) as Arc<dyn EventSink>;
        let root = Arc::new(Root::new(dir, config, dyn_sink));
        let view = LiveView::new(
            &root,
            Arc::new(PassiveWatcher::with_caps(caps)),
            Arc::new(OsFileSystem),
        );
        Fixture { root, view, sink }
    }

    fn quiet_config() -> RootConfig {
        RootConfig {
            trigger_settle_ms: 10,
            gc_interval_ms: 80,
            idle_reap_age_ms: 0,
            ..Default::default()
        }
    }

    fn build_sample_tree(dir: &Path) {
        fs::write(dir.join("a"), b"alpha").expect("write a");
        fs::create_dir(dir.join("b")).expect("mkdir b");
        fs::write(dir.join("b").join("c"), b"gamma").expect("write b/c");
    }

    #[test]
    fn full_crawl_populates_static_tree() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());

        f.view.crawl_once(&f.root);

        assert!(f.root.done_initial());
        assert!(f.view.path_exists(&dir.path().join("a")));
        assert!(f.view.path_exists(&dir.path().join("b")));
        assert!(f.view.path_exists(&dir.path().join("b").join("c")));
        assert_eq!(f.view.view().file_count(), 3);
        assert_eq!(f.view.stats().crawls_completed, 1);
        assert!(f.view.current_tick() >= 1);
    }

    #[test]
    fn reconcile_pass_increments_tick() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);
        let tick_after_crawl = f.view.current_tick();

        let mut state = IoWorkerState::new(&f.root);
        f.view.pending_collection().add(
            dir.path().join("a"),
            SystemTime::now(),
            PendingFlags::empty(),
        );
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);

        assert_eq!(f.view.current_tick(), tick_after_crawl + 1);
    }

    #[test]
    fn delete_is_observed_through_sweep() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);

        fs::remove_file(dir.path().join("a")).expect("remove a");
        f.view.pending_collection().add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::RECURSIVE,
        );

        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);

        let node = f.view.view().lookup(&dir.path().join("a")).expect("node kept");
        assert!(!node.exists);
        // Untouched siblings stay visible.
        assert!(f.view.path_exists(&dir.path().join("b").join("c")));
    }

    #[test]
    fn root_replacement_schedules_exactly_one_recrawl() {
        let dir = TempDir::new().expect("temp parent");
        let root_path = dir.path().join("w");
        fs::create_dir(&root_path).expect("mkdir w");
        fs::write(root_path.join("a"), b"x").expect("write a");

        let f = fixture(&root_path, WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);
        assert_eq!(f.root.recrawl_info().recrawl_count, 0);

        // Replace the root with a fresh directory (fresh inode).
        fs::remove_dir_all(&root_path).expect("remove w");
        fs::create_dir(&root_path).expect("recreate w");
        fs::write(root_path.join("newfile"), b"y").expect("write newfile");

        f.view
            .pending_collection()
            .add(root_path.clone(), SystemTime::now(), PendingFlags::empty());
        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert!(f.root.recrawl_info().should_recrawl);

        // The next iteration answers the recrawl with a full crawl.
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert!(!f.root.recrawl_info().should_recrawl);
        assert_eq!(f.root.recrawl_info().recrawl_count, 1);
        assert!(f.root.done_initial());
        assert!(f.view.path_exists(&root_path.join("newfile")));
    }

    #[test]
    fn quiet_steps_publish_settled_and_back_off() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        let mut state = IoWorkerState::new(&f.root);

        // First step performs the initial crawl, then settles.
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert_eq!(f.sink.len(), 1, "one settled event after the quiet period");
        let settled = f.sink.drain();
        assert_eq!(settled[0], serde_json::json!({"settled": true}));

        // Timeout doubles per quiet tick up to the cap.
        assert_eq!(state.current_timeout(), Duration::from_millis(20));
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert_eq!(state.current_timeout(), Duration::from_millis(40));
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert_eq!(state.current_timeout(), Duration::from_millis(80));
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert_eq!(state.current_timeout(), Duration::from_millis(80));
    }

    #[test]
    fn no_settle_before_initial_crawl() {
        let dir = TempDir::new().expect("temp root");
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());

        assert_eq!(f.view.do_settle_things(&f.root), Flow::Continue);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn sync_tokens_fulfill_only_after_drain() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);

        let (promise, waiter) = signal::pair();
        let pending = f.view.pending_collection();
        pending.add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::RECURSIVE,
        );
        pending.add_sync(promise);
        assert!(!waiter.is_ready());

        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert!(waiter.is_ready());
        assert_eq!(f.view.stats().syncs_fulfilled, 1);
    }

    #[test]
    fn nonrecursive_scan_restats_known_children() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);
        let after_crawl = f.view.current_tick();

        fs::write(dir.path().join("a"), b"alpha grew larger").expect("rewrite a");
        let mut state = IoWorkerState::new(&f.root);

        // A plain, non-recursive notification skips known existing
        // children entirely for a non-per-file watcher.
        f.view.pending_collection().add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::empty(),
        );
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert!(f.view.paths_changed_since(after_crawl).is_empty());

        // NONRECURSIVE_SCAN forces a stat of every child without
        // descending.
        let before_scan = f.view.current_tick();
        f.view.pending_collection().add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::NONRECURSIVE_SCAN,
        );
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        let changed = f.view.paths_changed_since(before_scan);
        assert!(
            changed.contains(&dir.path().join("a")),
            "rewritten file missing from {changed:?}"
        );
    }

    #[test]
    fn ready_future_resolves_with_first_crawl() {
        let dir = TempDir::new().expect("temp root");
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());

        let waiter = f.view.wait_until_ready_to_query(&f.root);
        assert!(!waiter.is_ready());
        // A second caller shares the same future.
        let sibling = f.view.wait_until_ready_to_query(&f.root);

        f.view.crawl_once(&f.root);
        assert!(waiter.is_ready());
        assert!(sibling.is_ready());

        // Once ready, callers get an already-satisfied future.
        assert!(f.view.wait_until_ready_to_query(&f.root).is_ready());
    }

    #[test]
    fn cookie_observation_fulfills_sync_and_stays_out_of_tree() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(
            dir.path(),
            WatcherCaps::PER_FILE_NOTIFICATIONS,
            quiet_config(),
        );
        f.view.crawl_once(&f.root);

        let syncer = Arc::clone(&f.root);
        let sync_thread =
            thread::spawn(move || syncer.cookies.sync_to_now(Duration::from_secs(10)));
        while f.root.cookies.outstanding_count() == 0 {
            thread::sleep(Duration::from_millis(2));
        }

        let cookie = dir
            .path()
            .join(format!("{}1", f.root.cookies.cookie_prefix()));
        f.view.pending_collection().add(
            cookie.clone(),
            SystemTime::now(),
            PendingFlags::VIA_NOTIFY,
        );

        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);

        sync_thread
            .join()
            .expect("sync thread join")
            .expect("sync completes");
        assert!(f.view.view().lookup(&cookie).is_none(), "cookie in tree");
        assert_eq!(f.root.cookies.observed_count(), 1);
        assert_eq!(f.view.stats().cookies_intercepted, 1);
    }

    #[test]
    fn desynced_crawl_suppresses_cookies_and_aborts() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        // Non-per-file watcher: the desync branch decides consideration.
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);

        let syncer = Arc::clone(&f.root);
        let sync_thread =
            thread::spawn(move || syncer.cookies.sync_to_now(Duration::from_secs(10)));
        while f.root.cookies.outstanding_count() == 0 {
            thread::sleep(Duration::from_millis(2));
        }

        f.view.pending_collection().add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::RECURSIVE | PendingFlags::IS_DESYNCED | PendingFlags::CRAWL_ONLY,
        );
        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);

        // The cookie sighting during the desynced walk was ignored; the
        // drain reported desync and the worker aborted the fence instead.
        assert_eq!(f.root.cookies.observed_count(), 0);
        let err = sync_thread
            .join()
            .expect("sync thread join")
            .expect_err("sync must abort");
        assert!(matches!(err, WatchError::SyncAborted { .. }));
        assert_eq!(f.root.cookies.outstanding_count(), 0);
    }

    #[test]
    fn settle_waiters_fire_once_quiet_long_enough() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);

        let waiter = f.view.wait_for_settle(&f.root, Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        // Already quiet long enough: the next settle pass fulfills it.
        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Continue);
        assert!(waiter.is_ready());

        // And with the quiet span already elapsed, new waiters short-circuit.
        thread::sleep(Duration::from_millis(5));
        assert!(
            f.view
                .wait_for_settle(&f.root, Duration::from_millis(1))
                .is_ready()
        );
    }

    #[test]
    fn stop_consumes_chain_but_still_fulfills_syncs() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);
        let tick_before = f.view.current_tick();

        f.view.stop();
        let (promise, waiter) = signal::pair();
        let mut coll = PendingChanges::new();
        coll.add(
            dir.path().to_owned(),
            SystemTime::now(),
            PendingFlags::RECURSIVE,
        );
        coll.add_sync(promise);

        let status = {
            let mut view = f.view.view_mut();
            f.view.process_all_pending(&f.root, &mut view, &mut coll)
        };
        assert_eq!(status, DrainStatus::Clean);
        assert!(coll.is_empty(), "the chain is consumed even while stopping");
        assert!(waiter.is_ready());
        // No reconciliation happened.
        assert_eq!(f.view.current_tick(), tick_before);
    }

    #[test]
    fn query_path_rejects_paths_outside_root() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.crawl_once(&f.root);

        let node = f
            .view
            .query_path(&dir.path().join("a"))
            .expect("inside root")
            .expect("node present");
        assert!(node.exists);

        let err = f.view.query_path(Path::new("/definitely/elsewhere")).unwrap_err();
        assert!(matches!(err, WatchError::OutsideRoot { .. }));
    }

    #[test]
    fn sync_on_stopped_view_is_cancelled() {
        let dir = TempDir::new().expect("temp root");
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.stop();
        let err = f
            .view
            .sync_to_now(&f.root, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, WatchError::Cancelled { .. }));
    }

    #[test]
    fn stopped_worker_exits_immediately() {
        let dir = TempDir::new().expect("temp root");
        let f = fixture(dir.path(), WatcherCaps::empty(), quiet_config());
        f.view.stop();
        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Stop);
    }

    #[test]
    fn biggest_timeout_prefers_smaller_reap_age() {
        let dir = TempDir::new().expect("temp root");
        let sink: Arc<dyn EventSink> = Arc::new(CollectingEventSink::new());

        let root = Root::new(
            dir.path(),
            RootConfig {
                gc_interval_ms: 50,
                idle_reap_age_ms: 10,
                ..Default::default()
            },
            Arc::clone(&sink),
        );
        assert_eq!(
            IoWorkerState::new(&root).biggest_timeout(),
            Duration::from_millis(10)
        );

        let root = Root::new(
            dir.path(),
            RootConfig {
                gc_interval_ms: 50,
                idle_reap_age_ms: 0,
                ..Default::default()
            },
            Arc::clone(&sink),
        );
        assert_eq!(
            IoWorkerState::new(&root).biggest_timeout(),
            Duration::from_millis(50)
        );

        let root = Root::new(
            dir.path(),
            RootConfig {
                gc_interval_ms: 0,
                idle_reap_age_ms: 0,
                ..Default::default()
            },
            Arc::clone(&sink),
        );
        assert_eq!(
            IoWorkerState::new(&root).biggest_timeout(),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn idle_root_is_reaped_on_settle() {
        let dir = TempDir::new().expect("temp root");
        build_sample_tree(dir.path());
        let f = fixture(
            dir.path(),
            WatcherCaps::empty(),
            RootConfig {
                trigger_settle_ms: 5,
                idle_reap_age_ms: 1,
                ..Default::default()
            },
        );
        f.view.crawl_once(&f.root);

        thread::sleep(Duration::from_millis(10));
        let mut state = IoWorkerState::new(&f.root);
        assert_eq!(f.view.step(&f.root, &mut state), Flow::Stop);
        assert!(f.root.is_cancelled());
        assert!(f.view.is_stopped());
    }
}
