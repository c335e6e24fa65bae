//! Pending change queue: the coalescing multiset of path notifications plus
//! the ordered list of sync tokens.
//!
//! [`PendingChanges`] is a caller-owned working set (the worker's local
//! batch, or the payload behind the shared queue). [`PendingCollection`]
//! wraps one behind a `Mutex` + `Condvar` so the watcher thread can feed it
//! while the worker waits with a timeout.
//!
//! The item chain is backed by a growable buffer plus a path index: steal is
//! O(1) (`mem::take`), iteration consumes, and coalescing lookups walk the
//! path's ancestors against the index instead of scanning the buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tracing::trace;
use vigil_core::{PendingChange, PendingFlags};

use crate::signal::SyncPromise;

/// A caller-owned batch of pending changes and sync tokens.
#[derive(Debug, Default)]
pub struct PendingChanges {
    items: Vec<PendingChange>,
    index: HashMap<PathBuf, usize>,
    syncs: Vec<SyncPromise>,
}

impl PendingChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `path` for re-examination, coalescing against existing
    /// entries.
    ///
    /// An exact-path entry absorbs the new flags. Otherwise, if an ancestor
    /// entry already covers the path recursively (and carries the
    /// newcomer's desync bit), the newcomer is dropped, unless it is
    /// `CRAWL_ONLY`, which must reach the crawler itself.
    pub fn add(&mut self, path: impl Into<PathBuf>, now: SystemTime, flags: PendingFlags) {
        let path = path.into();
        if let Some(&i) = self.index.get(&path) {
            self.items[i].flags |= flags;
            return;
        }
        if !flags.contains(PendingFlags::CRAWL_ONLY) {
            for ancestor in path.ancestors().skip(1) {
                let Some(&i) = self.index.get(ancestor) else {
                    continue;
                };
                let covering = self.items[i].flags;
                if covering.contains(PendingFlags::RECURSIVE)
                    && covering.contains(flags.intersect(PendingFlags::IS_DESYNCED))
                {
                    trace!(path = %path.display(), ancestor = %ancestor.display(), "pending change subsumed");
                    return;
                }
            }
        }
        self.index.insert(path.clone(), self.items.len());
        self.items.push(PendingChange::new(path, now, flags));
    }

    /// Queue the child `name` of `dir`.
    pub fn add_child(&mut self, dir: &Path, name: &str, now: SystemTime, flags: PendingFlags) {
        self.add(dir.join(name), now, flags);
    }

    /// Queue a sync token, fulfilled once the working set that absorbed it
    /// is fully drained.
    pub fn add_sync(&mut self, sync: SyncPromise) {
        self.syncs.push(sync);
    }

    /// Merge a stolen batch into this working set, re-coalescing items.
    pub fn append(&mut self, items: Vec<PendingChange>, syncs: Vec<SyncPromise>) {
        for item in items {
            self.add(item.path, item.now, item.flags);
        }
        self.syncs.extend(syncs);
    }

    /// Detach and return the entire item chain.
    #[must_use]
    pub fn steal_items(&mut self) -> Vec<PendingChange> {
        self.index.clear();
        std::mem::take(&mut self.items)
    }

    /// Drain the queued sync tokens.
    #[must_use]
    pub fn steal_syncs(&mut self) -> Vec<SyncPromise> {
        std::mem::take(&mut self.syncs)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.syncs.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Default)]
struct Shared {
    changes: PendingChanges,
    pinged: bool,
}

/// Thread-safe pending queue shared between the watcher and the worker.
#[derive(Debug, Default)]
pub struct PendingCollection {
    shared: Mutex<Shared>,
    cond: Condvar,
}

/// Lock over the shared queue, dereferencing to the inner
/// [`PendingChanges`].
pub struct PendingLock<'a> {
    guard: MutexGuard<'a, Shared>,
}

impl std::ops::Deref for PendingLock<'_> {
    type Target = PendingChanges;

    fn deref(&self) -> &PendingChanges {
        &self.guard.changes
    }
}

impl std::ops::DerefMut for PendingLock<'_> {
    fn deref_mut(&mut self) -> &mut PendingChanges {
        &mut self.guard.changes
    }
}

impl PendingLock<'_> {
    /// Consume the ping flag. Used by the crawl drain once it has verified,
    /// under this lock, that the queue is empty: wakeups caused by already
    /// consumed items must not spend a wait cycle.
    pub(crate) fn take_pinged(&mut self) -> bool {
        std::mem::replace(&mut self.guard.pinged, false)
    }
}

fn lock_or_recover(mutex: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PendingCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the queue for direct manipulation (stealing during a crawl).
    #[must_use]
    pub fn lock(&self) -> PendingLock<'_> {
        PendingLock {
            guard: lock_or_recover(&self.shared),
        }
    }

    /// Queue a change and wake the worker.
    pub fn add(&self, path: impl Into<PathBuf>, now: SystemTime, flags: PendingFlags) {
        {
            let mut shared = lock_or_recover(&self.shared);
            shared.changes.add(path, now, flags);
            shared.pinged = true;
        }
        self.cond.notify_all();
    }

    /// Queue a sync token and wake the worker.
    pub fn add_sync(&self, sync: SyncPromise) {
        {
            let mut shared = lock_or_recover(&self.shared);
            shared.changes.add_sync(sync);
            shared.pinged = true;
        }
        self.cond.notify_all();
    }

    /// Wake the worker without queueing anything (stop requests, tests).
    pub fn ping(&self) {
        {
            let mut shared = lock_or_recover(&self.shared);
            shared.pinged = true;
        }
        self.cond.notify_all();
    }

    /// Block until an enqueue pings the queue or `timeout` elapses.
    ///
    /// Returns the held lock plus whether the wake was a ping (`false`
    /// means the timeout elapsed). The ping flag is consumed.
    #[must_use]
    pub fn lock_and_wait(&self, timeout: Duration) -> (PendingLock<'_>, bool) {
        let guard = lock_or_recover(&self.shared);
        let (mut guard, _timeout_result) = self
            .cond
            .wait_timeout_while(guard, timeout, |shared| !shared.pinged)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pinged = guard.pinged;
        guard.pinged = false;
        (PendingLock { guard }, pinged)
    }

    /// Number of queued items (diagnostics only; racy by nature).
    #[must_use]
    pub fn pending_item_count(&self) -> usize {
        lock_or_recover(&self.shared).changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.shared).changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::signal;

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn exact_path_merges_flags() {
        let mut changes = PendingChanges::new();
        changes.add("/w/a", now(), PendingFlags::empty());
        changes.add("/w/a", now(), PendingFlags::RECURSIVE);

        let items = changes.steal_items();
        assert_eq!(items.len(), 1);
        assert!(items[0].flags.contains(PendingFlags::RECURSIVE));
    }

    #[test]
    fn recursive_ancestor_subsumes_descendant() {
        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::RECURSIVE);
        changes.add("/w/a/b", now(), PendingFlags::empty());

        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn non_recursive_ancestor_does_not_subsume() {
        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::empty());
        changes.add("/w/a", now(), PendingFlags::empty());

        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn crawl_only_survives_recursive_ancestor() {
        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::RECURSIVE);
        changes.add("/w/sub", now(), PendingFlags::CRAWL_ONLY);

        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn desynced_newcomer_survives_clean_ancestor() {
        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::RECURSIVE);
        changes.add("/w/a", now(), PendingFlags::IS_DESYNCED);

        // Dropping it would lose the desync marker.
        assert_eq!(changes.len(), 2);

        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::RECURSIVE | PendingFlags::IS_DESYNCED);
        changes.add("/w/a", now(), PendingFlags::IS_DESYNCED);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn steal_empties_and_preserves_order() {
        let mut changes = PendingChanges::new();
        changes.add("/w/a", now(), PendingFlags::empty());
        changes.add("/w/b", now(), PendingFlags::empty());

        let items = changes.steal_items();
        assert_eq!(items[0].path, PathBuf::from("/w/a"));
        assert_eq!(items[1].path, PathBuf::from("/w/b"));
        assert!(changes.is_empty());

        // The index was cleared along with the buffer.
        changes.add("/w/a", now(), PendingFlags::empty());
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn syncs_count_toward_non_empty() {
        let mut changes = PendingChanges::new();
        let (promise, _waiter) = signal::pair();
        changes.add_sync(promise);
        assert!(!changes.is_empty());
        assert_eq!(changes.steal_syncs().len(), 1);
        assert!(changes.is_empty());
    }

    #[test]
    fn lock_and_wait_times_out_without_ping() {
        let collection = PendingCollection::new();
        let start = Instant::now();
        let (_lock, pinged) = collection.lock_and_wait(Duration::from_millis(20));
        assert!(!pinged);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn add_pings_a_waiting_worker() {
        let collection = Arc::new(PendingCollection::new());
        let feeder = Arc::clone(&collection);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            feeder.add("/w/a", SystemTime::now(), PendingFlags::VIA_NOTIFY);
        });

        let (mut lock, pinged) = collection.lock_and_wait(Duration::from_secs(5));
        assert!(pinged);
        let items = lock.steal_items();
        assert_eq!(items.len(), 1);
        drop(lock);
        handle.join().expect("feeder join");
    }

    #[test]
    fn ping_flag_is_consumed() {
        let collection = PendingCollection::new();
        collection.ping();
        let (lock, pinged) = collection.lock_and_wait(Duration::from_millis(1));
        assert!(pinged);
        drop(lock);
        let (_lock, pinged) = collection.lock_and_wait(Duration::from_millis(1));
        assert!(!pinged);
    }

    #[test]
    fn append_recoalesces() {
        let mut changes = PendingChanges::new();
        changes.add("/w", now(), PendingFlags::RECURSIVE);

        let mut stolen = PendingChanges::new();
        stolen.add("/w/a", now(), PendingFlags::empty());
        stolen.add("/w", now(), PendingFlags::IS_DESYNCED);
        let items = stolen.steal_items();

        changes.append(items, Vec::new());
        // "/w/a" was subsumed, "/w" merged.
        assert_eq!(changes.len(), 1);
        let items = changes.steal_items();
        assert!(items[0].flags.contains(PendingFlags::IS_DESYNCED));
    }
}
