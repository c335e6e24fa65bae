//! Per-root context: configuration, cancellation, recrawl bookkeeping,
//! cookie registry, and the unilateral event channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tracing::{debug, warn};
use vigil_core::{EventSink, RootConfig};

use crate::cookies::CookieRegistry;

/// Recrawl bookkeeping for one root.
///
/// `should_recrawl` is raised by [`Root::schedule_recrawl`] and cleared only
/// when a full crawl completes.
#[derive(Debug, Default)]
pub struct RecrawlInfo {
    pub should_recrawl: bool,
    pub reason: Option<String>,
    pub recrawl_count: u32,
    pub crawl_start: Option<Instant>,
    pub crawl_finish: Option<Instant>,
}

/// Context for one watched root.
pub struct Root {
    root_path: PathBuf,
    pub config: RootConfig,
    pub cookies: CookieRegistry,
    recrawl_info: RwLock<RecrawlInfo>,
    done_initial: AtomicBool,
    cancelled: AtomicBool,
    unilateral: Arc<dyn EventSink>,
    last_activity: Mutex<Instant>,
    last_age_out: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("root_path", &self.root_path)
            .field("done_initial", &self.done_initial)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl Root {
    #[must_use]
    pub fn new(
        root_path: impl Into<PathBuf>,
        config: RootConfig,
        unilateral: Arc<dyn EventSink>,
    ) -> Self {
        let root_path = root_path.into();
        let cookies = CookieRegistry::new(&root_path);
        Self {
            root_path,
            config,
            cookies,
            recrawl_info: RwLock::new(RecrawlInfo::default()),
            done_initial: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            unilateral,
            last_activity: Mutex::new(Instant::now()),
            last_age_out: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    #[must_use]
    pub fn case_sensitive(&self) -> bool {
        self.config.case_sensitive
    }

    #[must_use]
    pub fn unilateral(&self) -> &dyn EventSink {
        self.unilateral.as_ref()
    }

    /// Lock recrawl info for reading.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned; the worker never panics while
    /// holding it.
    #[must_use]
    pub fn recrawl_info(&self) -> RwLockReadGuard<'_, RecrawlInfo> {
        self.recrawl_info.read().expect("recrawl info lock poisoned")
    }

    /// Lock recrawl info for writing. See [`Root::recrawl_info`].
    ///
    /// Composite operations that also take the crawl state must acquire the
    /// two in this order (recrawl info first).
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn recrawl_info_mut(&self) -> RwLockWriteGuard<'_, RecrawlInfo> {
        self.recrawl_info
            .write()
            .expect("recrawl info lock poisoned")
    }

    /// Request a forced full rediscovery of the root.
    ///
    /// Idempotent while a recrawl is already scheduled; the transition is
    /// logged once.
    pub fn schedule_recrawl(&self, reason: &str) {
        let mut info = self.recrawl_info_mut();
        if !info.should_recrawl {
            warn!(
                root = %self.root_path.display(),
                reason,
                "scheduling recrawl"
            );
            info.reason = Some(reason.to_owned());
        }
        info.should_recrawl = true;
    }

    /// Whether the first full crawl since the last recrawl has completed.
    #[must_use]
    pub fn done_initial(&self) -> bool {
        self.done_initial.load(Ordering::Acquire)
    }

    pub(crate) fn set_done_initial(&self, done: bool) {
        self.done_initial.store(done, Ordering::Release);
    }

    /// Cooperatively cancel the root. The worker observes this between
    /// items.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record query-surface activity for the idle-reap clock.
    pub fn touch(&self) {
        let mut last = match self.last_activity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Instant::now();
    }

    /// Whether the root has been idle long enough to reap.
    #[must_use]
    pub fn consider_reap(&self) -> bool {
        let age = self.config.idle_reap_age();
        if age.is_zero() {
            return false;
        }
        let last = match self.last_activity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idle = last.elapsed();
        if idle >= age {
            debug!(root = %self.root_path.display(), idle_secs = idle.as_secs(), "root is idle-reapable");
            true
        } else {
            false
        }
    }

    /// Whether an age-out pass is due, advancing the pacing stamp when it
    /// is.
    pub fn take_age_out_due(&self, now: Instant) -> bool {
        let interval = self.config.gc_interval();
        if interval.is_zero() {
            return false;
        }
        let mut last = match self.last_age_out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = last.is_none_or(|at| now.duration_since(at) >= interval);
        if due {
            *last = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vigil_core::NoopEventSink;

    use super::*;

    fn root_with(config: RootConfig) -> Root {
        Root::new("/w", config, Arc::new(NoopEventSink))
    }

    #[test]
    fn schedule_recrawl_is_idempotent() {
        let root = root_with(RootConfig::default());
        root.schedule_recrawl("first reason");
        root.schedule_recrawl("second reason");

        let info = root.recrawl_info();
        assert!(info.should_recrawl);
        // The first transition wins the recorded reason.
        assert_eq!(info.reason.as_deref(), Some("first reason"));
        assert_eq!(info.recrawl_count, 0);
    }

    #[test]
    fn done_initial_starts_false() {
        let root = root_with(RootConfig::default());
        assert!(!root.done_initial());
        root.set_done_initial(true);
        assert!(root.done_initial());
    }

    #[test]
    fn reap_disabled_by_zero_age() {
        let root = root_with(RootConfig {
            idle_reap_age_ms: 0,
            ..Default::default()
        });
        assert!(!root.consider_reap());
    }

    #[test]
    fn reap_fires_after_idle_age() {
        let root = root_with(RootConfig {
            idle_reap_age_ms: 1,
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(root.consider_reap());

        root.touch();
        // Note: zero idle time right after a touch.
        let root_long = root_with(RootConfig {
            idle_reap_age_ms: 60_000,
            ..Default::default()
        });
        assert!(!root_long.consider_reap());
    }

    #[test]
    fn age_out_pacing_respects_interval() {
        let root = root_with(RootConfig {
            gc_interval_ms: 10,
            ..Default::default()
        });
        let t0 = Instant::now();
        assert!(root.take_age_out_due(t0));
        assert!(!root.take_age_out_due(t0 + Duration::from_millis(5)));
        assert!(root.take_age_out_due(t0 + Duration::from_millis(15)));
    }

    #[test]
    fn age_out_disabled_by_zero_interval() {
        let root = root_with(RootConfig {
            gc_interval_ms: 0,
            ..Default::default()
        });
        assert!(!root.take_age_out_due(Instant::now()));
    }
}
