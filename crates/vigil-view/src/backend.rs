//! Production implementations of the watcher and filesystem contracts.
//!
//! [`NotifyWatcher`] bridges the `notify` crate into the pending queue:
//! every kernel event becomes a `VIA_NOTIFY` pending add, and a backend
//! error (dropped events, overflow) becomes a desynced recursive re-enqueue
//! of the root so the worker recovers through its normal recrawl path.
//! [`PassiveWatcher`] opens directories without ever notifying; callers that
//! poll (and deterministic tests) drive the pending queue themselves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, warn};
use vigil_core::{
    DirEntryInfo, DirReader, FileMeta, FileSystem, PendingFlags, WatchError, WatchResult, Watcher,
    WatcherCaps,
};

use crate::pending::PendingCollection;

fn file_meta_from(metadata: &fs::Metadata) -> FileMeta {
    #[cfg(unix)]
    let (ino, nlink) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.ino(), metadata.nlink())
    };
    #[cfg(not(unix))]
    let (ino, nlink) = (0, 1);

    FileMeta {
        ino,
        size: metadata.len(),
        is_dir: metadata.file_type().is_dir(),
        is_symlink: metadata.file_type().is_symlink(),
        nlink,
        mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

/// Stat access through `std::fs`, without following symlinks.
#[derive(Debug, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn file_information(&self, path: &Path, _case_sensitive: bool) -> io::Result<FileMeta> {
        fs::symlink_metadata(path).map(|metadata| file_meta_from(&metadata))
    }
}

/// Directory enumeration over `std::fs::ReadDir`.
///
/// `std::fs::ReadDir` never yields `.` or `..`, satisfying the reader
/// contract directly.
#[derive(Debug)]
pub struct OsDirReader {
    iter: fs::ReadDir,
    link_count: Option<u64>,
}

impl OsDirReader {
    /// Open `path` for enumeration.
    ///
    /// # Errors
    ///
    /// Returns the raw open error; callers wrap it into
    /// [`WatchError::Open`].
    pub fn open(path: &Path) -> io::Result<Self> {
        let iter = fs::read_dir(path)?;
        let link_count = fs::symlink_metadata(path)
            .ok()
            .map(|metadata| file_meta_from(&metadata).nlink);
        Ok(Self { iter, link_count })
    }
}

impl DirReader for OsDirReader {
    fn read_next(&mut self) -> io::Result<Option<DirEntryInfo>> {
        let Some(entry) = self.iter.next() else {
            return Ok(None);
        };
        let entry = entry?;

        // Windows enumeration already carries stat data; elsewhere the
        // reconciler stats on its own.
        #[cfg(windows)]
        let meta = entry.metadata().ok().map(|m| file_meta_from(&m));
        #[cfg(not(windows))]
        let meta = None;

        Ok(Some(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            meta,
        }))
    }

    fn link_count(&self) -> Option<u64> {
        self.link_count
    }
}

/// A watcher that opens directories but never notifies.
///
/// Callers feed the pending queue themselves (polling schedulers, tests).
/// The advertised capabilities are configurable so test setups can exercise
/// both cookie-consideration branches.
#[derive(Debug, Default)]
pub struct PassiveWatcher {
    caps: WatcherCaps,
}

impl PassiveWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_caps(caps: WatcherCaps) -> Self {
        Self { caps }
    }
}

impl Watcher for PassiveWatcher {
    fn caps(&self) -> WatcherCaps {
        self.caps
    }

    fn start_watch_dir(&self, path: &Path) -> WatchResult<Box<dyn DirReader>> {
        let reader = OsDirReader::open(path).map_err(|source| WatchError::Open {
            path: path.to_owned(),
            source,
        })?;
        Ok(Box::new(reader))
    }
}

fn notify_open_error(path: &Path, error: notify::Error) -> WatchError {
    let source = match error.kind {
        notify::ErrorKind::Io(source) => source,
        notify::ErrorKind::PathNotFound => io::Error::from(io::ErrorKind::NotFound),
        other => io::Error::other(format!("{other:?}")),
    };
    WatchError::Open {
        path: path.to_owned(),
        source,
    }
}

/// Kernel watcher backed by the `notify` crate, registering one
/// non-recursive watch per crawled directory.
pub struct NotifyWatcher {
    inner: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for NotifyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyWatcher").finish_non_exhaustive()
    }
}

impl NotifyWatcher {
    /// Create a watcher feeding `pending`. `root_path` is re-enqueued
    /// desynced when the backend reports losing events.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform watcher cannot be created.
    pub fn new(root_path: &Path, pending: Arc<PendingCollection>) -> WatchResult<Self> {
        let desync_root = root_path.to_owned();
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let now = SystemTime::now();
                    for path in event.paths {
                        pending.add(path, now, PendingFlags::VIA_NOTIFY);
                    }
                }
                Err(error) => {
                    warn!(error = %error, "watch backend lost events; forcing desynced rescan");
                    pending.add(
                        desync_root.clone(),
                        SystemTime::now(),
                        PendingFlags::RECURSIVE
                            | PendingFlags::IS_DESYNCED
                            | PendingFlags::CRAWL_ONLY,
                    );
                }
            }
        })
        .map_err(|error| notify_open_error(root_path, error))?;

        Ok(Self {
            inner: Mutex::new(Some(watcher)),
        })
    }
}

impl Watcher for NotifyWatcher {
    fn caps(&self) -> WatcherCaps {
        if cfg!(target_os = "macos") {
            WatcherCaps::PER_FILE_NOTIFICATIONS | WatcherCaps::COALESCED_RENAME
        } else {
            WatcherCaps::PER_FILE_NOTIFICATIONS
        }
    }

    fn start_watch_dir(&self, path: &Path) -> WatchResult<Box<dyn DirReader>> {
        {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(watcher) = inner.as_mut() else {
                return Err(WatchError::Open {
                    path: path.to_owned(),
                    source: io::Error::other("watcher already stopped"),
                });
            };
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|error| notify_open_error(path, error))?;
        }

        let reader = OsDirReader::open(path).map_err(|source| WatchError::Open {
            path: path.to_owned(),
            source,
        })?;
        Ok(Box::new(reader))
    }

    fn stop(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.take().is_some() {
            debug!("notify watcher stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn os_dir_reader_lists_children() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a"), b"x").expect("write a");
        fs::create_dir(dir.path().join("b")).expect("mkdir b");

        let mut reader = OsDirReader::open(dir.path()).expect("open dir");
        let mut names = Vec::new();
        while let Some(entry) = reader.read_next().expect("read entry") {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn os_file_system_stats_without_following_symlinks() {
        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("f");
        fs::write(&file, b"hello").expect("write f");

        let fs_impl = OsFileSystem;
        let meta = fs_impl
            .file_information(&file, true)
            .expect("stat succeeds");
        assert!(!meta.is_dir);
        assert_eq!(meta.size, 5);

        let dir_meta = fs_impl
            .file_information(dir.path(), true)
            .expect("dir stat succeeds");
        assert!(dir_meta.is_dir);
        #[cfg(unix)]
        assert_ne!(dir_meta.ino, 0);
    }

    #[test]
    fn missing_path_reports_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let err = OsFileSystem
            .file_information(&dir.path().join("nope"), true)
            .expect_err("missing path");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn passive_watcher_opens_without_notifying() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a"), b"").expect("write a");

        let watcher = PassiveWatcher::new();
        assert_eq!(watcher.caps(), WatcherCaps::empty());
        let mut reader = watcher.start_watch_dir(dir.path()).expect("open");
        assert!(reader.read_next().expect("entry").is_some());

        let err = watcher
            .start_watch_dir(&dir.path().join("missing"))
            .expect_err("missing dir");
        assert!(err.is_gone());
    }

    #[test]
    fn notify_watcher_feeds_pending_queue() {
        let dir = TempDir::new().expect("temp dir");
        let pending = Arc::new(PendingCollection::new());
        let watcher =
            NotifyWatcher::new(dir.path(), Arc::clone(&pending)).expect("create watcher");

        let _reader = watcher.start_watch_dir(dir.path()).expect("watch root");
        fs::write(dir.path().join("fresh"), b"x").expect("write fresh");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut saw_notify = false;
        while Instant::now() < deadline {
            let (mut lock, pinged) = pending.lock_and_wait(Duration::from_millis(100));
            if pinged {
                let items = lock.steal_items();
                if items
                    .iter()
                    .any(|item| item.flags.contains(PendingFlags::VIA_NOTIFY))
                {
                    saw_notify = true;
                    break;
                }
            }
            drop(lock);
            thread::sleep(Duration::from_millis(10));
        }
        watcher.stop();
        assert!(saw_notify, "no VIA_NOTIFY pending change arrived");
    }
}
