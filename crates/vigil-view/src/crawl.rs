//! Directory crawling and single-path reconciliation.
//!
//! The crawler refreshes one directory subtree: it derives its scan policy
//! from the watcher's capabilities and the pending flags, detects root
//! replacement by inode, tentatively marks known children `maybe_deleted`,
//! dispatches children back through the path reconciler, and sweeps
//! whatever is still `maybe_deleted` onto the working set for deletion
//! processing. `stat_path` refreshes exactly one node and owns the
//! inode-change-implies-replace logic.

use std::io;
use std::path::Path;

use tracing::{debug, trace, warn};
use vigil_core::{
    ClockStamp, DirEntryInfo, PendingChange, PendingFlags, WatchError, WatcherCaps,
};

use crate::pending::PendingChanges;
use crate::reconcile::LiveView;
use crate::root::Root;
use crate::view::{ViewDatabase, fold_name};

impl LiveView {
    /// Refresh the directory subtree at `pending.path`.
    pub(crate) fn crawler(
        &self,
        root: &Root,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
    ) {
        let mut recursive = pending.flags.contains(PendingFlags::RECURSIVE);
        let caps = self.watcher.caps();
        // With per-file notifications the children report for themselves
        // unless renames arrive coalesced; without them, only a directory
        // the watcher explicitly asked about needs every child statted.
        let stat_all = if caps.contains(WatcherCaps::PER_FILE_NOTIFICATIONS) {
            caps.contains(WatcherCaps::COALESCED_RENAME)
        } else {
            pending.flags.contains(PendingFlags::NONRECURSIVE_SCAN)
        };

        let stamp = ClockStamp::new(self.current_tick(), pending.now);

        // Root replacement detection. The inode check for ordinary
        // directories lives in stat_path; the root never has a node of its
        // own, and some filesystems replace it without any notification at
        // all, which would leave the cookie fence broken forever.
        if pending.path == self.root_path {
            match self.fs.file_information(&pending.path, self.case_sensitive) {
                Ok(st) => {
                    if st.ino != view.root_inode() {
                        if view.root_inode() != 0 {
                            root.schedule_recrawl(
                                "root was replaced and the kernel did not notify us",
                            );
                            return;
                        }
                        // Lazily initialized on the first crawl.
                        recursive = true;
                        view.set_root_inode(st.ino);
                    }
                }
                Err(source) => {
                    let err = WatchError::Stat {
                        path: pending.path.clone(),
                        source,
                    };
                    self.handle_open_error(root, &pending.path, &err);
                    view.mark_dir_deleted(&pending.path, stamp, true);
                    return;
                }
            }
        }

        debug!(
            path = %pending.path.display(),
            recursive,
            stat_all,
            "crawling directory"
        );

        // Watch registration and the open are one atomic operation; which
        // happens first is backend-specific.
        let mut reader = match self.watcher.start_watch_dir(&pending.path) {
            Ok(reader) => reader,
            Err(err) => {
                debug!(path = %pending.path.display(), error = %err, "start_watch_dir failed");
                self.handle_open_error(root, &pending.path, &err);
                view.mark_dir_deleted(&pending.path, stamp, true);
                return;
            }
        };

        let link_count = reader.link_count();
        let mut entries: Vec<DirEntryInfo> = Vec::new();
        loop {
            match reader.read_next() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(source) => {
                    let err = WatchError::ReadDir {
                        path: pending.path.clone(),
                        source,
                    };
                    warn!(error = %err, "directory enumeration failed");
                    coll.add(pending.path.clone(), pending.now, PendingFlags::empty());
                    break;
                }
            }
        }
        drop(reader);

        let mut dispatch: Vec<(PendingChange, DirEntryInfo)> = Vec::with_capacity(entries.len());
        {
            let Some(dir) = view.resolve_dir_mut(&pending.path, true) else {
                return;
            };

            if dir.files.is_empty() {
                // st_nlink is usually subdir count + 2; it is passed
                // through as-is and the map implementation rounds up.
                let num_dirs = usize::try_from(link_count.unwrap_or(0)).unwrap_or(0);
                dir.apply_size_hint(num_dirs, root.config.hint_num_files_per_dir);
            }

            // Tentative delete flag; cleared as entries are seen.
            for file in dir.files.values_mut() {
                if file.exists {
                    file.maybe_deleted = true;
                }
            }

            for entry in entries {
                let key = fold_name(&entry.name, self.case_sensitive);
                let mut new_flags = PendingFlags::empty();
                let needs_processing = match dir.files.get_mut(&key) {
                    Some(file) => {
                        file.maybe_deleted = false;
                        let absent = !file.exists;
                        if recursive || absent {
                            new_flags.insert(PendingFlags::RECURSIVE);
                        }
                        absent || stat_all || recursive
                    }
                    None => {
                        new_flags.insert(PendingFlags::RECURSIVE);
                        true
                    }
                };
                if needs_processing {
                    new_flags.insert(pending.flags.intersect(PendingFlags::IS_DESYNCED));
                    let full_path = pending.path.join(&entry.name);
                    trace!(
                        path = %full_path.display(),
                        old_flags = ?pending.flags,
                        new_flags = ?new_flags,
                        "queueing child from crawl"
                    );
                    dispatch.push((PendingChange::new(full_path, pending.now, new_flags), entry));
                }
            }
        }

        for (change, entry) in &dispatch {
            self.process_path(root, view, coll, change, Some(entry));
        }

        // Anything still maybe_deleted is actually deleted; arrange to
        // re-process it shortly. Directories ride along on recursive passes
        // so their own subtrees get the same treatment.
        if let Some(dir) = view.resolve_dir_mut(&pending.path, false) {
            let sweep_flags = if recursive {
                PendingFlags::RECURSIVE
            } else {
                PendingFlags::empty()
            };
            let sweep: Vec<String> = dir
                .files
                .values()
                .filter(|file| file.exists && (file.maybe_deleted || (file.is_dir() && recursive)))
                .map(|file| file.name().to_owned())
                .collect();
            for name in sweep {
                coll.add_child(&pending.path, &name, pending.now, sweep_flags);
            }
        }
    }

    /// Refresh exactly one node from a fresh stat (or the enumeration's
    /// pre-stat data when the platform supplies it).
    pub(crate) fn stat_path(
        &self,
        root: &Root,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
        pre_stat: Option<&DirEntryInfo>,
    ) {
        debug_assert!(
            pending.path != self.root_path,
            "the root is crawled, never statted as a child"
        );

        let stamp = ClockStamp::new(self.current_tick(), pending.now);
        let desync = pending.flags.intersect(PendingFlags::IS_DESYNCED);

        let st = match pre_stat.and_then(|entry| entry.meta) {
            Some(st) => Ok(st),
            None => self.fs.file_information(&pending.path, self.case_sensitive),
        };

        let st = match st {
            Ok(st) => st,
            Err(source)
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                debug!(path = %pending.path.display(), "path is gone");
                if let Some(file) = view.child_file_mut(&pending.path, false, stamp)
                    && file.exists
                {
                    file.exists = false;
                    file.maybe_deleted = false;
                    file.observed = stamp;
                }
                // A directory that vanished takes its subtree with it.
                view.mark_dir_deleted(&pending.path, stamp, true);
                return;
            }
            Err(source) => {
                let err = WatchError::Stat {
                    path: pending.path.clone(),
                    source,
                };
                warn!(error = %err, "transient stat failure; re-queueing");
                coll.add(pending.path.clone(), pending.now, PendingFlags::empty());
                return;
            }
        };

        let Some(file) = view.child_file_mut(&pending.path, true, stamp) else {
            return;
        };
        let existed = file.exists;
        let prior_ino = file.stat.map(|s| s.ino);
        let prior_is_dir = file.is_dir();

        file.exists = true;
        file.maybe_deleted = false;
        file.stat = Some(st);
        file.observed = stamp;

        // A directory whose inode changed (or that turned into a file) was
        // replaced out from under us; its recorded subtree is dead.
        let replaced = existed && prior_is_dir && (prior_ino != Some(st.ino) || !st.is_dir);
        if replaced {
            debug!(path = %pending.path.display(), "directory was replaced");
            view.mark_dir_deleted(&pending.path, stamp, true);
        }

        if st.is_dir {
            let needs_crawl = !existed
                || !prior_is_dir
                || replaced
                || pending.flags.contains(PendingFlags::RECURSIVE);
            if needs_crawl {
                coll.add(
                    pending.path.clone(),
                    pending.now,
                    PendingFlags::CRAWL_ONLY | PendingFlags::RECURSIVE | desync,
                );
            }
        }
    }

    /// Standard open-failure disposition: a vanished directory is recorded
    /// as deleted (the caller does the marking), an unreadable one is left
    /// alone with a warning, and anything else forces a recrawl. A vanished
    /// *root* cancels the watch outright.
    pub(crate) fn handle_open_error(&self, root: &Root, path: &Path, err: &WatchError) {
        if err.is_gone() {
            if path == self.root_path {
                warn!(root = %self.root_path.display(), "root directory is gone; cancelling watch");
                root.cancel();
            } else {
                debug!(path = %path.display(), "directory vanished before it could be scanned");
            }
        } else if err.io_kind() == Some(io::ErrorKind::PermissionDenied) {
            warn!(path = %path.display(), error = %err, "directory is not accessible");
        } else {
            root.schedule_recrawl(&format!("error opening {}: {err}", path.display()));
        }
    }
}
