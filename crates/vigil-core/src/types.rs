//! Shared data types for the reconciliation pipeline: pending-change flags,
//! stat records, directory-entry hints, and the observation clock.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Flags carried by a pending change, modulating how the path is processed.
///
/// The set is serialized only in-process; there is no wire format.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PendingFlags(u8);

impl PendingFlags {
    /// Process the whole subtree under the path, not just the path itself.
    pub const RECURSIVE: Self = Self(1 << 0);
    /// The change arrived directly from the kernel watcher, not from a
    /// recursive crawl.
    pub const VIA_NOTIFY: Self = Self(1 << 1);
    /// The watcher has (or may have) dropped events for this subtree.
    pub const IS_DESYNCED: Self = Self(1 << 2);
    /// Route straight to the crawler, bypassing single-path stat.
    pub const CRAWL_ONLY: Self = Self(1 << 3);
    /// The directory needs all children statted even without per-file
    /// notifications.
    pub const NONRECURSIVE_SCAN: Self = Self(1 << 4);

    /// The empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// The bits of `self` restricted to `mask`.
    #[must_use]
    pub const fn intersect(self, mask: Self) -> Self {
        Self(self.0 & mask.0)
    }
}

impl std::ops::BitOr for PendingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PendingFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PendingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PendingFlags, &str); 5] = [
            (PendingFlags::RECURSIVE, "RECURSIVE"),
            (PendingFlags::VIA_NOTIFY, "VIA_NOTIFY"),
            (PendingFlags::IS_DESYNCED, "IS_DESYNCED"),
            (PendingFlags::CRAWL_ONLY, "CRAWL_ONLY"),
            (PendingFlags::NONRECURSIVE_SCAN, "NONRECURSIVE_SCAN"),
        ];
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A notification that a path may need re-examination.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Absolute path under the watched root.
    pub path: PathBuf,
    /// Wall-clock instant the change was observed; stamped onto mutated
    /// nodes alongside the tick.
    pub now: SystemTime,
    /// Processing modulation flags.
    pub flags: PendingFlags,
}

impl PendingChange {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, now: SystemTime, flags: PendingFlags) -> Self {
        Self {
            path: path.into(),
            now,
            flags,
        }
    }
}

/// Stat metadata for one filesystem node, as returned by
/// [`FileSystem::file_information`](crate::traits::FileSystem::file_information).
///
/// Symlinks are not followed; a symlink reports `is_dir = false` regardless
/// of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Inode number (0 on platforms without one).
    pub ino: u64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the node is a directory.
    pub is_dir: bool,
    /// Whether the node is a symbolic link.
    pub is_symlink: bool,
    /// Hard link count; for directories a proxy for subdirectory count.
    pub nlink: u64,
    /// Last modification time.
    pub mtime: SystemTime,
}

/// One entry yielded by a [`DirReader`](crate::traits::DirReader), used as a
/// pre-stat hint when reconciling the child.
///
/// The reader contract never yields `.` or `..`. `meta` is populated only
/// when the platform's directory enumeration returns full stat data anyway
/// (Windows); elsewhere it stays `None` and the reconciler issues its own
/// stat call.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// Child name (no path separators).
    pub name: String,
    /// Full stat data when enumeration supplies it for free.
    pub meta: Option<FileMeta>,
}

/// The observation clock stamped onto a node when it is reconciled.
///
/// `ticks` is the process-wide monotonic reconciliation counter; `at` is the
/// wall-clock instant carried by the pending change that caused the
/// observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockStamp {
    /// Monotonic reconciliation tick.
    pub ticks: u64,
    /// Wall-clock observation time.
    pub at: SystemTime,
}

impl ClockStamp {
    #[must_use]
    pub const fn new(ticks: u64, at: SystemTime) -> Self {
        Self { ticks, at }
    }
}
