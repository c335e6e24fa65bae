//! The in-memory directory/file tree backing a watched root.
//!
//! One [`ViewDatabase`] per root, mutated only by that root's reconciliation
//! worker (readers take the surrounding `RwLock` in read mode). Every child
//! of a directory has a metadata node in its parent's `files` map; children
//! that are themselves directories additionally own a [`DirNode`] in the
//! parent's `dirs` map. The root directory never has a metadata node of its
//! own; its identity is tracked through the recorded root inode instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;
use vigil_core::{ClockStamp, FileMeta};

/// Metadata node for one child of a directory.
#[derive(Debug, Clone)]
pub struct FileNode {
    name: String,
    /// Whether the node was present on disk at its last observation.
    pub exists: bool,
    /// Transient flag set while a crawl decides which children vanished.
    pub maybe_deleted: bool,
    /// Last stat result, absent until first observed.
    pub stat: Option<FileMeta>,
    /// Observation clock at the last mutation.
    pub observed: ClockStamp,
}

impl FileNode {
    fn new(name: String, observed: ClockStamp) -> Self {
        Self {
            name,
            exists: false,
            maybe_deleted: false,
            stat: None,
            observed,
        }
    }

    /// Original-case child name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the node is known to be a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.stat.is_some_and(|st| st.is_dir)
    }
}

/// One directory in the tree.
#[derive(Debug, Default, Clone)]
pub struct DirNode {
    /// Metadata nodes for all children, keyed by folded name.
    pub files: HashMap<String, FileNode>,
    /// Child directories, keyed by folded name.
    pub dirs: HashMap<String, DirNode>,
}

impl DirNode {
    /// Pre-size the child maps on first scan of the directory.
    pub fn apply_size_hint(&mut self, num_dirs: usize, num_files: usize) {
        if self.files.is_empty() && num_files > 0 {
            self.files.reserve(num_files);
        }
        if self.dirs.is_empty() && num_dirs > 0 {
            self.dirs.reserve(num_dirs);
        }
    }
}

/// Read-side snapshot of one node, handed out under the view read lock.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub exists: bool,
    pub stat: Option<FileMeta>,
    pub observed: ClockStamp,
}

/// The tree of directory and file nodes for one watched root.
#[derive(Debug)]
pub struct ViewDatabase {
    root_path: PathBuf,
    case_sensitive: bool,
    root: DirNode,
    root_inode: u64,
}

impl ViewDatabase {
    #[must_use]
    pub fn new(root_path: impl Into<PathBuf>, case_sensitive: bool) -> Self {
        Self {
            root_path: root_path.into(),
            case_sensitive,
            root: DirNode::default(),
            root_inode: 0,
        }
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Inode observed for the root at first crawl; 0 until initialized.
    #[must_use]
    pub const fn root_inode(&self) -> u64 {
        self.root_inode
    }

    pub const fn set_root_inode(&mut self, ino: u64) {
        self.root_inode = ino;
    }

    /// Fold a child name into its map key.
    #[must_use]
    pub fn key_for(&self, name: &str) -> String {
        fold_name(name, self.case_sensitive)
    }

    /// Path components of `path` relative to the root, folded for keying.
    /// `None` when `path` is not under the root.
    fn relative_keys(&self, path: &Path) -> Option<Vec<String>> {
        let rel = path.strip_prefix(&self.root_path).ok()?;
        Some(
            rel.components()
                .map(|c| self.key_for(&c.as_os_str().to_string_lossy()))
                .collect(),
        )
    }

    /// Resolve the directory node for `path`, creating intermediate nodes
    /// when `create` is set.
    pub fn resolve_dir_mut(&mut self, path: &Path, create: bool) -> Option<&mut DirNode> {
        let keys = self.relative_keys(path)?;
        let mut dir = &mut self.root;
        for key in keys {
            if create {
                dir = dir.dirs.entry(key).or_default();
            } else {
                dir = dir.dirs.get_mut(&key)?;
            }
        }
        Some(dir)
    }

    /// Read-only directory resolution.
    #[must_use]
    pub fn resolve_dir(&self, path: &Path) -> Option<&DirNode> {
        let keys = self.relative_keys(path)?;
        let mut dir = &self.root;
        for key in keys {
            dir = dir.dirs.get(&key)?;
        }
        Some(dir)
    }

    /// The metadata node for one child, creating it when `create` is set.
    /// Returns `None` for the root path itself (the root has no node).
    pub fn child_file_mut(
        &mut self,
        path: &Path,
        create: bool,
        observed: ClockStamp,
    ) -> Option<&mut FileNode> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        let key = self.key_for(&name);
        let dir = self.resolve_dir_mut(parent, create)?;
        if create {
            Some(
                dir.files
                    .entry(key)
                    .or_insert_with(|| FileNode::new(name, observed)),
            )
        } else {
            dir.files.get_mut(&key)
        }
    }

    /// Read-side lookup of one node.
    #[must_use]
    pub fn lookup(&self, path: &Path) -> Option<NodeView> {
        let parent = path.parent()?;
        let key = self.key_for(&path.file_name()?.to_string_lossy());
        let dir = self.resolve_dir(parent)?;
        let node = dir.files.get(&key)?;
        Some(NodeView {
            exists: node.exists,
            stat: node.stat,
            observed: node.observed,
        })
    }

    /// Mark every node under `path` deleted, stamping the given clock.
    ///
    /// Only descends into subdirectories when `recursive` is set; the
    /// non-recursive form marks just the immediate children.
    pub fn mark_dir_deleted(&mut self, path: &Path, observed: ClockStamp, recursive: bool) {
        if let Some(dir) = self.resolve_dir_mut(path, false) {
            mark_dir_deleted_node(dir, observed, recursive);
        }
    }

    /// Remove nodes that have been deleted for at least `age`, pruning
    /// subtrees whose metadata node is reclaimed. Returns the reclaimed
    /// node count.
    pub fn age_out(&mut self, age: Duration, now: SystemTime) -> usize {
        let cutoff = now.checked_sub(age);
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let reclaimed = age_out_node(&mut self.root, cutoff);
        if reclaimed > 0 {
            debug!(reclaimed, "aged out deleted nodes");
        }
        reclaimed
    }

    /// Paths of nodes observed strictly after `tick`, in no particular
    /// order.
    #[must_use]
    pub fn paths_changed_since(&self, tick: u64) -> Vec<PathBuf> {
        let mut out = Vec::new();
        collect_changed(&self.root, &self.root_path, tick, &mut out, |k| {
            self.key_for(k)
        });
        out
    }

    /// Number of nodes currently marked existing.
    #[must_use]
    pub fn file_count(&self) -> usize {
        count_existing(&self.root)
    }
}

/// Fold a child name into its map key for the given sensitivity.
pub(crate) fn fold_name(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_owned()
    } else {
        name.to_lowercase()
    }
}

fn mark_dir_deleted_node(dir: &mut DirNode, observed: ClockStamp, recursive: bool) {
    for file in dir.files.values_mut() {
        if file.exists {
            file.exists = false;
            file.maybe_deleted = false;
            file.observed = observed;
        }
    }
    if recursive {
        for sub in dir.dirs.values_mut() {
            mark_dir_deleted_node(sub, observed, true);
        }
    }
}

fn age_out_node(dir: &mut DirNode, cutoff: SystemTime) -> usize {
    let mut reclaimed = 0;
    dir.files.retain(|_, file| {
        let stale = !file.exists && file.observed.at <= cutoff;
        if stale {
            reclaimed += 1;
        }
        !stale
    });
    for sub in dir.dirs.values_mut() {
        reclaimed += age_out_node(sub, cutoff);
    }
    // A subtree survives only while its metadata node does.
    dir.dirs.retain(|key, _| dir.files.contains_key(key));
    reclaimed
}

fn collect_changed(
    dir: &DirNode,
    dir_path: &Path,
    tick: u64,
    out: &mut Vec<PathBuf>,
    key_for: impl Fn(&str) -> String + Copy,
) {
    for file in dir.files.values() {
        if file.observed.ticks > tick {
            out.push(dir_path.join(file.name()));
        }
        if file.is_dir()
            && let Some(sub) = dir.dirs.get(&key_for(file.name()))
        {
            collect_changed(sub, &dir_path.join(file.name()), tick, out, key_for);
        }
    }
}

fn count_existing(dir: &DirNode) -> usize {
    dir.files.values().filter(|f| f.exists).count()
        + dir.dirs.values().map(count_existing).sum::<usize>()
}
