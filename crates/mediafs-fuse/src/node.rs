//! One entry of the mirrored namespace.
//!
//! Nodes live in the [`NodeTree`](crate::tree::NodeTree) arena and refer to
//! each other by inode number. Every field is private; the refcount and the
//! parent/child links only change through the tree's lock-protected
//! operations.

use std::collections::{BTreeMap, BTreeSet};

/// Inode number; also the node's key in the tree arena.
pub type Ino = u64;
/// Inode of the mount root.
pub const ROOT_INO: Ino = fuser::FUSE_ROOT_ID;

/// Case-folds a name the way the children index orders it (ASCII only).
pub fn fold_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Ordering key of a child: case-insensitive name, then identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ChildKey {
    folded: String,
    ino: Ino,
}

impl ChildKey {
    pub(crate) fn new(name: &str, ino: Ino) -> Self {
        ChildKey {
            folded: fold_name(name),
            ino,
        }
    }

    pub(crate) fn ino(&self) -> Ino {
        self.ino
    }

    /// Inclusive key bounds covering every child whose name folds to `name`.
    pub(crate) fn bounds(name: &str) -> (ChildKey, ChildKey) {
        let folded = fold_name(name);
        (
            ChildKey {
                folded: folded.clone(),
                ino: Ino::MIN,
            },
            ChildKey {
                folded,
                ino: Ino::MAX,
            },
        )
    }
}

/// Opaque transform description, passed through for external transform logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transforms {
    /// Transform bits.
    pub transforms: i32,
    /// Why the transforms apply.
    pub reason: i32,
}

impl Transforms {
    /// Pairs transform bits with their reason.
    pub fn new(transforms: i32, reason: i32) -> Self {
        Transforms { transforms, reason }
    }
}

/// A file or directory the kernel may hold a reference to.
#[derive(Debug)]
pub struct Node {
    ino: Ino,
    generation: u64,
    name: String,
    io_path: Option<String>,
    parent: Option<Ino>,
    children: BTreeSet<ChildKey>,
    refcount: u64,
    deleted: bool,
    /// fh -> opened in cached mode
    handles: BTreeMap<u64, bool>,
    dir_handles: BTreeSet<u64>,
    transforms: Transforms,
    transforms_complete: bool,
    has_redacted_cache: bool,
}

impl Node {
    pub(crate) fn new(
        ino: Ino,
        generation: u64,
        name: String,
        io_path: Option<String>,
        parent: Option<Ino>,
        transforms: Transforms,
    ) -> Self {
        Node {
            ino,
            generation,
            name,
            io_path,
            parent,
            children: BTreeSet::new(),
            refcount: 1,
            deleted: false,
            handles: BTreeMap::new(),
            dir_handles: BTreeSet::new(),
            transforms,
            transforms_complete: transforms.transforms == 0,
            has_redacted_cache: false,
        }
    }

    /// Stable inode number.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Generation handed out with the inode on creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last path component, or the backing root path for the root node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to do I/O on when it differs from the node path.
    pub fn io_path(&self) -> Option<&str> {
        self.io_path.as_deref()
    }

    /// Parent link; `None` only for the root.
    pub fn parent(&self) -> Option<Ino> {
        self.parent
    }

    /// Kernel lookups plus one per attached child.
    pub fn refcount(&self) -> u64 {
        self.refcount
    }

    /// Set once the name was unlinked or replaced.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Transforms recorded at creation.
    pub fn transforms(&self) -> Transforms {
        self.transforms
    }

    /// Whether pending transforms have run.
    pub fn transforms_complete(&self) -> bool {
        self.transforms_complete
    }

    /// Whether the kernel may hold redacted pages for this file.
    pub fn has_redacted_cache(&self) -> bool {
        self.has_redacted_cache
    }

    /// Children in index order.
    pub fn children(&self) -> impl Iterator<Item = Ino> + '_ {
        self.children.iter().map(ChildKey::ino)
    }

    /// Number of attached children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Open file handles on this node.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Open directory handles on this node.
    pub fn dir_handle_count(&self) -> usize {
        self.dir_handles.len()
    }

    /// Whether any open file handle runs in cached mode.
    pub fn has_cached_handle(&self) -> bool {
        self.handles.values().any(|cached| *cached)
    }

    pub(crate) fn key(&self) -> ChildKey {
        ChildKey::new(&self.name, self.ino)
    }

    pub(crate) fn child_keys(&self) -> &BTreeSet<ChildKey> {
        &self.children
    }

    pub(crate) fn insert_child(&mut self, key: ChildKey) -> bool {
        self.children.insert(key)
    }

    pub(crate) fn remove_child(&mut self, key: &ChildKey) -> bool {
        self.children.remove(key)
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<Ino>) {
        self.parent = parent;
    }

    pub(crate) fn inc_ref(&mut self, count: u64) {
        self.refcount += count;
    }

    /// Decrements and returns the new count. Caller checks for underflow.
    pub(crate) fn dec_ref(&mut self, count: u64) -> u64 {
        debug_assert!(count <= self.refcount);
        self.refcount -= count;
        self.refcount
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn set_transforms_complete(&mut self, complete: bool) {
        self.transforms_complete = complete;
    }

    pub(crate) fn set_has_redacted_cache(&mut self, value: bool) {
        self.has_redacted_cache = value;
    }

    pub(crate) fn attach_handle(&mut self, fh: u64, cached: bool) {
        self.handles.insert(fh, cached);
    }

    pub(crate) fn detach_handle(&mut self, fh: u64) -> bool {
        self.handles.remove(&fh).is_some()
    }

    pub(crate) fn attach_dir_handle(&mut self, fh: u64) {
        self.dir_handles.insert(fh);
    }

    pub(crate) fn detach_dir_handle(&mut self, fh: u64) -> bool {
        self.dir_handles.remove(&fh)
    }

    /// Strips every handle id off the node, for teardown.
    pub(crate) fn drain_handles(&mut self) -> (Vec<u64>, Vec<u64>) {
        let handles = std::mem::take(&mut self.handles).into_keys().collect();
        let dir_handles = std::mem::take(&mut self.dir_handles).into_iter().collect();
        (handles, dir_handles)
    }
}
