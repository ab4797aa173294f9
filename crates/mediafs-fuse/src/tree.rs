//! The node arena and every structural operation on it.
//!
//! A [`NodeTree`] owns all nodes keyed by inode number. `parent` and
//! `children` are inode references into the arena, so there are no owning
//! cycles. The session keeps the whole tree behind a single mutex; every
//! method here assumes that lock is held (`&mut self`).
//!
//! Refcounting mirrors the kernel lookup count: creation counts as the first
//! lookup, every linked child holds one reference on its parent, and the root
//! holds one extra reference on itself. A node is freed exactly when its count
//! reaches zero, and freeing a child may free its parent in turn. That cascade
//! runs as an iterative worklist, so the lock never needs to be reentrant.

use crate::error::{FuseError, Result};
use crate::node::{ChildKey, Ino, Node, Transforms, ROOT_INO};
use crate::tracker::NodeTracker;
use std::collections::HashMap;
use tracing::{debug, error};

const FIRST_INO: Ino = ROOT_INO + 1;
/// Inode numbers are never reused and stay within u32.
const MAX_INO: Ino = u32::MAX as Ino;

/// Behavior switches of a [`NodeTree`].
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Panic on protocol violations instead of logging them.
    pub strict: bool,
    /// Keep the live-node registry.
    pub node_tracking: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            strict: cfg!(debug_assertions),
            node_tracking: cfg!(debug_assertions),
        }
    }
}

/// Handle ids stripped off nodes that were freed. The session closes them
/// once the tree lock is dropped.
#[derive(Debug, Default)]
pub struct Orphans {
    /// Open file handles.
    pub handles: Vec<u64>,
    /// Open directory handles.
    pub dir_handles: Vec<u64>,
}

impl Orphans {
    /// Whether there is nothing to close.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.dir_handles.is_empty()
    }
}

/// Every node the kernel may refer to, keyed by inode.
pub struct NodeTree {
    nodes: HashMap<Ino, Node>,
    tracker: NodeTracker,
    next_ino: Ino,
    generation: u64,
    strict: bool,
    orphans: Orphans,
}

impl NodeTree {
    /// Creates the tree with its root named `root_path`. The root starts with
    /// a refcount of 2: its creation reference plus a permanent self-hold.
    pub fn new(root_path: &str, options: TreeOptions) -> Self {
        let mut tree = NodeTree {
            nodes: HashMap::new(),
            tracker: NodeTracker::new(options.node_tracking),
            next_ino: FIRST_INO,
            generation: 0,
            strict: options.strict,
            orphans: Orphans::default(),
        };
        tree.generation += 1;
        let mut root = Node::new(
            ROOT_INO,
            tree.generation,
            root_path.to_string(),
            None,
            None,
            Transforms::default(),
        );
        root.inc_ref(1);
        tree.tracker.track(ROOT_INO);
        tree.nodes.insert(ROOT_INO, root);
        debug!("CREATE root {}", root_path);
        tree
    }

    /// Inode of the root node.
    pub fn root(&self) -> Ino {
        ROOT_INO
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True only once the root itself was freed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Live-node registry.
    pub fn tracker(&self) -> &NodeTracker {
        &self.tracker
    }

    /// Generation of the most recently created node.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Node by inode, without the tracking check of [`resolve`](Self::resolve).
    pub fn node(&self, ino: Ino) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    /// Resolves an inode number received from the kernel.
    pub fn resolve(&self, ino: Ino) -> Result<&Node> {
        if !self.tracker.check_tracked(ino) {
            self.violation(&format!("inode {} is not tracked", ino));
            return Err(FuseError::NotFound { ino });
        }
        self.nodes.get(&ino).ok_or(FuseError::NotFound { ino })
    }

    /// Creates a child of `parent` with refcount 1, holding one reference on
    /// the parent.
    pub fn create(
        &mut self,
        parent: Ino,
        name: &str,
        io_path: Option<String>,
        transforms: Transforms,
    ) -> Result<Ino> {
        validate_name(name)?;
        if !self.nodes.contains_key(&parent) {
            return Err(FuseError::NotFound { ino: parent });
        }
        let ino = self.allocate_ino()?;
        self.generation += 1;

        if let Some(p) = self.nodes.get_mut(&parent) {
            p.insert_child(ChildKey::new(name, ino));
            p.inc_ref(1);
        }
        let node = Node::new(
            ino,
            self.generation,
            name.to_string(),
            io_path,
            Some(parent),
            transforms,
        );
        self.nodes.insert(ino, node);
        self.tracker.track(ino);
        debug!("CREATE node {} name={} parent={}", ino, name, parent);
        Ok(ino)
    }

    fn allocate_ino(&mut self) -> Result<Ino> {
        if self.next_ino > MAX_INO {
            error!("inode space exhausted, refusing to create nodes");
            return Err(FuseError::InodeSpaceExhausted);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        Ok(ino)
    }

    /// Finds a live child matching `name` case-insensitively whose transform
    /// value equals `transforms`. Takes no reference.
    pub fn find_child(&self, parent: Ino, name: &str, transforms: i32) -> Option<Ino> {
        let node = self.nodes.get(&parent)?;
        let (lo, hi) = ChildKey::bounds(name);
        let candidates: Vec<Ino> = node
            .child_keys()
            .range(lo..=hi)
            .map(ChildKey::ino)
            .collect();
        candidates.into_iter().find(|ino| {
            self.nodes
                .get(ino)
                .is_some_and(|c| !c.is_deleted() && c.transforms().transforms == transforms)
        })
    }

    /// Like [`find_child`](Self::find_child); with `acquire`, also takes a
    /// kernel reference on the match.
    pub fn lookup_child_by_name(
        &mut self,
        parent: Ino,
        name: &str,
        acquire: bool,
        transforms: i32,
    ) -> Option<Ino> {
        let ino = self.find_child(parent, name, transforms)?;
        if acquire {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.inc_ref(1);
            }
        }
        Some(ino)
    }

    /// Adds one kernel reference.
    pub fn acquire(&mut self, ino: Ino) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.inc_ref(1);
        Ok(())
    }

    /// Drops `count` references. Returns true if the node was freed.
    pub fn release(&mut self, ino: Ino, count: u64) -> Result<bool> {
        let refcount = self
            .nodes
            .get(&ino)
            .map(Node::refcount)
            .ok_or(FuseError::NotFound { ino })?;
        if count > refcount {
            let msg = format!(
                "release of {} on inode {} with refcount {}",
                count, ino, refcount
            );
            self.violation(&msg);
            return Err(FuseError::ProtocolViolation { msg });
        }
        if count == 0 {
            return Ok(false);
        }
        Ok(self.drop_refs(ino, count))
    }

    fn drop_refs(&mut self, ino: Ino, count: u64) -> bool {
        let remaining = match self.nodes.get_mut(&ino) {
            Some(node) => node.dec_ref(count),
            None => return false,
        };
        if remaining > 0 {
            return false;
        }

        let mut worklist = vec![ino];
        while let Some(cur) = worklist.pop() {
            if let Some(parent) = self.free_node(cur) {
                if let Some(p) = self.nodes.get_mut(&parent) {
                    if p.dec_ref(1) == 0 {
                        worklist.push(parent);
                    }
                }
            }
        }
        true
    }

    /// Removes a node from the arena, its parent's index and the tracker.
    /// Returns the former parent; dropping the parent's reference is up to
    /// the caller.
    fn free_node(&mut self, ino: Ino) -> Option<Ino> {
        let mut node = self.nodes.remove(&ino)?;
        if node.child_count() > 0 {
            self.violation(&format!(
                "freeing inode {} with {} children",
                ino,
                node.child_count()
            ));
        }
        self.tracker.untrack(ino);

        let (handles, dir_handles) = node.drain_handles();
        self.orphans.handles.extend(handles);
        self.orphans.dir_handles.extend(dir_handles);

        let parent = node.parent();
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.remove_child(&node.key());
        }
        debug!("DELETE node {} name={}", ino, node.name());
        parent
    }

    /// Moves `ino` to `new_name` under `new_parent`, keeping its identity.
    pub fn rename(&mut self, ino: Ino, new_name: &str, new_parent: Ino) -> Result<()> {
        validate_name(new_name)?;
        let (old_parent, old_key, same_name) = {
            let node = self.nodes.get(&ino).ok_or(FuseError::NotFound { ino })?;
            let Some(parent) = node.parent() else {
                return Err(FuseError::InvalidArgument {
                    msg: "cannot rename the root".to_string(),
                });
            };
            (parent, node.key(), node.name() == new_name)
        };
        if !self.nodes.contains_key(&new_parent) {
            return Err(FuseError::NotFound { ino: new_parent });
        }
        if old_parent == new_parent && same_name {
            return Ok(());
        }
        if self.is_ancestor_or_self(ino, new_parent) {
            return Err(FuseError::InvalidArgument {
                msg: format!("cannot move inode {} into its own subtree", ino),
            });
        }

        let new_key = ChildKey::new(new_name, ino);
        if old_parent == new_parent {
            // Unindex first: the key is derived from the name.
            if let Some(p) = self.nodes.get_mut(&old_parent) {
                p.remove_child(&old_key);
            }
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.set_name(new_name.to_string());
            }
            if let Some(p) = self.nodes.get_mut(&old_parent) {
                p.insert_child(new_key);
            }
        } else {
            if let Some(p) = self.nodes.get_mut(&old_parent) {
                p.remove_child(&old_key);
            }
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.set_name(new_name.to_string());
                node.set_parent(Some(new_parent));
            }
            if let Some(p) = self.nodes.get_mut(&new_parent) {
                p.insert_child(new_key);
                p.inc_ref(1);
            }
            self.drop_refs(old_parent, 1);
        }
        debug!(
            "RENAME node {} to {} under {}",
            ino, new_name, new_parent
        );
        Ok(())
    }

    fn is_ancestor_or_self(&self, ancestor: Ino, mut ino: Ino) -> bool {
        for _ in 0..=self.nodes.len() {
            if ino == ancestor {
                return true;
            }
            match self.nodes.get(&ino).and_then(Node::parent) {
                Some(parent) => ino = parent,
                None => return false,
            }
        }
        false
    }

    /// Names from the root down to `ino`, joined with `/`. A point-in-time
    /// snapshot: it may be stale as soon as the lock is released.
    pub fn build_path(&self, ino: Ino) -> Result<String> {
        let mut segments = Vec::new();
        let mut cur = ino;
        loop {
            let node = self
                .nodes
                .get(&cur)
                .ok_or(FuseError::NotFound { ino: cur })?;
            segments.push(node.name());
            match node.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
            if segments.len() > self.nodes.len() {
                let msg = format!("parent cycle above inode {}", ino);
                self.violation(&msg);
                return Err(FuseError::ProtocolViolation { msg });
            }
        }
        segments.reverse();
        Ok(join_segments(&segments))
    }

    /// Walks `path` from the root without taking references. Repeated
    /// separators collapse into one.
    pub fn lookup_absolute_path(&self, path: &str) -> Option<Ino> {
        let root = self.nodes.get(&ROOT_INO)?;
        let rest = path.strip_prefix(root.name())?;
        if !rest.is_empty() && !rest.starts_with('/') && !root.name().ends_with('/') {
            return None;
        }
        let mut cur = ROOT_INO;
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            cur = self.find_child(cur, segment, 0)?;
        }
        Some(cur)
    }

    /// Tombstones a node. It stays valid for inode-based access until its
    /// refcount drains.
    pub fn set_deleted(&mut self, ino: Ino) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.mark_deleted();
        Ok(())
    }

    /// Tombstones every live child named `name`. Returns how many.
    pub fn set_deleted_for_child(&mut self, parent: Ino, name: &str) -> usize {
        self.tombstone_children(parent, name, None)
    }

    /// Tombstones whatever currently sits at a rename destination, except
    /// the node being renamed (a case-only rename matches itself).
    pub fn set_deleted_for_rename_target(&mut self, parent: Ino, name: &str, renamed: Ino) -> usize {
        self.tombstone_children(parent, name, Some(renamed))
    }

    fn tombstone_children(&mut self, parent: Ino, name: &str, keep: Option<Ino>) -> usize {
        let Some(node) = self.nodes.get(&parent) else {
            return 0;
        };
        let (lo, hi) = ChildKey::bounds(name);
        let matches: Vec<Ino> = node
            .child_keys()
            .range(lo..=hi)
            .map(ChildKey::ino)
            .filter(|ino| Some(*ino) != keep)
            .collect();
        let mut count = 0;
        for ino in matches {
            if let Some(child) = self.nodes.get_mut(&ino) {
                if !child.is_deleted() {
                    child.mark_deleted();
                    count += 1;
                }
            }
        }
        count
    }

    /// Frees `ino` and everything below it regardless of refcounts. Used at
    /// session teardown. Returns the number of nodes freed.
    pub fn delete_tree(&mut self, ino: Ino) -> usize {
        if !self.nodes.contains_key(&ino) {
            return 0;
        }
        let mut preorder = Vec::new();
        let mut stack = vec![ino];
        while let Some(cur) = stack.pop() {
            preorder.push(cur);
            if let Some(node) = self.nodes.get(&cur) {
                stack.extend(node.children());
            }
        }

        for &cur in preorder.iter().rev() {
            let parent = self.free_node(cur);
            if cur == ino {
                if let Some(parent) = parent {
                    self.drop_refs(parent, 1);
                }
            }
        }
        preorder.len()
    }

    /// Records an open file handle on `ino`.
    pub fn attach_handle(&mut self, ino: Ino, fh: u64, cached: bool) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.attach_handle(fh, cached);
        Ok(())
    }

    /// Drops a file handle record; false if it was not attached.
    pub fn detach_handle(&mut self, ino: Ino, fh: u64) -> bool {
        self.nodes
            .get_mut(&ino)
            .is_some_and(|node| node.detach_handle(fh))
    }

    /// Records an open directory handle on `ino`.
    pub fn attach_dir_handle(&mut self, ino: Ino, fh: u64) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.attach_dir_handle(fh);
        Ok(())
    }

    /// Drops a directory handle record; false if it was not attached.
    pub fn detach_dir_handle(&mut self, ino: Ino, fh: u64) -> bool {
        self.nodes
            .get_mut(&ino)
            .is_some_and(|node| node.detach_dir_handle(fh))
    }

    /// Marks pending transforms of `ino` as done or not.
    pub fn set_transforms_complete(&mut self, ino: Ino, complete: bool) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.set_transforms_complete(complete);
        Ok(())
    }

    /// Flags whether the kernel may cache redacted pages of `ino`.
    pub fn set_has_redacted_cache(&mut self, ino: Ino, value: bool) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or(FuseError::NotFound { ino })?;
        node.set_has_redacted_cache(value);
        Ok(())
    }

    /// Child names of `ino` in index order.
    pub fn child_names(&self, ino: Ino) -> Vec<String> {
        self.nodes
            .get(&ino)
            .map(|node| {
                node.children()
                    .filter_map(|c| self.nodes.get(&c).map(|n| n.name().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hands over handles stripped from freed nodes since the last call.
    pub fn take_orphans(&mut self) -> Orphans {
        std::mem::take(&mut self.orphans)
    }

    fn violation(&self, msg: &str) {
        error!("protocol violation: {}", msg);
        if self.strict {
            panic!("protocol violation: {}", msg);
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FuseError::InvalidArgument {
            msg: format!("invalid entry name {:?}", name),
        });
    }
    Ok(())
}

fn join_segments(segments: &[&str]) -> String {
    let mut path = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(segment);
    }
    path
}
