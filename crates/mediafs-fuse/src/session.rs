//! Per-mount state shared by every request.
//!
//! A [`FuseSession`] owns the node tree (behind one non-reentrant mutex), the
//! open handle tables and the access collaborator. Handlers lock the tree
//! only to read or mutate structure and never across a backing syscall.

use crate::access::{AccessControl, Caller, LookupHints};
use crate::attr::metadata_to_attr;
use crate::config::MediaFsConfig;
use crate::error::{FuseError, Result};
use crate::handle::{DirHandle, FileHandle};
use crate::node::{Ino, Transforms, ROOT_INO};
use crate::tree::NodeTree;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reply payload for lookup-style operations.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Inode of the entry.
    pub ino: Ino,
    /// Generation paired with the inode.
    pub generation: u64,
    /// Attributes of the backing file.
    pub attr: fuser::FileAttr,
}

/// State of one mount: the node tree, the open handles and the access
/// policy. Shared by every worker; see [`operations`](crate::operations) for
/// the handlers.
pub struct FuseSession {
    config: MediaFsConfig,
    root_path: String,
    tree: Mutex<NodeTree>,
    pub(crate) handles: DashMap<u64, Arc<FileHandle>>,
    pub(crate) dir_handles: DashMap<u64, Arc<Mutex<DirHandle>>>,
    next_fh: AtomicU64,
    pub(crate) access: Arc<dyn AccessControl>,
}

impl FuseSession {
    /// `source` is the backing directory; its path names the root node.
    pub fn new(
        config: MediaFsConfig,
        source: &Path,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self> {
        let root_path = source
            .to_str()
            .ok_or_else(|| FuseError::InvalidArgument {
                msg: format!("source path {} is not UTF-8", source.display()),
            })?
            .to_string();
        if !root_path.starts_with('/') {
            return Err(FuseError::InvalidArgument {
                msg: format!("source path {} is not absolute", root_path),
            });
        }
        let root_path = match root_path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        let tree = NodeTree::new(&root_path, config.tree_options());
        Ok(FuseSession {
            config,
            root_path,
            tree: Mutex::new(tree),
            handles: DashMap::new(),
            dir_handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            access,
        })
    }

    /// Startup configuration.
    pub fn config(&self) -> &MediaFsConfig {
        &self.config
    }

    /// Backing path of the root node.
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Runs `f` under the tree lock. Handles stripped off freed nodes are
    /// closed after the lock is dropped.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut NodeTree) -> R) -> R {
        let (result, orphans) = {
            let mut tree = self.tree.lock();
            let result = f(&mut tree);
            (result, tree.take_orphans())
        };
        for fh in orphans.handles {
            if self.handles.remove(&fh).is_some() {
                debug!("closed orphaned handle {}", fh);
            }
        }
        for fh in orphans.dir_handles {
            if self.dir_handles.remove(&fh).is_some() {
                debug!("closed orphaned dir handle {}", fh);
            }
        }
        result
    }

    pub(crate) fn bypasses(&self, caller: &Caller) -> bool {
        self.config.is_bypass(caller.uid)
    }

    pub(crate) fn allocate_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Path of `ino` as seen through the mount.
    pub(crate) fn path_of(&self, ino: Ino) -> Result<String> {
        self.with_tree(|tree| {
            tree.resolve(ino)?;
            tree.build_path(ino)
        })
    }

    /// Path used for backing I/O: the node's override if it has one.
    pub(crate) fn backing_path_of(&self, ino: Ino) -> Result<String> {
        self.with_tree(|tree| {
            let node = tree.resolve(ino)?;
            match node.io_path() {
                Some(io_path) => Ok(io_path.to_string()),
                None => tree.build_path(ino),
            }
        })
    }

    /// Finds the live child or creates it, taking one reference either way.
    pub(crate) fn materialize(&self, parent: Ino, name: &str, hints: LookupHints) -> Result<Ino> {
        self.with_tree(|tree| {
            match tree.lookup_child_by_name(parent, name, true, hints.transforms) {
                Some(ino) => Ok(ino),
                None => tree.create(
                    parent,
                    name,
                    hints.io_path,
                    Transforms::new(hints.transforms, hints.transforms_reason),
                ),
            }
        })
    }

    pub(crate) fn entry_for(&self, ino: Ino, meta: &std::fs::Metadata) -> Result<Entry> {
        let generation = self.with_tree(|tree| tree.resolve(ino).map(|node| node.generation()))?;
        Ok(Entry {
            ino,
            generation,
            attr: metadata_to_attr(meta, ino),
        })
    }

    /// Resolves `name` under `parent` against the backing store and hands
    /// out one reference to its node.
    pub fn lookup(&self, parent: Ino, name: &str, caller: &Caller) -> Result<Entry> {
        let path = child_path(&self.path_of(parent)?, name);
        let meta = std::fs::symlink_metadata(&path)?;
        let hints = if self.bypasses(caller) {
            LookupHints::default()
        } else {
            self.access.lookup_hints(&path, caller)
        };
        let meta = match &hints.io_path {
            Some(io_path) => std::fs::symlink_metadata(io_path)?,
            None => meta,
        };
        let ino = self.materialize(parent, name, hints)?;
        self.entry_for(ino, &meta)
    }

    /// Drops `nlookup` kernel references. Unknown inodes are ignored: the
    /// node may already have been torn down.
    pub fn forget(&self, ino: Ino, nlookup: u64) {
        self.with_tree(|tree| {
            if tree.node(ino).is_none() {
                debug!("forget of vanished inode {}", ino);
                return;
            }
            if let Err(e) = tree.release(ino, nlookup) {
                warn!("forget({}, {}) failed: {}", ino, nlookup, e);
            }
        })
    }

    /// Batch form of [`forget`](Self::forget); unknown inodes are skipped.
    pub fn forget_multi(&self, batch: &[(Ino, u64)]) {
        self.with_tree(|tree| {
            for &(ino, nlookup) in batch {
                if tree.node(ino).is_none() {
                    debug!("forget of vanished inode {}", ino);
                    continue;
                }
                if let Err(e) = tree.release(ino, nlookup) {
                    warn!("forget({}, {}) failed: {}", ino, nlookup, e);
                }
            }
        })
    }

    /// Tears the session down: frees every node and closes every handle.
    pub fn destroy(&self) {
        let freed = self.with_tree(|tree| tree.delete_tree(ROOT_INO));
        let files = self.handles.len();
        let dirs = self.dir_handles.len();
        self.handles.clear();
        self.dir_handles.clear();
        info!(
            "session destroyed: {} nodes freed, {} handles and {} dir handles closed",
            freed, files, dirs
        );
    }

    /// Live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.with_tree(|tree| tree.len())
    }

    /// Open file handles.
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Open directory handles.
    pub fn open_dir_handle_count(&self) -> usize {
        self.dir_handles.len()
    }

    /// `None` once the node is freed.
    pub fn refcount(&self, ino: Ino) -> Option<u64> {
        self.with_tree(|tree| tree.node(ino).map(|node| node.refcount()))
    }

    /// Whether `ino` was unlinked; `None` once freed.
    pub fn is_deleted(&self, ino: Ino) -> Option<bool> {
        self.with_tree(|tree| tree.node(ino).map(|node| node.is_deleted()))
    }

    /// Absolute backing path of `ino`.
    pub fn node_path(&self, ino: Ino) -> Option<String> {
        self.with_tree(|tree| tree.build_path(ino).ok())
    }

    /// Inode at an absolute backing path, if it is in the tree.
    pub fn lookup_path(&self, path: &str) -> Option<Ino> {
        self.with_tree(|tree| tree.lookup_absolute_path(path))
    }
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
