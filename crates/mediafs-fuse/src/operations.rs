//! Request handlers, independent of the kernel transport.
//!
//! Every handler that creates or removes a name performs the backing
//! syscall first and touches the tree only once it succeeded. The tree lock
//! is never held across a syscall.

use crate::access::{
    status_errno, Caller, DirAccessKind, DirectoryListing, FileOpenDecision, LookupHints,
};
use crate::attr::{fuser_type_of, metadata_to_attr};
use crate::error::{FuseError, Result};
use crate::handle::{DirEntry, DirHandle, FileHandle, OpenFlags, UNKNOWN_INO};
use crate::node::Ino;
use crate::redaction::RedactionInfo;
use crate::session::{child_path, Entry, FuseSession};
use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE};
use fuser::{FileAttr, TimeOrNow};
use nix::sys::stat::{utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use parking_lot::Mutex;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Permission bits given to every new file, whatever the caller asked for.
pub const FILE_MODE: u32 = 0o664;
/// Permission bits given to every new directory.
pub const DIR_MODE: u32 = 0o775;

/// Open flags forwarded to the backing descriptor.
const PASSTHROUGH_FLAGS: i32 = libc::O_NOFOLLOW | libc::O_SYNC | libc::O_DSYNC;

/// Reply to a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// Handle id the kernel passes back on later calls.
    pub fh: u64,
    /// FOPEN_* reply flags.
    pub flags: u32,
}

/// statvfs figures of the backing store, in the units the kernel expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statfs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks free for unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Longest name.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

/// Turns a collaborator status into a result. Codes may arrive negated.
fn check(status: i32, path: &str) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(FuseError::AccessDenied {
            path: path.to_string(),
            errno: status_errno(status),
        })
    }
}

/// Pins the permission bits of a freshly created entry. The creation mode
/// is filtered by the process umask; this is not.
fn force_mode(path: &str, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode))
}

fn timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        Some(TimeOrNow::SpecificTime(t)) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            TimeSpec::new(d.as_secs() as i64, i64::from(d.subsec_nanos()))
        }
        Some(TimeOrNow::Now) => TimeSpec::UTIME_NOW,
        None => TimeSpec::UTIME_OMIT,
    }
}

fn is_dot(name: &str) -> bool {
    name == "." || name == ".."
}

impl FuseSession {
    pub(crate) fn file_handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(FuseError::BadHandle { fh })
    }

    pub(crate) fn dir_handle(&self, fh: u64) -> Result<Arc<Mutex<DirHandle>>> {
        self.dir_handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(FuseError::BadHandle { fh })
    }

    /// Logical path, I/O override and parent of `ino`, in one lock.
    fn describe(&self, ino: Ino) -> Result<(String, Option<String>, Ino)> {
        self.with_tree(|tree| {
            let node = tree.resolve(ino)?;
            let io_path = node.io_path().map(str::to_string);
            let parent = node.parent().unwrap_or(ino);
            Ok((tree.build_path(ino)?, io_path, parent))
        })
    }

    fn entry_after_create(&self, parent: Ino, name: &str, path: &str) -> Result<Entry> {
        let meta = fs::symlink_metadata(path)?;
        let ino = self.materialize(parent, name, LookupHints::default())?;
        self.entry_for(ino, &meta)
    }

    /// Attributes of `ino`, taken from the open descriptor when `fh` is one of
    /// its handles.
    pub fn getattr(&self, ino: Ino, fh: Option<u64>) -> Result<FileAttr> {
        if let Some(handle) = fh.and_then(|fh| self.file_handle(fh).ok()) {
            if handle.ino() == ino {
                return Ok(metadata_to_attr(&handle.file().metadata()?, ino));
            }
        }
        let path = self.backing_path_of(ino)?;
        let meta = fs::symlink_metadata(&path)?;
        Ok(metadata_to_attr(&meta, ino))
    }

    /// Applies size and timestamp changes. Mode and ownership changes are
    /// accepted and ignored.
    pub fn setattr(
        &self,
        ino: Ino,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let path = self.backing_path_of(ino)?;
        let handle = fh
            .and_then(|fh| self.file_handle(fh).ok())
            .filter(|h| h.ino() == ino && h.flags().is_writable());

        if let Some(size) = size {
            match &handle {
                Some(h) => h.file().set_len(size)?,
                None => OpenOptions::new().write(true).open(&path)?.set_len(size)?,
            }
        }
        if atime.is_some() || mtime.is_some() {
            utimensat(
                None,
                path.as_str(),
                &timespec(atime),
                &timespec(mtime),
                UtimensatFlags::NoFollowSymlink,
            )?;
        }
        self.getattr(ino, fh)
    }

    /// Creates a file, fifo or device node with [`FILE_MODE`], whatever `mode`
    /// asks for.
    pub fn mknod(
        &self,
        parent: Ino,
        name: &str,
        mode: u32,
        rdev: u32,
        caller: &Caller,
    ) -> Result<Entry> {
        let path = child_path(&self.path_of(parent)?, name);
        if !self.bypasses(caller) {
            check(self.access.insert_file(&path, caller), &path)?;
        }
        let kind = mode & libc::S_IFMT;
        if kind == 0 || kind == libc::S_IFREG {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(FILE_MODE)
                .open(&path)?;
        } else {
            nix::sys::stat::mknod(
                path.as_str(),
                SFlag::from_bits_truncate(kind),
                Mode::from_bits_truncate(FILE_MODE),
                libc::dev_t::from(rdev),
            )?;
        }
        force_mode(&path, FILE_MODE)?;
        self.entry_after_create(parent, name, &path)
    }

    /// Creates a directory with [`DIR_MODE`].
    pub fn mkdir(&self, parent: Ino, name: &str, caller: &Caller) -> Result<Entry> {
        let path = child_path(&self.path_of(parent)?, name);
        if !self.bypasses(caller) {
            check(
                self.access
                    .check_directory_access(&path, caller, DirAccessKind::CreateDir),
                &path,
            )?;
        }
        DirBuilder::new().mode(DIR_MODE).create(&path)?;
        force_mode(&path, DIR_MODE)?;
        self.entry_after_create(parent, name, &path)
    }

    /// Removes a file name. Open handles keep working; the node is only
    /// marked deleted.
    pub fn unlink(&self, parent: Ino, name: &str, caller: &Caller) -> Result<()> {
        let path = child_path(&self.path_of(parent)?, name);
        if !self.bypasses(caller) {
            check(self.access.delete_file(&path, caller), &path)?;
        }
        fs::remove_file(&path)?;
        let tombstoned = self.with_tree(|tree| tree.set_deleted_for_child(parent, name));
        debug!("unlink {}: {} node(s) tombstoned", path, tombstoned);
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, parent: Ino, name: &str, caller: &Caller) -> Result<()> {
        let path = child_path(&self.path_of(parent)?, name);
        if !self.bypasses(caller) {
            check(
                self.access
                    .check_directory_access(&path, caller, DirAccessKind::DeleteDir),
                &path,
            )?;
        }
        fs::remove_dir(&path)?;
        let tombstoned = self.with_tree(|tree| tree.set_deleted_for_child(parent, name));
        debug!("rmdir {}: {} node(s) tombstoned", path, tombstoned);
        Ok(())
    }

    /// Renames on the backing store, then relinks the node keeping its
    /// identity. A temporary reference keeps the node alive while the lock
    /// is released for the syscall.
    pub fn rename(
        &self,
        parent: Ino,
        name: &str,
        new_parent: Ino,
        new_name: &str,
        flags: u32,
        caller: &Caller,
    ) -> Result<()> {
        if flags != 0 {
            return Err(FuseError::InvalidArgument {
                msg: format!("unsupported rename flags {:#x}", flags),
            });
        }
        let (old_path, new_path, child) = self.with_tree(|tree| -> Result<_> {
            tree.resolve(parent)?;
            tree.resolve(new_parent)?;
            let old_path = child_path(&tree.build_path(parent)?, name);
            let new_path = child_path(&tree.build_path(new_parent)?, new_name);
            let child = tree.lookup_child_by_name(parent, name, true, 0);
            Ok((old_path, new_path, child))
        })?;

        let result = self.rename_backing(&old_path, &new_path, caller);

        self.with_tree(|tree| {
            if result.is_ok() {
                match child {
                    Some(ino) => {
                        tree.set_deleted_for_rename_target(new_parent, new_name, ino);
                        if let Err(e) = tree.rename(ino, new_name, new_parent) {
                            warn!("relinking inode {} after rename failed: {}", ino, e);
                        }
                    }
                    None => {
                        tree.set_deleted_for_child(new_parent, new_name);
                    }
                }
            }
            if let Some(ino) = child {
                if let Err(e) = tree.release(ino, 1) {
                    warn!("dropping rename hold on inode {} failed: {}", ino, e);
                }
            }
        });
        result
    }

    fn rename_backing(&self, old_path: &str, new_path: &str, caller: &Caller) -> Result<()> {
        if !self.bypasses(caller) {
            check(self.access.rename(old_path, new_path, caller), old_path)?;
        }
        fs::rename(old_path, new_path)?;
        debug!("rename {} -> {}", old_path, new_path);
        Ok(())
    }

    /// Opens `ino`, snapshotting the caller's redaction ranges into the handle.
    pub fn open(&self, ino: Ino, flags: i32, caller: &Caller) -> Result<Opened> {
        let (path, io_path, _) = self.describe(ino)?;
        self.open_handle(ino, &path, io_path, flags, caller)
    }

    fn open_handle(
        &self,
        ino: Ino,
        path: &str,
        io_path: Option<String>,
        flags: i32,
        caller: &Caller,
    ) -> Result<Opened> {
        let open_flags = OpenFlags::from_libc(flags);
        let decision = if self.bypasses(caller) {
            FileOpenDecision::default()
        } else {
            self.access
                .on_file_open(path, caller, open_flags.is_writable())
                .map_err(|e| e.into_fuse_error(path))?
        };
        let redaction = RedactionInfo::new(&decision.redaction_offsets).map_err(|e| {
            FuseError::CollaboratorFault {
                msg: format!("redaction ranges for {}: {}", path, e),
            }
        })?;
        let io_path = decision
            .io_path
            .or(io_path)
            .unwrap_or_else(|| path.to_string());

        let file = OpenOptions::new()
            .read(open_flags.is_readable())
            .write(open_flags.is_writable())
            .custom_flags(flags & PASSTHROUGH_FLAGS)
            .open(&io_path)?;

        let cached = !redaction.is_redaction_needed();
        let uid = decision.owner_uid.unwrap_or(caller.uid);
        let fh = self.allocate_fh();
        let handle = FileHandle::new(
            ino,
            file,
            io_path,
            open_flags,
            uid,
            cached,
            decision.transforms_uid,
            redaction,
        );
        self.handles.insert(fh, Arc::new(handle));

        let attached = self.with_tree(|tree| -> Result<bool> {
            let node = tree.resolve(ino)?;
            let keep_cache = cached && node.has_cached_handle() && !node.has_redacted_cache();
            tree.attach_handle(ino, fh, cached)?;
            if !cached {
                tree.set_has_redacted_cache(ino, true)?;
            } else if !keep_cache {
                // The kernel drops its page cache on this open.
                tree.set_has_redacted_cache(ino, false)?;
            }
            Ok(keep_cache)
        });
        let keep_cache = match attached {
            Ok(keep_cache) => keep_cache,
            Err(e) => {
                self.handles.remove(&fh);
                return Err(e);
            }
        };

        let mut reply_flags = 0;
        if !cached || self.config().direct_io {
            reply_flags |= FOPEN_DIRECT_IO;
        } else if keep_cache {
            reply_flags |= FOPEN_KEEP_CACHE;
        }
        debug!(
            "open {} as fh {} (uid={}, cached={}, flags={:#x})",
            path, fh, uid, cached, reply_flags
        );
        Ok(Opened {
            fh,
            flags: reply_flags,
        })
    }

    /// Reads through handle `fh`; redacted bytes come back as zeros.
    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let handle = self.file_handle(fh)?;
        let offset = u64::try_from(offset).map_err(|_| FuseError::InvalidArgument {
            msg: format!("negative read offset {}", offset),
        })?;
        Ok(handle.read(offset, size)?)
    }

    /// Positional write through handle `fh`.
    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        let handle = self.file_handle(fh)?;
        let offset = u64::try_from(offset).map_err(|_| FuseError::InvalidArgument {
            msg: format!("negative write offset {}", offset),
        })?;
        let written = handle.write(offset, data)?;
        Ok(u32::try_from(written).unwrap_or(u32::MAX))
    }

    /// Nothing is buffered, so this only validates `fh`.
    pub fn flush(&self, fh: u64) -> Result<()> {
        self.file_handle(fh).map(|_| ())
    }

    /// Closes an open file. Handle lifetime is independent of the node's
    /// refcount.
    pub fn release(&self, fh: u64) -> Result<()> {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            debug!("release of closed handle {}", fh);
            return Ok(());
        };
        debug!(
            "release fh {} of {} (uid={} transforms_uid={:?} cached={})",
            fh,
            handle.io_path(),
            handle.uid(),
            handle.transforms_uid(),
            handle.is_cached()
        );
        let ino = handle.ino();
        self.with_tree(|tree| tree.detach_handle(ino, fh));
        Ok(())
    }

    /// Syncs the backing file of `fh`.
    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        Ok(self.file_handle(fh)?.fsync(datasync)?)
    }

    /// Syncs the backing directory of `fh`.
    pub fn fsyncdir(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.dir_handle(fh)?;
        let handle = handle.lock();
        if datasync {
            handle.dir().sync_data()?;
        } else {
            handle.dir().sync_all()?;
        }
        Ok(())
    }

    /// Opens a directory and materializes its listing for the caller.
    pub fn opendir(&self, ino: Ino, caller: &Caller) -> Result<u64> {
        let (path, io_path, parent) = self.describe(ino)?;
        if !self.bypasses(caller) {
            check(
                self.access
                    .check_directory_access(&path, caller, DirAccessKind::ReadDir),
                &path,
            )?;
        }
        let backing = io_path.unwrap_or_else(|| path.clone());
        let dir = File::open(&backing)?;
        if !dir.metadata()?.is_dir() {
            return Err(FuseError::NotDirectory { ino });
        }
        let entries = self.list_entries(ino, parent, &path, &backing, caller)?;

        let fh = self.allocate_fh();
        self.dir_handles.insert(
            fh,
            Arc::new(Mutex::new(DirHandle::new(ino, caller.uid, dir, entries))),
        );
        if let Err(e) = self.with_tree(|tree| tree.attach_dir_handle(ino, fh)) {
            self.dir_handles.remove(&fh);
            return Err(e);
        }
        debug!("opendir {} as fh {}", path, fh);
        Ok(fh)
    }

    fn list_entries(
        &self,
        ino: Ino,
        parent: Ino,
        path: &str,
        backing: &str,
        caller: &Caller,
    ) -> Result<Vec<DirEntry>> {
        let mut entries = vec![
            DirEntry {
                ino,
                name: ".".to_string(),
                kind: fuser::FileType::Directory,
            },
            DirEntry {
                ino: parent,
                name: "..".to_string(),
                kind: fuser::FileType::Directory,
            },
        ];
        let listing = if self.bypasses(caller) {
            DirectoryListing::UnknownPath
        } else {
            self.access
                .directory_entries(path, caller)
                .map_err(|e| e.into_fuse_error(path))?
        };

        match listing {
            DirectoryListing::Entries(names) => {
                for name in names {
                    if name.is_empty() || name.contains(['/', '\0']) {
                        return Err(FuseError::CollaboratorFault {
                            msg: format!("unreadable entry name in listing of {}", path),
                        });
                    }
                    if is_dot(&name) {
                        continue;
                    }
                    let kind = fs::symlink_metadata(child_path(backing, &name))
                        .map(|m| fuser_type_of(&m.file_type()))
                        .unwrap_or(fuser::FileType::RegularFile);
                    entries.push(DirEntry {
                        ino: UNKNOWN_INO,
                        name,
                        kind,
                    });
                }
            }
            DirectoryListing::UnknownPath => {
                for dirent in fs::read_dir(backing)? {
                    let dirent = dirent?;
                    let Ok(name) = dirent.file_name().into_string() else {
                        warn!("skipping non UTF-8 entry in {}", backing);
                        continue;
                    };
                    let kind = dirent
                        .file_type()
                        .map(|t| fuser_type_of(&t))
                        .unwrap_or(fuser::FileType::RegularFile);
                    entries.push(DirEntry {
                        ino: UNKNOWN_INO,
                        name,
                        kind,
                    });
                }
            }
        }
        Ok(entries)
    }

    fn rewind(&self, handle: &mut DirHandle, caller: &Caller) -> Result<()> {
        let ino = handle.ino();
        let (path, io_path, parent) = self.describe(ino)?;
        let backing = io_path.unwrap_or_else(|| path.clone());
        let entries = self.list_entries(ino, parent, &path, &backing, caller)?;
        handle.replace_entries(entries);
        Ok(())
    }

    /// Feeds entries from `offset` to `add` until it reports a full buffer.
    /// An entry refused by `add` is not consumed.
    pub fn readdir<F>(&self, fh: u64, offset: i64, caller: &Caller, mut add: F) -> Result<()>
    where
        F: FnMut(&DirEntry, i64) -> bool,
    {
        let handle = self.dir_handle(fh)?;
        let mut handle = handle.lock();
        if handle.needs_rewind(offset) {
            self.rewind(&mut handle, caller)?;
        }
        let mut consumed = None;
        for (entry, next) in handle.page(offset) {
            if add(entry, next) {
                break;
            }
            consumed = Some(next);
        }
        if let Some(next) = consumed {
            handle.advance_to(next);
        }
        Ok(())
    }

    /// Like [`readdir`](Self::readdir), with a full entry per name. Every
    /// entry other than `.` and `..` carries a lookup reference, which is
    /// dropped again if `add` refuses it.
    pub fn readdirplus<F>(&self, fh: u64, offset: i64, caller: &Caller, mut add: F) -> Result<()>
    where
        F: FnMut(&DirEntry, &Entry, i64) -> bool,
    {
        let handle = self.dir_handle(fh)?;
        let mut handle = handle.lock();
        if handle.needs_rewind(offset) {
            self.rewind(&mut handle, caller)?;
        }
        let dir_ino = handle.ino();
        let mut consumed = None;
        for (entry, next) in handle.page(offset) {
            let dot = is_dot(&entry.name);
            let resolved = if dot {
                self.backing_path_of(entry.ino)
                    .and_then(|p| fs::symlink_metadata(p).map_err(FuseError::from))
                    .and_then(|meta| self.entry_for(entry.ino, &meta))
            } else {
                self.lookup(dir_ino, &entry.name, caller)
            };
            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!("readdirplus: skipping {}: {}", entry.name, e);
                    consumed = Some(next);
                    continue;
                }
            };
            if add(entry, &resolved, next) {
                if !dot {
                    self.forget(resolved.ino, 1);
                }
                break;
            }
            consumed = Some(next);
        }
        if let Some(next) = consumed {
            handle.advance_to(next);
        }
        Ok(())
    }

    /// Closes a directory handle.
    pub fn releasedir(&self, fh: u64) -> Result<()> {
        let Some((_, handle)) = self.dir_handles.remove(&fh) else {
            debug!("releasedir of closed handle {}", fh);
            return Ok(());
        };
        let (ino, uid) = {
            let handle = handle.lock();
            (handle.ino(), handle.uid())
        };
        debug!("releasedir fh {} of inode {} (uid={})", fh, ino, uid);
        self.with_tree(|tree| tree.detach_dir_handle(ino, fh));
        Ok(())
    }

    /// Space figures of the backing source directory.
    pub fn statfs(&self) -> Result<Statfs> {
        let stat = nix::sys::statvfs::statvfs(self.root_path())?;
        Ok(Statfs {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    /// Creates a regular file and opens it in one step.
    pub fn create(
        &self,
        parent: Ino,
        name: &str,
        flags: i32,
        caller: &Caller,
    ) -> Result<(Entry, Opened)> {
        let path = child_path(&self.path_of(parent)?, name);
        if !self.bypasses(caller) {
            check(self.access.insert_file(&path, caller), &path)?;
        }
        // An existing file keeps its mode; only a new one is pinned.
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(FILE_MODE)
            .open(&path)
        {
            Ok(_) => force_mode(&path, FILE_MODE)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && flags & libc::O_EXCL == 0 => {
                OpenOptions::new()
                    .write(true)
                    .truncate(flags & libc::O_TRUNC != 0)
                    .open(&path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let entry = self.entry_after_create(parent, name, &path)?;
        match self.open_handle(entry.ino, &path, None, flags, caller) {
            Ok(opened) => Ok((entry, opened)),
            Err(e) => {
                self.forget(entry.ino, 1);
                Err(e)
            }
        }
    }
}
