//! `fuser::Filesystem` adapter.
//!
//! Each callback copies what it needs out of the request and hands the work
//! to the tokio blocking pool, which replies from its worker thread. fuser
//! replies are `Send`, so every request is answered exactly once from
//! wherever it finishes.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::access::Caller;
use crate::session::FuseSession;

/// Kernel attribute and entry cache timeout. The backing store changes
/// out-of-band, so this stays short and fixed.
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(10);

/// Kernel-facing side of a [`FuseSession`].
pub struct MediaFs {
    session: Arc<FuseSession>,
    runtime: Handle,
}

impl MediaFs {
    /// Wraps `session`; requests run on `runtime`'s blocking pool.
    pub fn new(session: Arc<FuseSession>, runtime: Handle) -> Self {
        Self { session, runtime }
    }

    /// The session requests are dispatched to.
    pub fn session(&self) -> &Arc<FuseSession> {
        &self.session
    }

    fn dispatch<F>(&self, work: F)
    where
        F: FnOnce(&FuseSession) + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        self.runtime.spawn_blocking(move || work(&session));
    }
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller::new(req.uid(), req.gid(), req.pid())
}

/// Entry names must be UTF-8; anything else is refused with EINVAL.
fn utf8_name(name: &OsStr) -> Option<String> {
    let utf8 = name.to_str().map(str::to_string);
    if utf8.is_none() {
        warn!("rejecting non UTF-8 name {:?}", name);
    }
    utf8
}

impl Filesystem for MediaFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let max_write = self.session.config().max_write;
        if let Err(nearest) = config.set_max_write(max_write) {
            warn!("max_write {} refused, kernel suggests {}", max_write, nearest);
            let _ = config.set_max_write(nearest);
        }
        if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_ASYNC_READ) {
            debug!("kernel lacks capabilities {:#x}", unsupported);
        }
        info!("mediafs init, serving {}", self.session.root_path());
        Ok(())
    }

    fn destroy(&mut self) {
        self.session.destroy();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("lookup parent={} name={}", parent, name);
            match session.lookup(parent, &name, &caller) {
                Ok(entry) => reply.entry(
                    &CACHE_TIMEOUT,
                    &entry.attr,
                    entry.generation,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.dispatch(move |session| {
            debug!("forget ino={} nlookup={}", ino, nlookup);
            session.forget(ino, nlookup);
        });
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        let batch: Vec<(u64, u64)> = nodes.iter().map(|n| (n.nodeid, n.nlookup)).collect();
        self.dispatch(move |session| {
            debug!("batch_forget count={}", batch.len());
            session.forget_multi(&batch);
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch(move |session| {
            debug!("getattr ino={}", ino);
            match session.getattr(ino, fh) {
                Ok(attr) => reply.attr(&CACHE_TIMEOUT, &attr),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.dispatch(move |session| {
            debug!(
                "setattr ino={} size={:?} mode={:?} uid={:?} gid={:?}",
                ino, size, mode, uid, gid
            );
            match session.setattr(ino, size, atime, mtime, fh) {
                Ok(attr) => reply.attr(&CACHE_TIMEOUT, &attr),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("mknod parent={} name={} mode={:o}", parent, name, mode);
            match session.mknod(parent, &name, mode, rdev, &caller) {
                Ok(entry) => reply.entry(
                    &CACHE_TIMEOUT,
                    &entry.attr,
                    entry.generation,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("mkdir parent={} name={} mode={:o}", parent, name, mode);
            match session.mkdir(parent, &name, &caller) {
                Ok(entry) => reply.entry(
                    &CACHE_TIMEOUT,
                    &entry.attr,
                    entry.generation,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("unlink parent={} name={}", parent, name);
            match session.unlink(parent, &name, &caller) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("rmdir parent={} name={}", parent, name);
            match session.rmdir(parent, &name, &caller) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (utf8_name(name), utf8_name(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!(
                "rename parent={} name={} -> newparent={} newname={} flags={:#x}",
                parent, name, newparent, newname, flags
            );
            match session.rename(parent, &name, newparent, &newname, flags, &caller) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("open ino={} flags={:#x}", ino, flags);
            match session.open(ino, flags, &caller) {
                Ok(opened) => reply.opened(opened.fh, opened.flags),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.dispatch(move |session| {
            debug!("read ino={} fh={} offset={} size={}", ino, fh, offset, size);
            match session.read(fh, offset, size) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.dispatch(move |session| {
            debug!("write ino={} fh={} offset={} size={}", ino, fh, offset, data.len());
            match session.write(fh, offset, &data) {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush ino={} fh={}", ino, fh);
        match self.session.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |session| {
            debug!("release ino={} fh={}", ino, fh);
            match session.release(fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.dispatch(move |session| {
            debug!("fsync ino={} fh={} datasync={}", ino, fh, datasync);
            match session.fsync(fh, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("opendir ino={}", ino);
            match session.opendir(ino, &caller) {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("readdir ino={} fh={} offset={}", ino, fh, offset);
            let result = session.readdir(fh, offset, &caller, |entry, next| {
                reply.add(entry.ino, next, entry.kind, &entry.name)
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!("readdirplus ino={} fh={} offset={}", ino, fh, offset);
            let result = session.readdirplus(fh, offset, &caller, |entry, resolved, next| {
                reply.add(
                    resolved.ino,
                    next,
                    &entry.name,
                    &CACHE_TIMEOUT,
                    &resolved.attr,
                    resolved.generation,
                )
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dispatch(move |session| {
            debug!("releasedir ino={} fh={}", ino, fh);
            match session.releasedir(fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |session| {
            debug!("fsyncdir ino={} fh={} datasync={}", ino, fh, datasync);
            match session.fsyncdir(fh, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.dispatch(move |session| {
            debug!("statfs");
            match session.statfs() {
                Ok(s) => reply.statfs(
                    s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let caller = caller_of(req);
        self.dispatch(move |session| {
            debug!(
                "create parent={} name={} mode={:o} flags={:#x}",
                parent, name, mode, flags
            );
            match session.create(parent, &name, flags, &caller) {
                Ok((entry, opened)) => reply.created(
                    &CACHE_TIMEOUT,
                    &entry.attr,
                    entry.generation,
                    opened.fh,
                    opened.flags,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}
