//! Common fixtures for handler-level integration tests.
#![allow(dead_code)]

use mediafs_fuse::access::{
    AccessControl, AccessError, AccessResult, Caller, DirAccessKind, DirectoryListing,
    FileOpenDecision, LookupHints,
};
use mediafs_fuse::config::MediaFsConfig;
use mediafs_fuse::session::FuseSession;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// An ordinary app, subject to the access collaborator.
pub const APP: Caller = Caller {
    uid: 10_057,
    gid: 10_057,
    pid: 4321,
};

/// The shell identity, which skips the collaborator.
pub const SHELL: Caller = Caller {
    uid: 2000,
    gid: 2000,
    pid: 99,
};

pub const O_RDONLY: i32 = libc::O_RDONLY;
pub const O_RDWR: i32 = libc::O_RDWR;

pub fn lenient_config() -> MediaFsConfig {
    MediaFsConfig {
        strict_protocol_checks: false,
        node_tracking: true,
        ..Default::default()
    }
}

/// Scriptable access collaborator.
#[derive(Default)]
pub struct ScriptedPolicy {
    pub redaction: Mutex<Vec<u64>>,
    pub deny_dir: Mutex<Option<(DirAccessKind, i32)>>,
    pub deny_delete: Mutex<Option<i32>>,
    pub deny_open: Mutex<Option<i32>>,
    pub listing: Mutex<Option<DirectoryListing>>,
    pub listing_fault: Mutex<bool>,
    pub hints: Mutex<Option<(String, LookupHints)>>,
    pub opens: AtomicUsize,
}

impl ScriptedPolicy {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AccessControl for ScriptedPolicy {
    fn check_directory_access(&self, _path: &str, _caller: &Caller, kind: DirAccessKind) -> i32 {
        match *self.deny_dir.lock() {
            Some((denied, errno)) if denied == kind => errno,
            _ => 0,
        }
    }

    fn delete_file(&self, _path: &str, _caller: &Caller) -> i32 {
        (*self.deny_delete.lock()).unwrap_or(0)
    }

    fn on_file_open(
        &self,
        _path: &str,
        _caller: &Caller,
        _for_write: bool,
    ) -> AccessResult<FileOpenDecision> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.deny_open.lock() {
            return Err(AccessError::Denied(status));
        }
        Ok(FileOpenDecision {
            redaction_offsets: self.redaction.lock().clone(),
            ..Default::default()
        })
    }

    fn directory_entries(&self, _path: &str, _caller: &Caller) -> AccessResult<DirectoryListing> {
        if *self.listing_fault.lock() {
            return Err(AccessError::Fault("listing service died".to_string()));
        }
        Ok(self
            .listing
            .lock()
            .clone()
            .unwrap_or(DirectoryListing::UnknownPath))
    }

    fn lookup_hints(&self, path: &str, _caller: &Caller) -> LookupHints {
        match &*self.hints.lock() {
            Some((suffix, hints)) if path.ends_with(suffix.as_str()) => hints.clone(),
            _ => LookupHints::default(),
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub policy: Arc<ScriptedPolicy>,
    pub session: FuseSession,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = Arc::new(ScriptedPolicy::default());
        let session = FuseSession::new(lenient_config(), dir.path(), policy.clone())
            .expect("session");
        Fixture {
            dir,
            policy,
            session,
        }
    }

    pub fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write_backing(&self, rel: &str, contents: &[u8]) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, contents).expect("write");
    }

    pub fn exists(&self, rel: &str) -> bool {
        Path::exists(&self.path(rel))
    }
}
