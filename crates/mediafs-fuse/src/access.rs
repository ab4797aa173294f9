//! Access-control collaborator interface.
//!
//! The policy itself lives outside this crate. Handlers consult it before the
//! backing syscall and before any tree mutation. Simple checks return a raw
//! status (0 allows, anything else is the errno surfaced to the kernel);
//! richer calls return [`AccessResult`].

use crate::error::FuseError;

/// Identity of the process behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Effective uid.
    pub uid: u32,
    /// Effective gid.
    pub gid: u32,
    /// Thread group id of the calling process.
    pub pid: u32,
}

impl Caller {
    /// Builds a caller from the request header fields.
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Caller { uid, gid, pid }
    }
}

/// Directory operation a caller is asking to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAccessKind {
    /// Open or list.
    ReadDir,
    /// mkdir.
    CreateDir,
    /// rmdir.
    DeleteDir,
}

/// Largest errno a reply may carry.
const MAX_ERRNO: u32 = 4095;

/// Normalizes a collaborator status to a positive errno. Negated codes are
/// accepted; anything outside `1..=4095` becomes EFAULT.
pub fn status_errno(status: i32) -> i32 {
    match status.unsigned_abs() {
        code @ 1..=MAX_ERRNO => code as i32,
        _ => libc::EFAULT,
    }
}

/// Failure of a collaborator call that returns data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// Denied with the errno to reply.
    Denied(i32),
    /// The collaborator itself failed (an exception on the far side).
    Fault(String),
}

/// Result of a data-returning collaborator call.
pub type AccessResult<T> = std::result::Result<T, AccessError>;

impl AccessError {
    /// Converts into the error replied for `path`.
    pub fn into_fuse_error(self, path: &str) -> FuseError {
        match self {
            AccessError::Denied(status) => FuseError::AccessDenied {
                path: path.to_string(),
                errno: status_errno(status),
            },
            AccessError::Fault(msg) => FuseError::CollaboratorFault { msg },
        }
    }
}

/// Outcome of a permitted open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOpenDecision {
    /// Path to open instead of the node's own path.
    pub io_path: Option<String>,
    /// Effective owner of the opened file.
    pub owner_uid: Option<u32>,
    /// Uid on whose behalf transforms run, if any.
    pub transforms_uid: Option<u32>,
    /// Flat `[start, end)` pairs to redact for this opener.
    pub redaction_offsets: Vec<u64>,
}

/// What the collaborator knows about a directory's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryListing {
    /// Names visible to the caller, in listing order.
    Entries(Vec<String>),
    /// Not indexed by the collaborator; enumerate the backing directory.
    UnknownPath,
}

/// Per-lookup hints used when a node is first created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupHints {
    /// Backing path for I/O when it differs from the node path.
    pub io_path: Option<String>,
    /// Opaque transform bits.
    pub transforms: i32,
    /// Opaque reason the transforms apply.
    pub transforms_reason: i32,
}

/// The policy consulted by every handler. Status-returning methods answer 0
/// to allow.
pub trait AccessControl: Send + Sync {
    /// Gate for opening, creating or removing a directory.
    fn check_directory_access(&self, path: &str, caller: &Caller, kind: DirAccessKind) -> i32;

    /// Gate for creating a file.
    fn insert_file(&self, _path: &str, _caller: &Caller) -> i32 {
        0
    }

    /// Gate for unlinking a file.
    fn delete_file(&self, _path: &str, _caller: &Caller) -> i32 {
        0
    }

    /// Gate for a rename of `old_path` to `new_path`.
    fn rename(&self, _old_path: &str, _new_path: &str, _caller: &Caller) -> i32 {
        0
    }

    /// Decides an open and, when allowed, how the opener sees the file.
    fn on_file_open(
        &self,
        path: &str,
        caller: &Caller,
        for_write: bool,
    ) -> AccessResult<FileOpenDecision>;

    /// Visible entries of a directory.
    fn directory_entries(&self, path: &str, caller: &Caller) -> AccessResult<DirectoryListing>;

    /// Hints applied when a node is first created by lookup.
    fn lookup_hints(&self, _path: &str, _caller: &Caller) -> LookupHints {
        LookupHints::default()
    }
}

/// Allows everything, redacts nothing and indexes no directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_directory_access(&self, _path: &str, _caller: &Caller, _kind: DirAccessKind) -> i32 {
        0
    }

    fn on_file_open(
        &self,
        _path: &str,
        _caller: &Caller,
        _for_write: bool,
    ) -> AccessResult<FileOpenDecision> {
        Ok(FileOpenDecision::default())
    }

    fn directory_entries(&self, _path: &str, _caller: &Caller) -> AccessResult<DirectoryListing> {
        Ok(DirectoryListing::UnknownPath)
    }
}
