//! Handler errors and their errno mapping.

use thiserror::Error;

/// Error of any handler; [`to_errno`](FuseError::to_errno) gives the reply code.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Backing syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing syscall made through nix failed.
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Mounting or serving failed.
    #[error("Mount failed at {mountpoint}: {reason}")]
    MountFailed {
        /// Target that failed.
        mountpoint: String,
        /// What went wrong.
        reason: String,
    },

    /// Unknown or freed inode.
    #[error("Inode not found: {ino}")]
    NotFound {
        /// The inode asked for.
        ino: u64,
    },

    /// Unknown or closed handle.
    #[error("Bad file handle: {fh}")]
    BadHandle {
        /// The handle asked for.
        fh: u64,
    },

    /// Refused by the access collaborator.
    #[error("Access denied for {path} (errno {errno})")]
    AccessDenied {
        /// Path the request named.
        path: String,
        /// Positive errno to reply.
        errno: i32,
    },

    /// A directory operation on something else.
    #[error("Not a directory: {ino}")]
    NotDirectory {
        /// The offending inode.
        ino: u64,
    },

    /// No inode numbers left.
    #[error("Inode space exhausted")]
    InodeSpaceExhausted,

    /// The access collaborator failed or returned garbage.
    #[error("Collaborator failure: {msg}")]
    CollaboratorFault {
        /// Details.
        msg: String,
    },

    /// The kernel broke the request protocol.
    #[error("Protocol violation: {msg}")]
    ProtocolViolation {
        /// Details.
        msg: String,
    },

    /// Malformed request argument.
    #[error("Invalid argument: {msg}")]
    InvalidArgument {
        /// Details.
        msg: String,
    },
}

/// Result of a handler.
pub type Result<T> = std::result::Result<T, FuseError>;

impl FuseError {
    /// Positive errno replied to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FuseError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FuseError::Sys(errno) => *errno as i32,
            FuseError::MountFailed { .. } => ENOENT,
            FuseError::NotFound { .. } => ENOENT,
            FuseError::BadHandle { .. } => EBADF,
            FuseError::AccessDenied { errno, .. } => *errno,
            FuseError::NotDirectory { .. } => ENOTDIR,
            FuseError::InodeSpaceExhausted => ENOMEM,
            FuseError::CollaboratorFault { .. } => EFAULT,
            FuseError::ProtocolViolation { .. } => EIO,
            FuseError::InvalidArgument { .. } => EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = FuseError::NotFound { ino: 42 };
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_access_denied_passes_code_through() {
        let err = FuseError::AccessDenied {
            path: "/data/media/0/Android/data".to_string(),
            errno: libc::EACCES,
        };
        assert_eq!(err.to_errno(), libc::EACCES);

        let err = FuseError::AccessDenied {
            path: "/x".to_string(),
            errno: libc::EPERM,
        };
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_exhaustion_is_out_of_resources() {
        assert_eq!(FuseError::InodeSpaceExhausted.to_errno(), libc::ENOMEM);
    }

    #[test]
    fn test_collaborator_fault_errno() {
        let err = FuseError::CollaboratorFault {
            msg: "listing".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EFAULT);
    }

    #[test]
    fn test_bad_handle_errno() {
        assert_eq!(FuseError::BadHandle { fh: 9 }.to_errno(), libc::EBADF);
    }

    #[test]
    fn test_io_error_keeps_raw_code() {
        let err = FuseError::from(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_sys_error_keeps_errno() {
        let err = FuseError::from(nix::Error::EROFS);
        assert_eq!(err.to_errno(), libc::EROFS);
    }

    #[test]
    fn test_io_error_without_code_is_eio() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "custom");
        assert_eq!(FuseError::Io(io_err).to_errno(), libc::EIO);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            FuseError::NotFound { ino: 1 },
            FuseError::BadHandle { fh: 2 },
            FuseError::NotDirectory { ino: 3 },
            FuseError::InodeSpaceExhausted,
            FuseError::ProtocolViolation {
                msg: "underflow".to_string(),
            },
            FuseError::InvalidArgument {
                msg: "bad arg".to_string(),
            },
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(!msg.is_empty(), "{:?} renders empty", err);
        }
    }
}
