#![warn(missing_docs)]

//! MediaFS FUSE subsystem.
//!
//! Mirrors a backing media directory through a FUSE mount, interposing an
//! access-control collaborator and per-open redaction between the kernel and
//! the storage device.

pub mod access;
pub mod attr;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod mount;
pub mod node;
pub mod operations;
pub mod redaction;
pub mod session;
pub mod tracker;
pub mod tree;

pub use access::{AccessControl, AllowAll, Caller};
pub use config::MediaFsConfig;
pub use error::{FuseError, Result};
pub use filesystem::MediaFs;
pub use mount::{serve, MountOptions};
pub use session::{Entry, FuseSession};
