//! Mounting and serving.
//!
//! [`serve`] takes the three mount-time values (backing source, mount
//! target, optional pre-opened `/dev/fuse` descriptor) and runs the request
//! loop until the kernel unmounts or aborts the session.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::{umask, Mode};
use thiserror::Error;
use tracing::{debug, info};

use crate::access::AccessControl;
use crate::config::MediaFsConfig;
use crate::error::{FuseError, Result};
use crate::filesystem::MediaFs;
use crate::session::FuseSession;

/// Mount options for FUSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem name shown in the mount table.
    pub fsname: String,
    /// Allow other users to access.
    pub allow_other: bool,
    /// Auto unmount on exit.
    pub auto_unmount: bool,
    /// Let the kernel enforce permission bits itself.
    pub default_permissions: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            fsname: "mediafs".to_string(),
            allow_other: true,
            auto_unmount: false,
            default_permissions: false,
        }
    }
}

/// Rejected mount-time input.
#[derive(Debug, Error)]
pub enum MountError {
    /// The path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// The path exists but is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Relative paths are refused.
    #[error("Path is not absolute: {0}")]
    NotAbsolute(String),

    /// Unrecognized `-o` option.
    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

impl MountError {
    fn into_fuse_error(self, path: &Path) -> FuseError {
        FuseError::MountFailed {
            mountpoint: path.display().to_string(),
            reason: self.to_string(),
        }
    }
}

/// Both the source and the target must be absolute, existing directories.
pub fn validate_mountpoint(path: &Path) -> std::result::Result<(), MountError> {
    if !path.is_absolute() {
        return Err(MountError::NotAbsolute(path.display().to_string()));
    }
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }
    Ok(())
}

/// Parses `-o` style options, e.g. `allow_other,auto_unmount,fsname=media`.
pub fn parse_mount_options(opts_str: &str) -> std::result::Result<MountOptions, MountError> {
    let mut options = MountOptions::default();
    for opt in opts_str.split(',').map(str::trim) {
        match opt {
            "" => {}
            "allow_other" => options.allow_other = true,
            "noallow_other" => options.allow_other = false,
            "auto_unmount" => options.auto_unmount = true,
            "default_permissions" => options.default_permissions = true,
            _ => match opt.strip_prefix("fsname=") {
                Some(name) if !name.is_empty() => options.fsname = name.to_string(),
                _ => return Err(MountError::InvalidOption(opt.to_string())),
            },
        }
    }
    Ok(options)
}

/// Media storage never carries executables, devices or setuid files.
pub fn build_mount_options(opts: &MountOptions) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName(opts.fsname.clone()),
        fuser::MountOption::NoSuid,
        fuser::MountOption::NoDev,
        fuser::MountOption::NoExec,
        fuser::MountOption::NoAtime,
    ];
    if opts.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if opts.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if opts.default_permissions {
        options.push(fuser::MountOption::DefaultPermissions);
    }
    options
}

/// Serves `source` at `target` until unmounted. With `fd`, the caller has
/// already mounted and hands over the kernel channel, and `options` are
/// ignored.
pub async fn serve(
    config: MediaFsConfig,
    source: PathBuf,
    target: PathBuf,
    options: MountOptions,
    access: Arc<dyn AccessControl>,
    fd: Option<OwnedFd>,
) -> Result<()> {
    validate_mountpoint(&source).map_err(|e| e.into_fuse_error(&source))?;
    validate_mountpoint(&target).map_err(|e| e.into_fuse_error(&target))?;

    // created entries get exactly the handler modes
    let previous = umask(Mode::empty());
    debug!("cleared process umask (was {:o})", previous.bits());

    let session = Arc::new(FuseSession::new(config, &source, access)?);
    let fs = MediaFs::new(Arc::clone(&session), tokio::runtime::Handle::current());
    info!(
        "serving {} at {} ({})",
        source.display(),
        target.display(),
        if fd.is_some() { "pre-opened fd" } else { "fresh mount" }
    );

    let mount_target = target.clone();
    let run = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut fuse = match fd {
            Some(fd) => fuser::Session::from_fd(fs, fd, fuser::SessionACL::All),
            None => fuser::Session::new(fs, &mount_target, &build_mount_options(&options))?,
        };
        fuse.run()
    });

    match run.await {
        Ok(Ok(())) => {
            info!("unmounted {}", target.display());
            Ok(())
        }
        Ok(Err(e)) => Err(FuseError::MountFailed {
            mountpoint: target.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) => Err(FuseError::MountFailed {
            mountpoint: target.display().to_string(),
            reason: format!("session thread failed: {}", e),
        }),
    }
}
