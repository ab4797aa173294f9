//! MediaFS FUSE daemon

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mediafs_fuse::access::AllowAll;
use mediafs_fuse::config::MediaFsConfig;
use mediafs_fuse::mount::{parse_mount_options, serve, MountOptions};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mediafs")]
#[command(about = "Serves a media directory through FUSE", long_about = None)]
struct Args {
    /// Backing media directory.
    source: PathBuf,

    /// Mount point.
    target: PathBuf,

    /// Already-mounted /dev/fuse descriptor inherited from the parent.
    #[arg(long)]
    fd: Option<RawFd>,

    /// JSON config file.
    #[arg(long, env = "MEDIAFS_CONFIG")]
    config: Option<PathBuf>,

    /// Comma separated mount options, e.g. `allow_other,fsname=media`.
    #[arg(short = 'o', value_parser = parse_mount_options)]
    options: Option<MountOptions>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MediaFsConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MediaFsConfig::default(),
    };
    tracing::info!("MediaFS daemon starting, config: {:?}", config);

    // SAFETY: the descriptor was opened by our parent for this process and
    // nothing else in the process refers to it.
    let fd = args.fd.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads.max(1))
        .build()?;
    runtime.block_on(serve(
        config,
        args.source,
        args.target,
        args.options.unwrap_or_default(),
        Arc::new(AllowAll),
        fd,
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("mediafs").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_minimal() {
        let args = parse(&["/data/media", "/mnt/user/0"]).unwrap();
        assert_eq!(args.source, PathBuf::from("/data/media"));
        assert_eq!(args.target, PathBuf::from("/mnt/user/0"));
        assert!(args.fd.is_none());
        assert!(args.options.is_none());
    }

    #[test]
    fn test_parse_all_flags() {
        let args = parse(&[
            "--fd",
            "7",
            "/data/media",
            "--config",
            "/etc/mediafs.json",
            "/mnt/user/0",
            "-o",
            "auto_unmount,fsname=sdcard",
        ])
        .unwrap();
        assert_eq!(args.fd, Some(7));
        assert_eq!(args.config, Some(PathBuf::from("/etc/mediafs.json")));
        let options = args.options.unwrap();
        assert!(options.auto_unmount);
        assert_eq!(options.fsname, "sdcard");
    }

    #[test]
    fn test_parse_errors() {
        let kind = |args: &[&str]| parse(args).unwrap_err().kind();
        assert_eq!(kind(&["/only-one"]), ErrorKind::MissingRequiredArgument);
        assert_eq!(kind(&["/a", "/b", "/c"]), ErrorKind::UnknownArgument);
        assert_eq!(kind(&["/a", "/b", "--fd"]), ErrorKind::InvalidValue);
        assert_eq!(kind(&["/a", "/b", "--fd", "x"]), ErrorKind::ValueValidation);
        assert_eq!(kind(&["/a", "/b", "--verbose"]), ErrorKind::UnknownArgument);
        assert_eq!(kind(&["/a", "/b", "-o", "bogus"]), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_help_is_generated() {
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
