//! Backing metadata to kernel attributes.

use std::fs::{FileType as StdFileType, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Preferred I/O size reported in attributes.
pub const BLOCK_SIZE: u32 = 4096;

/// Maps a std file type onto the kernel's file types.
pub fn fuser_type_of(file_type: &StdFileType) -> fuser::FileType {
    if file_type.is_dir() {
        fuser::FileType::Directory
    } else if file_type.is_symlink() {
        fuser::FileType::Symlink
    } else if file_type.is_block_device() {
        fuser::FileType::BlockDevice
    } else if file_type.is_char_device() {
        fuser::FileType::CharDevice
    } else if file_type.is_fifo() {
        fuser::FileType::NamedPipe
    } else if file_type.is_socket() {
        fuser::FileType::Socket
    } else {
        fuser::FileType::RegularFile
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(u64::from(nsecs))
    }
}

/// Attributes of a backing entry, reported under our own inode number.
pub fn metadata_to_attr(meta: &Metadata, ino: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: fuser_type_of(&meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_file_attr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"12345").unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        let attr = metadata_to_attr(&meta, 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(attr.blksize, BLOCK_SIZE);
        assert!(attr.mtime > UNIX_EPOCH);
    }

    #[test]
    fn test_directory_attr() {
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::symlink_metadata(dir.path()).unwrap();
        let attr = metadata_to_attr(&meta, 1);
        assert_eq!(attr.kind, fuser::FileType::Directory);
        assert!(attr.nlink >= 2);
    }

    #[test]
    fn test_symlink_attr() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert_eq!(fuser_type_of(&meta.file_type()), fuser::FileType::Symlink);
    }

    #[test]
    fn test_negative_timestamp() {
        let t = timestamp(-1, 500_000_000);
        assert!(t < UNIX_EPOCH);
    }
}
