//! Per-open state: file handles carrying a redaction snapshot, and directory
//! handles carrying a materialized listing.
//!
//! Handles are reached by fh without the tree lock, so a [`FileHandle`] is
//! immutable after construction apart from the kernel-driven file offset,
//! which lives in the backing descriptor and is never used (all I/O is
//! positional).

use crate::node::Ino;
use crate::redaction::RedactionInfo;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Access mode of an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    /// O_RDONLY.
    ReadOnly,
    /// O_WRONLY.
    WriteOnly,
    /// O_RDWR.
    ReadWrite,
}

impl OpenFlags {
    /// Whether reads are allowed.
    pub fn is_readable(&self) -> bool {
        match self {
            OpenFlags::ReadOnly | OpenFlags::ReadWrite => true,
            OpenFlags::WriteOnly => false,
        }
    }

    /// Whether writes are allowed.
    pub fn is_writable(&self) -> bool {
        match self {
            OpenFlags::WriteOnly | OpenFlags::ReadWrite => true,
            OpenFlags::ReadOnly => false,
        }
    }

    /// Decodes the access mode of raw open flags.
    pub fn from_libc(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WriteOnly,
            libc::O_RDWR => OpenFlags::ReadWrite,
            _ => OpenFlags::ReadOnly,
        }
    }
}

/// An open regular file.
#[derive(Debug)]
pub struct FileHandle {
    ino: Ino,
    file: File,
    io_path: String,
    flags: OpenFlags,
    uid: u32,
    cached: bool,
    transforms_uid: Option<u32>,
    redaction: RedactionInfo,
}

impl FileHandle {
    /// Wraps an opened backing descriptor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ino: Ino,
        file: File,
        io_path: String,
        flags: OpenFlags,
        uid: u32,
        cached: bool,
        transforms_uid: Option<u32>,
        redaction: RedactionInfo,
    ) -> Self {
        FileHandle {
            ino,
            file,
            io_path,
            flags,
            uid,
            cached,
            transforms_uid,
            redaction,
        }
    }

    /// Inode the handle was opened on.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Backing descriptor.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Path the backing descriptor was opened at.
    pub fn io_path(&self) -> &str {
        &self.io_path
    }

    /// Access mode of the open.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Effective owner the open was made for.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Whether the kernel may keep this file's pages cached.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Uid on whose behalf transforms run, if any.
    pub fn transforms_uid(&self) -> Option<u32> {
        self.transforms_uid
    }

    /// Reads `[offset, offset + size)`, serving redacted bytes as zeros.
    /// Short only at end of file.
    pub fn read(&self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let size = u64::from(size);
        if !self.redaction.overlaps(size, offset) {
            let mut buf = vec![0u8; size as usize];
            let n = read_full_at(&self.file, &mut buf, offset)?;
            buf.truncate(n);
            return Ok(buf);
        }

        let file_len = self.file.metadata()?.len();
        let available = file_len.saturating_sub(offset).min(size);
        let mut buf = vec![0u8; available as usize];
        for piece in self.redaction.split_read(offset, available) {
            if piece.is_redacted {
                continue;
            }
            let lo = (piece.start - offset) as usize;
            let hi = (piece.end() - offset) as usize;
            let n = read_full_at(&self.file, &mut buf[lo..hi], piece.start)?;
            if n < hi - lo {
                // file shrank since the length check
                buf.truncate(lo + n);
                break;
            }
        }
        Ok(buf)
    }

    /// Positional write, retried until `data` is written or the device
    /// accepts nothing more.
    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self
                .file
                .write_at(&data[written..], offset + written as u64)
            {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Flushes file data, and metadata unless `datasync`.
    pub fn fsync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }
}

/// Positional read that keeps going until `buf` is full or EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One listing slot. `ino` is a hint for plain readdir; readdirplus
/// resolves real node inodes.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Inode hint.
    pub ino: u64,
    /// Entry name.
    pub name: String,
    /// File type reported to the kernel.
    pub kind: fuser::FileType,
}

/// Inode reported for entries whose node is not known yet.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// An open directory with its listing snapshot.
#[derive(Debug)]
pub struct DirHandle {
    ino: Ino,
    uid: u32,
    dir: File,
    entries: Vec<DirEntry>,
    /// Highest offset handed to the kernel so far.
    cursor: usize,
}

impl DirHandle {
    /// Wraps an opened directory and its initial listing.
    pub fn new(ino: Ino, uid: u32, dir: File, entries: Vec<DirEntry>) -> Self {
        DirHandle {
            ino,
            uid,
            dir,
            entries,
            cursor: 0,
        }
    }

    /// Inode of the directory.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// uid that opened the directory.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Backing directory descriptor, used for fsyncdir.
    pub fn dir(&self) -> &File {
        &self.dir
    }

    /// Current listing snapshot.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Whether a read from offset 0 should re-materialize the listing.
    pub fn needs_rewind(&self, offset: i64) -> bool {
        offset == 0 && self.cursor > 0
    }

    /// Swaps in a fresh listing and resets the cursor.
    pub fn replace_entries(&mut self, entries: Vec<DirEntry>) {
        self.entries = entries;
        self.cursor = 0;
    }

    /// Entries starting at `offset`, each paired with the offset of the
    /// entry after it.
    pub fn page(&self, offset: i64) -> impl Iterator<Item = (&DirEntry, i64)> + '_ {
        let start = usize::try_from(offset).unwrap_or(0);
        self.entries
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, entry)| (entry, (i + 1) as i64))
    }

    /// Records that the kernel consumed entries up to `offset`.
    pub fn advance_to(&mut self, offset: i64) {
        let offset = usize::try_from(offset).unwrap_or(0);
        self.cursor = self.cursor.max(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn handle_with(contents: &[u8], redaction: RedactionInfo) -> FileHandle {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        FileHandle::new(
            2,
            file,
            "/tmp/x".to_string(),
            OpenFlags::ReadWrite,
            10_123,
            redaction.is_redaction_needed(),
            None,
            redaction,
        )
    }

    #[test]
    fn test_open_flags_from_libc() {
        assert_eq!(OpenFlags::from_libc(libc::O_RDONLY), OpenFlags::ReadOnly);
        assert_eq!(
            OpenFlags::from_libc(libc::O_WRONLY | libc::O_APPEND),
            OpenFlags::WriteOnly
        );
        assert_eq!(OpenFlags::from_libc(libc::O_RDWR), OpenFlags::ReadWrite);
        assert!(OpenFlags::ReadWrite.is_readable() && OpenFlags::ReadWrite.is_writable());
        assert!(!OpenFlags::WriteOnly.is_readable());
    }

    #[test]
    fn test_handle_records_open_decision() {
        let plain = handle_with(b"", RedactionInfo::none());
        assert!(plain.is_cached());
        assert_eq!(plain.uid(), 10_123);
        assert_eq!(plain.io_path(), "/tmp/x");
        assert_eq!(plain.transforms_uid(), None);

        let redacted = handle_with(b"", RedactionInfo::new(&[0, 4]).unwrap());
        assert!(!redacted.is_cached());
    }

    #[test]
    fn test_plain_read() {
        let handle = handle_with(b"hello world", RedactionInfo::none());
        assert_eq!(handle.read(6, 5).unwrap(), b"world");
        assert_eq!(handle.read(6, 100).unwrap(), b"world");
        assert!(handle.read(50, 10).unwrap().is_empty());
    }

    #[test]
    fn test_redacted_read_zero_fills() {
        let contents: Vec<u8> = (1..=50).collect();
        let redaction = RedactionInfo::new(&[1, 10, 32, 40]).unwrap();
        let handle = handle_with(&contents, redaction);

        let data = handle.read(0, 50).unwrap();
        assert_eq!(data.len(), 50);
        for (i, byte) in data.iter().enumerate() {
            let redacted = (1..10).contains(&i) || (32..40).contains(&i);
            if redacted {
                assert_eq!(*byte, 0, "byte {} should be redacted", i);
            } else {
                assert_eq!(*byte, contents[i], "byte {} should pass through", i);
            }
        }
    }

    #[test]
    fn test_redacted_read_clamped_at_eof() {
        let contents = vec![0xAAu8; 20];
        let redaction = RedactionInfo::new(&[15, 100]).unwrap();
        let handle = handle_with(&contents, redaction);
        let data = handle.read(10, 4096).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[..5], &[0xAA; 5]);
        assert_eq!(&data[5..], &[0; 5]);
    }

    #[test]
    fn test_read_outside_ranges_is_passthrough() {
        let contents = vec![7u8; 64];
        let redaction = RedactionInfo::new(&[0, 8]).unwrap();
        let handle = handle_with(&contents, redaction);
        assert_eq!(handle.read(16, 8).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn test_write_then_read() {
        let handle = handle_with(b"", RedactionInfo::none());
        assert_eq!(handle.write(0, b"abcdef").unwrap(), 6);
        assert_eq!(handle.write(3, b"XY").unwrap(), 2);
        assert_eq!(handle.read(0, 6).unwrap(), b"abcXYf");
        handle.fsync(true).unwrap();
    }

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            ino: UNKNOWN_INO,
            name: name.to_string(),
            kind: fuser::FileType::RegularFile,
        }
    }

    #[test]
    fn test_dir_handle_paging() {
        let dir = File::open(std::env::temp_dir()).unwrap();
        let mut handle = DirHandle::new(1, 0, dir, vec![entry("a"), entry("b"), entry("c")]);

        let first: Vec<_> = handle.page(0).take(2).map(|(e, off)| (e.name.clone(), off)).collect();
        assert_eq!(first, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        handle.advance_to(2);

        let rest: Vec<_> = handle.page(2).map(|(e, off)| (e.name.clone(), off)).collect();
        assert_eq!(rest, vec![("c".to_string(), 3)]);
        handle.advance_to(3);
        assert_eq!(handle.page(3).count(), 0);

        assert!(handle.needs_rewind(0));
        handle.replace_entries(vec![entry("z")]);
        assert!(!handle.needs_rewind(0));
        assert_eq!(handle.entries().len(), 1);
    }
}
