//! The block device abstraction the ext2 driver is layered on top of.
//!
//! This is an external collaborator in the sense of the spec: a byte-addressable,
//! random-access backing store. The driver issues only whole-block, block-aligned requests, but
//! the trait itself is byte-granular so a backend does not need to understand the notion of a
//! "block" at all.

use crate::errno::{EResult, Errno};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A byte-addressable random-access backing store.
///
/// A short read or write (one that transfers fewer bytes than requested without erroring) is
/// reported as an error by this trait's provided callers rather than being surfaced as a partial
/// success, since the ext2 driver never issues a request it expects to be partially satisfiable.
pub trait BlockDevice {
    /// Reads exactly `buf.len()` bytes starting at byte offset `off`.
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> EResult<()>;

    /// Writes exactly `buf.len()` bytes starting at byte offset `off`.
    fn write_at(&mut self, buf: &[u8], off: u64) -> EResult<()>;

    /// Releases any resources held by the backend (e.g. flushes and closes the underlying file).
    fn destroy(&mut self) -> EResult<()> {
        Ok(())
    }
}

/// A block device backed by a regular file: the disk image.
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    /// Opens `path` as a disk image. The file must already exist and contain a formatted image.
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> EResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> EResult<()> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(buf).map_err(|_| Errno::Io(None))
    }

    fn write_at(&mut self, buf: &[u8], off: u64) -> EResult<()> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(buf).map_err(|_| Errno::Io(None))
    }

    fn destroy(&mut self) -> EResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// An in-memory block device, used by tests and by the `ext2::testutil` image builder so that
/// filesystem tests don't depend on an external image file.
#[derive(Default)]
pub struct MemBlockDevice {
    data: Vec<u8>,
}

impl MemBlockDevice {
    /// Creates a new, zero-filled in-memory device of the given size in bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Returns the whole backing buffer, for inspection in tests.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> EResult<()> {
        let off = off as usize;
        let end = off.checked_add(buf.len()).ok_or(Errno::Io(None))?;
        if end > self.data.len() {
            return Err(Errno::Io(None));
        }
        buf.copy_from_slice(&self.data[off..end]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], off: u64) -> EResult<()> {
        let off = off as usize;
        let end = off.checked_add(buf.len()).ok_or(Errno::Io(None))?;
        if end > self.data.len() {
            return Err(Errno::Io(None));
        }
        self.data[off..end].copy_from_slice(buf);
        Ok(())
    }
}
