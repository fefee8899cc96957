//! The error type returned by every fallible VFS and ext2 operation.
//!
//! Each variant corresponds to one of the POSIX error codes this driver is specified to surface.
//! Keeping a single flat enum rather than nested error types per module mirrors the source's
//! single `errno` space: callers match on one type regardless of which layer (VFS, ext2 driver,
//! block device) produced the failure.

use std::io;

/// The result type returned by VFS and filesystem driver operations.
pub type EResult<T> = Result<T, Errno>;

/// A POSIX-flavoured error code.
#[derive(thiserror::Error, Debug)]
pub enum Errno {
    /// `EIO`: the block device or on-disk structures could not be read/written as expected.
    #[error("EIO: input/output error")]
    Io(#[source] Option<io::Error>),
    /// `ENOENT`: no file exists at the given path/name.
    #[error("ENOENT: no such file or directory")]
    NotFound,
    /// `EINVAL`: an argument to the operation is invalid (e.g. truncating upward, `O_APPEND`).
    #[error("EINVAL: invalid argument")]
    InvalidArgument,
    /// `EROFS`: the filesystem (or the open file) is read-only.
    #[error("EROFS: read-only file system")]
    ReadOnlyFs,
    /// `ENOTDIR`: a component of the path, expected to be a directory, is not one.
    #[error("ENOTDIR: not a directory")]
    NotADirectory,
    /// `EISDIR`: the operation is not valid on a directory (or: refuses to remove a non-empty one).
    #[error("EISDIR: is a directory")]
    IsADirectory,
    /// `EEXIST`: the target name already exists.
    #[error("EEXIST: file exists")]
    AlreadyExists,
    /// `ENOSPC`: no free block or inode (or no directory slack) is available.
    #[error("ENOSPC: no space left on device")]
    NoSpace,
    /// `EACCES`: the requesting I/O context is not permitted to perform this operation.
    #[error("EACCES: permission denied")]
    PermissionDenied,
    /// `EBUSY`: the target cannot be unmounted while still referenced.
    #[error("EBUSY: device or resource busy")]
    Busy,
    /// `ESPIPE`: the file position does not make sense for this operation.
    #[error("ESPIPE: illegal seek")]
    InvalidSeek,
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Self::Io(Some(err))
    }
}

impl PartialEq for Errno {
    /// Two errors are equal when they carry the same POSIX code, regardless of any attached I/O
    /// source (tests compare against bare variants constructed without one).
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for Errno {}

/// Shorthand used throughout the driver, in the same spirit as the teacher's `errno!` macro:
/// `err!(NotFound)` instead of `Err(Errno::NotFound)`.
macro_rules! err {
    ($variant:ident) => {
        Err($crate::errno::Errno::$variant)
    };
}
pub(crate) use err;
