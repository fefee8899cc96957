//! The ext2 filesystem driver: translates the abstract [`crate::fs::FilesystemOps`]/
//! [`crate::fs::NodeOps`] surface the VFS uses onto the on-disk ext2 layout.

pub mod alloc;
pub mod bgd;
pub mod dirent;
pub mod inode;
pub mod ops;
pub mod superblock;

#[cfg(test)]
pub mod testutil;

use crate::blockdev::BlockDevice;
use crate::errno::EResult;
use crate::fs::{FilesystemOps, FileType, Statfs, Vnode};
use ops::Ext2Node;
use std::cell::RefCell;
use std::rc::Rc;
use superblock::Superblock;

/// ext2's well-known root directory inode number.
pub const ROOT_INODE: u32 = 2;

/// State shared by every [`Ext2Node`] belonging to one mounted filesystem: the backing device and
/// the in-memory superblock, kept in sync with its on-disk copy after every allocation change.
pub(crate) struct Ext2Inner {
    pub(crate) dev: Box<dyn BlockDevice>,
    pub(crate) sb: Superblock,
    pub(crate) readonly: bool,
}

impl Ext2Inner {
    pub(crate) fn flush_superblock(&mut self) -> EResult<()> {
        self.dev
            .write_at(bytemuck::bytes_of(&self.sb), superblock::SUPERBLOCK_OFFSET)
    }
}

/// A mounted ext2 filesystem instance.
pub struct Ext2Fs {
    inner: Rc<RefCell<Ext2Inner>>,
}

impl Ext2Fs {
    /// Reads and validates the superblock of `dev`, returning a mounted instance on success.
    pub fn mount(mut dev: Box<dyn BlockDevice>, readonly: bool) -> EResult<Rc<Self>> {
        let mut buf = [0u8; superblock::SUPERBLOCK_SIZE];
        dev.read_at(&mut buf, superblock::SUPERBLOCK_OFFSET)?;
        let sb: Superblock = *bytemuck::from_bytes(&buf);
        sb.validate()?;
        log::info!(
            "mounted ext2 filesystem: {} blocks ({} free), {} inodes ({} free), {}-byte blocks",
            sb.total_blocks,
            sb.total_unallocated_blocks,
            sb.total_inodes,
            sb.total_unallocated_inodes,
            sb.block_size(),
        );
        Ok(Rc::new(Self {
            inner: Rc::new(RefCell::new(Ext2Inner { dev, sb, readonly })),
        }))
    }
}

impl FilesystemOps for Ext2Fs {
    fn root(&self) -> EResult<Rc<Vnode>> {
        let node = Ext2Node::new(self.inner.clone(), ROOT_INODE);
        // The root inode is always a directory on a valid ext2 image; a malformed image will
        // surface that as an I/O error from `stat` rather than a panic here.
        let _ = node.stat()?;
        Ok(Vnode::new(FileType::Directory, Rc::new(node)))
    }

    fn statvfs(&self) -> EResult<Statfs> {
        let inner = self.inner.borrow();
        let sb = &inner.sb;
        Ok(Statfs {
            f_bsize: sb.block_size(),
            f_frsize: sb.block_size(),
            f_blocks: sb.total_blocks as u64,
            f_bfree: sb.total_unallocated_blocks as u64,
            f_bavail: sb.total_blocks.saturating_sub(sb.superuser_blocks) as u64,
            f_files: sb.total_inodes as u64,
            f_ffree: sb.total_unallocated_inodes as u64,
            f_favail: (sb.total_inodes.saturating_sub(sb.first_non_reserved()) + 1) as u64,
            f_namemax: 256,
        })
    }

    fn is_readonly(&self) -> bool {
        self.inner.borrow().readonly
    }
}
