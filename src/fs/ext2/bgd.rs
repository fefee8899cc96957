//! The Block Group Descriptor Table: one [`BlockGroupDescriptor`] per block group, packed
//! contiguously in the block(s) immediately following the superblock's block.

use crate::blockdev::BlockDevice;
use crate::errno::EResult;
use crate::fs::ext2::superblock::Superblock;
use bytemuck::{Pod, Zeroable};

/// Size in bytes of one on-disk block group descriptor.
pub const BGD_SIZE: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BlockGroupDescriptor {
    pub block_usage_bitmap: u32,
    pub inode_usage_bitmap: u32,
    pub inode_table: u32,
    pub unallocated_blocks: u16,
    pub unallocated_inodes: u16,
    pub directories: u16,
    _padding: u16,
    _reserved: [u8; 12],
}

impl BlockGroupDescriptor {
    /// Byte offset of the BGDT: the block right after the one containing the superblock.
    fn table_offset(sb: &Superblock) -> u64 {
        let block_size = sb.block_size() as u64;
        // The superblock always lives in block 1 for a 1 KiB block size, and block 0 otherwise;
        // the BGDT immediately follows.
        if block_size == 1024 {
            2 * block_size
        } else {
            block_size
        }
    }

    /// Reads the descriptor for block group `index`.
    pub fn read(dev: &mut dyn BlockDevice, sb: &Superblock, index: u32) -> EResult<Self> {
        let off = Self::table_offset(sb) + index as u64 * BGD_SIZE as u64;
        let mut buf = [0u8; BGD_SIZE];
        dev.read_at(&mut buf, off)?;
        Ok(*bytemuck::from_bytes(&buf))
    }

    /// Writes back the descriptor for block group `index`.
    pub fn write(&self, dev: &mut dyn BlockDevice, sb: &Superblock, index: u32) -> EResult<()> {
        let off = Self::table_offset(sb) + index as u64 * BGD_SIZE as u64;
        dev.write_at(bytemuck::bytes_of(self), off)
    }
}
