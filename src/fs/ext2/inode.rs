//! On-disk inode layout and the logical-to-physical block translation (direct pointers plus one
//! level of indirection; double and triple indirection are a non-goal this driver never reads or
//! writes).

use crate::blockdev::BlockDevice;
use crate::errno::{err, EResult};
use crate::fs::ext2::bgd::BlockGroupDescriptor;
use crate::fs::ext2::superblock::Superblock;
use bytemuck::{Pod, Zeroable};

/// Number of direct block pointers carried in every inode.
pub const DIRECT_BLOCKS: usize = 12;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Ext2Inode {
    pub type_perm: u16,
    pub uid: u16,
    pub size_low: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub hard_links_count: u16,
    pub sectors_count: u32,
    pub flags: u32,
    pub os_specific_1: u32,
    pub direct_block_ptrs: [u32; DIRECT_BLOCKS],
    pub singly_indirect_block_ptr: u32,
    pub doubly_indirect_block_ptr: u32,
    pub triply_indirect_block_ptr: u32,
    pub generation: u32,
    pub file_acl: u32,
    pub size_high: u32,
    pub fragment_addr: u32,
    pub os_specific_2: [u8; 12],
}

/// Bits of `type_perm` identifying the file type (the upper nibble of the field).
pub const EXT2_S_IFREG: u16 = 0x8000;
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFLNK: u16 = 0xa000;
const TYPE_MASK: u16 = 0xf000;

/// Byte range of the inline symlink-target area: the 12 direct block pointers plus the three
/// indirect pointers, reinterpreted as 60 raw bytes. A symlink short enough to fit here never gets
/// a data block allocated for it.
const INLINE_AREA: (usize, usize) = (40, 100);
/// Targets shorter than this many bytes are stored inline rather than in a data block.
pub const INLINE_SYMLINK_MAX: usize = 60;

impl Ext2Inode {
    pub fn size(&self) -> u64 {
        (self.size_low as u64) | ((self.size_high as u64) << 32)
    }

    pub fn set_size(&mut self, size: u64) {
        self.size_low = size as u32;
        self.size_high = (size >> 32) as u32;
    }

    pub fn file_type_bits(&self) -> u16 {
        self.type_perm & TYPE_MASK
    }

    pub fn permissions(&self) -> u16 {
        self.type_perm & 0x0fff
    }

    /// The 60-byte inline area, read as raw bytes, used to hold a symlink target short enough to
    /// skip allocating a data block.
    pub fn inline_symlink_bytes(&self) -> &[u8] {
        &bytemuck::bytes_of(self)[INLINE_AREA.0..INLINE_AREA.1]
    }

    /// Zeroes the inline area and copies `target` into its head. Panics if `target` does not fit
    /// (callers check against [`INLINE_SYMLINK_MAX`] first).
    pub fn set_inline_symlink(&mut self, target: &[u8]) {
        assert!(target.len() < INLINE_SYMLINK_MAX);
        let area = &mut bytemuck::bytes_of_mut(self)[INLINE_AREA.0..INLINE_AREA.1];
        area.fill(0);
        area[..target.len()].copy_from_slice(target);
    }

    /// Byte offset, on disk, of inode number `ino` (1-based, per ext2 convention: inode 0 does
    /// not exist).
    pub fn offset_of(dev: &mut dyn BlockDevice, sb: &Superblock, ino: u32) -> EResult<u64> {
        if ino == 0 {
            return err!(NotFound);
        }
        let index = ino - 1;
        let group = index / sb.inodes_per_group;
        let index_in_group = index % sb.inodes_per_group;
        let bgd = BlockGroupDescriptor::read(dev, sb, group)?;
        let inode_size = sb.inode_size() as u64;
        let block_size = sb.block_size() as u64;
        let table_off = bgd.inode_table as u64 * block_size;
        Ok(table_off + index_in_group as u64 * inode_size)
    }

    pub fn read(dev: &mut dyn BlockDevice, sb: &Superblock, ino: u32) -> EResult<Self> {
        let off = Self::offset_of(dev, sb, ino)?;
        let mut buf = [0u8; std::mem::size_of::<Ext2Inode>()];
        dev.read_at(&mut buf, off)?;
        Ok(*bytemuck::from_bytes(&buf))
    }

    pub fn write(&self, dev: &mut dyn BlockDevice, sb: &Superblock, ino: u32) -> EResult<()> {
        let off = Self::offset_of(dev, sb, ino)?;
        dev.write_at(bytemuck::bytes_of(self), off)
    }

    /// Translates a logical block index within the file to a physical block number, consulting
    /// the single indirect block when the index falls past the direct pointers. Returns `Ok(0)`
    /// for a hole (an allocated-but-unwritten logical block, which this driver never produces but
    /// tolerates on read as all-zero).
    pub fn logical_to_physical(
        &self,
        dev: &mut dyn BlockDevice,
        sb: &Superblock,
        logical: u32,
    ) -> EResult<u32> {
        let logical = logical as usize;
        if logical < DIRECT_BLOCKS {
            return Ok(self.direct_block_ptrs[logical]);
        }
        let indirect_index = logical - DIRECT_BLOCKS;
        let ptrs_per_block = sb.block_size() as usize / 4;
        if indirect_index >= ptrs_per_block {
            // Beyond what a single level of indirection can address; this driver's Non-goal.
            return err!(InvalidArgument);
        }
        if self.singly_indirect_block_ptr == 0 {
            return Ok(0);
        }
        let mut entry = [0u8; 4];
        let off =
            self.singly_indirect_block_ptr as u64 * sb.block_size() as u64 + indirect_index as u64 * 4;
        dev.read_at(&mut entry, off)?;
        Ok(u32::from_le_bytes(entry))
    }
}
