//! The ext2 superblock: the 1024-byte structure describing the whole filesystem, stored at byte
//! offset 1024 regardless of block size.

use crate::errno::{EResult, Errno};
use bytemuck::{Pod, Zeroable};

/// Offset, in bytes, of the superblock from the start of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Size, in bytes, of the on-disk superblock structure.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// The magic number identifying an ext2 filesystem.
pub const EXT2_MAGIC: u16 = 0xef53;

/// The on-disk superblock layout. Only the base (rev 0-compatible) fields this driver needs are
/// named individually; the trailing reserved area is kept as padding so the structure's size
/// matches the 1024-byte on-disk footprint exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Superblock {
    pub total_inodes: u32,
    pub total_blocks: u32,
    pub superuser_blocks: u32,
    pub total_unallocated_blocks: u32,
    pub total_unallocated_inodes: u32,
    pub superblock_block: u32,
    pub block_size_shift: u32,
    pub fragment_size_shift: u32,
    pub blocks_per_group: u32,
    pub fragments_per_group: u32,
    pub inodes_per_group: u32,
    pub last_mount_time: u32,
    pub last_write_time: u32,
    pub mount_count_since_check: u16,
    pub mounts_allowed_before_check: u16,
    pub signature: u16,
    pub fs_state: u16,
    pub error_action: u16,
    pub minor_version: u16,
    pub last_check_time: u32,
    pub check_interval: u32,
    pub creator_os: u32,
    pub major_version: u32,
    pub reserved_uid: u16,
    pub reserved_gid: u16,
    // Rev 1 extension fields. Always present in this driver's images since `testutil` always
    // writes major_version >= 1, but read defensively regardless.
    pub first_non_reserved_inode: u32,
    pub inode_size: u16,
    pub block_group_number: u16,
    pub optional_features: u32,
    pub required_features: u32,
    pub write_required_features: u32,
    pub filesystem_id: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mount_path: [u8; 64],
    pub compression_algorithms: u32,
    pub file_preallocate_blocks: u8,
    pub dir_preallocate_blocks: u8,
    _unused0: u16,
    pub journal_id: [u8; 16],
    pub journal_inode: u32,
    pub journal_dev: u32,
    pub orphan_inode_list_head: u32,
    _reserved: [u8; 788],
}

impl Superblock {
    /// Block size in bytes, derived from the shift field (the on-disk field is `log2(size) - 10`).
    pub fn block_size(&self) -> u32 {
        1024 << self.block_size_shift
    }

    /// Number of block groups, derived from total block/inode counts (the two formulas must
    /// agree; this driver takes the block-derived count as authoritative).
    pub fn block_group_count(&self) -> u32 {
        self.total_blocks.div_ceil(self.blocks_per_group)
    }

    /// Size in bytes of one on-disk inode record.
    pub fn inode_size(&self) -> u16 {
        if self.major_version >= 1 {
            self.inode_size
        } else {
            128
        }
    }

    /// The first inode number not reserved for filesystem-internal use (e.g. bad-block tracking).
    pub fn first_non_reserved(&self) -> u32 {
        if self.major_version >= 1 {
            self.first_non_reserved_inode
        } else {
            11
        }
    }

    /// Validates the fields this driver depends on, rejecting images it cannot safely drive.
    pub fn validate(&self) -> EResult<()> {
        if self.signature != EXT2_MAGIC {
            return Err(Errno::InvalidArgument);
        }
        if self.block_size_shift > 6 {
            // Block sizes beyond 64 KiB are not something any real ext2 image uses.
            return Err(Errno::InvalidArgument);
        }
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return Err(Errno::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_from_shift() {
        let mut sb: Superblock = Zeroable::zeroed();
        sb.block_size_shift = 2;
        assert_eq!(sb.block_size(), 4096);
    }

    #[test]
    fn group_count_rounds_up() {
        let mut sb: Superblock = Zeroable::zeroed();
        sb.total_blocks = 100;
        sb.blocks_per_group = 32;
        assert_eq!(sb.block_group_count(), 4);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let sb: Superblock = Zeroable::zeroed();
        assert!(sb.validate().is_err());
    }
}
