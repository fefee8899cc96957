//! Block and inode allocation: bitmap scan/set/clear plus the logical-to-physical block pointer
//! bookkeeping inodes need when growing or shrinking.
//!
//! Block numbering carries an unconditional "+1" skew: bit 0 of group 0's block bitmap names
//! block 1, never block 0. This is a deliberate workaround preserved from the source (it predates
//! and is independent of block size) to avoid a known interaction with Linux's free-list
//! bookkeeping; every allocated block number must reflect it. Inode numbering carries its own,
//! unconditional "+1": inode 0 does not exist, so bit 0 of the inode bitmap names inode 1.

use crate::blockdev::BlockDevice;
use crate::errno::{err, EResult};
use crate::fs::ext2::bgd::BlockGroupDescriptor;
use crate::fs::ext2::inode::{Ext2Inode, DIRECT_BLOCKS};
use crate::fs::ext2::superblock::Superblock;

/// The first data block number, i.e. the allocator's unconditional "+1" skew.
pub fn first_data_block(_sb: &Superblock) -> u32 {
    1
}

fn test_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

fn find_free_bit(bitmap: &[u8], limit: usize) -> Option<usize> {
    (0..limit).find(|&bit| !test_bit(bitmap, bit))
}

fn zero_block(dev: &mut dyn BlockDevice, sb: &Superblock, block: u32) -> EResult<()> {
    let block_size = sb.block_size() as usize;
    let zeroes = vec![0u8; block_size];
    dev.write_at(&zeroes, block as u64 * block_size as u64)
}

/// Allocates and zeroes a free data block, returning its physical block number.
pub fn alloc_block(dev: &mut dyn BlockDevice, sb: &mut Superblock) -> EResult<u32> {
    let groups = sb.block_group_count();
    let block_size = sb.block_size() as usize;
    for group in 0..groups {
        let mut bgd = BlockGroupDescriptor::read(dev, sb, group)?;
        if bgd.unallocated_blocks == 0 {
            continue;
        }
        let bitmap_off = bgd.block_usage_bitmap as u64 * block_size as u64;
        let mut bitmap = vec![0u8; block_size];
        dev.read_at(&mut bitmap, bitmap_off)?;
        let bits_in_group = sb.blocks_per_group as usize;
        let bit = match find_free_bit(&bitmap, bits_in_group) {
            Some(bit) => bit,
            None => continue,
        };
        set_bit(&mut bitmap, bit);
        dev.write_at(&bitmap, bitmap_off)?;
        bgd.unallocated_blocks -= 1;
        bgd.write(dev, sb, group)?;
        sb.total_unallocated_blocks -= 1;
        let block = group * sb.blocks_per_group + bit as u32 + first_data_block(sb);
        zero_block(dev, sb, block)?;
        log::debug!("allocated block {block} in group {group} (bit {bit})");
        return Ok(block);
    }
    err!(NoSpace)
}

/// Releases a previously allocated data block. Freeing block `0` (a hole / unset pointer) is a
/// no-op, so callers can free every direct/indirect slot unconditionally.
pub fn free_block(dev: &mut dyn BlockDevice, sb: &mut Superblock, block: u32) -> EResult<()> {
    if block == 0 {
        return Ok(());
    }
    let adjusted = block - first_data_block(sb);
    let group = adjusted / sb.blocks_per_group;
    let bit = (adjusted % sb.blocks_per_group) as usize;
    let mut bgd = BlockGroupDescriptor::read(dev, sb, group)?;
    let block_size = sb.block_size() as usize;
    let bitmap_off = bgd.block_usage_bitmap as u64 * block_size as u64;
    let mut bitmap = vec![0u8; block_size];
    dev.read_at(&mut bitmap, bitmap_off)?;
    clear_bit(&mut bitmap, bit);
    dev.write_at(&bitmap, bitmap_off)?;
    bgd.unallocated_blocks += 1;
    bgd.write(dev, sb, group)?;
    sb.total_unallocated_blocks += 1;
    log::debug!("freed block {block} in group {group} (bit {bit})");
    Ok(())
}

/// Allocates a free inode, marking it as a directory's in the block group descriptor when
/// `directory` is set (this drives the `directories` count `statvfs`/`df -i`-style tools read).
pub fn alloc_inode(dev: &mut dyn BlockDevice, sb: &mut Superblock, directory: bool) -> EResult<u32> {
    let groups = sb.block_group_count();
    let block_size = sb.block_size() as usize;
    for group in 0..groups {
        let mut bgd = BlockGroupDescriptor::read(dev, sb, group)?;
        if bgd.unallocated_inodes == 0 {
            continue;
        }
        let bitmap_off = bgd.inode_usage_bitmap as u64 * block_size as u64;
        let mut bitmap = vec![0u8; block_size];
        dev.read_at(&mut bitmap, bitmap_off)?;
        let bits_in_group = sb.inodes_per_group as usize;
        let bit = match find_free_bit(&bitmap, bits_in_group) {
            Some(bit) => bit,
            None => continue,
        };
        set_bit(&mut bitmap, bit);
        dev.write_at(&bitmap, bitmap_off)?;
        bgd.unallocated_inodes -= 1;
        if directory {
            bgd.directories += 1;
        }
        bgd.write(dev, sb, group)?;
        sb.total_unallocated_inodes -= 1;
        let ino = group * sb.inodes_per_group + bit as u32 + 1;
        log::debug!("allocated inode {ino} in group {group} (bit {bit})");
        return Ok(ino);
    }
    err!(NoSpace)
}

/// Releases a previously allocated inode.
pub fn free_inode(
    dev: &mut dyn BlockDevice,
    sb: &mut Superblock,
    ino: u32,
    directory: bool,
) -> EResult<()> {
    let index = ino - 1;
    let group = index / sb.inodes_per_group;
    let bit = (index % sb.inodes_per_group) as usize;
    let mut bgd = BlockGroupDescriptor::read(dev, sb, group)?;
    let block_size = sb.block_size() as usize;
    let bitmap_off = bgd.inode_usage_bitmap as u64 * block_size as u64;
    let mut bitmap = vec![0u8; block_size];
    dev.read_at(&mut bitmap, bitmap_off)?;
    clear_bit(&mut bitmap, bit);
    dev.write_at(&bitmap, bitmap_off)?;
    bgd.unallocated_inodes += 1;
    if directory {
        bgd.directories = bgd.directories.saturating_sub(1);
    }
    bgd.write(dev, sb, group)?;
    sb.total_unallocated_inodes += 1;
    log::debug!("freed inode {ino} in group {group} (bit {bit})");
    Ok(())
}

/// Attaches a freshly allocated block to `inode` at logical block index `logical`, allocating the
/// single indirect block first if needed. Returns the new block's physical number.
pub fn inode_alloc_block(
    dev: &mut dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Ext2Inode,
    logical: u32,
) -> EResult<u32> {
    let block = alloc_block(dev, sb)?;
    let logical = logical as usize;
    if logical < DIRECT_BLOCKS {
        inode.direct_block_ptrs[logical] = block;
        return Ok(block);
    }
    let indirect_index = logical - DIRECT_BLOCKS;
    let ptrs_per_block = sb.block_size() as usize / 4;
    if indirect_index >= ptrs_per_block {
        free_block(dev, sb, block)?;
        return err!(InvalidArgument);
    }
    if inode.singly_indirect_block_ptr == 0 {
        match alloc_block(dev, sb) {
            Ok(indirect_block) => inode.singly_indirect_block_ptr = indirect_block,
            Err(e) => {
                free_block(dev, sb, block)?;
                return Err(e);
            }
        }
    }
    let entry_off =
        inode.singly_indirect_block_ptr as u64 * sb.block_size() as u64 + indirect_index as u64 * 4;
    dev.write_at(&block.to_le_bytes(), entry_off)?;
    Ok(block)
}

/// Detaches and frees the block at logical index `logical`, if any is attached. Returns whether
/// the single indirect block (if this index lived in it) is now entirely empty, so the caller can
/// decide to free it too.
pub fn inode_free_block(
    dev: &mut dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Ext2Inode,
    logical: u32,
) -> EResult<bool> {
    let logical = logical as usize;
    if logical < DIRECT_BLOCKS {
        let block = inode.direct_block_ptrs[logical];
        inode.direct_block_ptrs[logical] = 0;
        free_block(dev, sb, block)?;
        return Ok(false);
    }
    let indirect_index = logical - DIRECT_BLOCKS;
    if inode.singly_indirect_block_ptr == 0 {
        return Ok(false);
    }
    let block_size = sb.block_size() as usize;
    let entry_off =
        inode.singly_indirect_block_ptr as u64 * block_size as u64 + indirect_index as u64 * 4;
    let mut entry = [0u8; 4];
    dev.read_at(&mut entry, entry_off)?;
    let block = u32::from_le_bytes(entry);
    dev.write_at(&0u32.to_le_bytes(), entry_off)?;
    free_block(dev, sb, block)?;

    let mut indirect = vec![0u8; block_size];
    dev.read_at(&mut indirect, inode.singly_indirect_block_ptr as u64 * block_size as u64)?;
    let now_empty = indirect.iter().all(|&b| b == 0);
    if now_empty {
        free_block(dev, sb, inode.singly_indirect_block_ptr)?;
        inode.singly_indirect_block_ptr = 0;
    }
    Ok(now_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    fn test_sb() -> Superblock {
        let mut sb: Superblock = bytemuck::Zeroable::zeroed();
        sb.block_size_shift = 0; // 1024-byte blocks
        sb.blocks_per_group = 64;
        sb.inodes_per_group = 16;
        sb.total_blocks = 64;
        sb.total_inodes = 16;
        sb.total_unallocated_blocks = 50;
        sb.total_unallocated_inodes = 16;
        sb
    }

    fn make_bgd_at(dev: &mut MemBlockDevice, sb: &Superblock) {
        let mut bgd: BlockGroupDescriptor = bytemuck::Zeroable::zeroed();
        bgd.block_usage_bitmap = 3;
        bgd.inode_usage_bitmap = 4;
        bgd.inode_table = 5;
        bgd.unallocated_blocks = 50;
        bgd.unallocated_inodes = 16;
        bgd.write(dev, sb, 0).unwrap();
    }

    #[test]
    fn alloc_then_free_block_restores_bitmap_and_counts() {
        let mut sb = test_sb();
        let mut dev = MemBlockDevice::new(64 * 1024);
        make_bgd_at(&mut dev, &sb);

        let before_sb_free = sb.total_unallocated_blocks;
        let before_bgd = BlockGroupDescriptor::read(&mut dev, &sb, 0).unwrap();
        let before_bitmap_off = before_bgd.block_usage_bitmap as u64 * sb.block_size() as u64;
        let mut before_bitmap = vec![0u8; sb.block_size() as usize];
        dev.read_at(&mut before_bitmap, before_bitmap_off).unwrap();

        let block = alloc_block(&mut dev, &mut sb).unwrap();
        free_block(&mut dev, &mut sb, block).unwrap();

        assert_eq!(sb.total_unallocated_blocks, before_sb_free);
        let after_bgd = BlockGroupDescriptor::read(&mut dev, &sb, 0).unwrap();
        assert_eq!(after_bgd.unallocated_blocks, before_bgd.unallocated_blocks);
        let mut after_bitmap = vec![0u8; sb.block_size() as usize];
        dev.read_at(&mut after_bitmap, before_bitmap_off).unwrap();
        assert_eq!(after_bitmap, before_bitmap);
    }

    #[test]
    fn alloc_then_free_inode_restores_bitmap_and_counts() {
        let mut sb = test_sb();
        let mut dev = MemBlockDevice::new(64 * 1024);
        make_bgd_at(&mut dev, &sb);

        let before_sb_free = sb.total_unallocated_inodes;
        let ino = alloc_inode(&mut dev, &mut sb, false).unwrap();
        free_inode(&mut dev, &mut sb, ino, false).unwrap();

        assert_eq!(sb.total_unallocated_inodes, before_sb_free);
        let bgd = BlockGroupDescriptor::read(&mut dev, &sb, 0).unwrap();
        assert_eq!(bgd.unallocated_inodes, 16);
    }

    #[test]
    fn first_allocated_block_carries_the_plus_one_skew_at_1k_block_size() {
        let mut sb = test_sb();
        let mut dev = MemBlockDevice::new(64 * 1024);
        make_bgd_at(&mut dev, &sb);
        // Group 0, bit 0 is the first free bit; at a 1 KiB block size the returned block number
        // must be skewed by one past the boot sector rather than naming block 0 itself.
        let block = alloc_block(&mut dev, &mut sb).unwrap();
        assert_eq!(block, 1);
    }

    #[test]
    fn bit_helpers_round_trip() {
        let mut bitmap = vec![0u8; 8];
        assert!(!test_bit(&bitmap, 5));
        set_bit(&mut bitmap, 5);
        assert!(test_bit(&bitmap, 5));
        clear_bit(&mut bitmap, 5);
        assert!(!test_bit(&bitmap, 5));
    }

    #[test]
    fn find_free_bit_skips_set_bits() {
        let mut bitmap = vec![0u8; 1];
        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 1);
        assert_eq!(find_free_bit(&bitmap, 8), Some(2));
    }

    #[test]
    fn skew_is_unconditional_across_block_sizes() {
        let mut sb: Superblock = bytemuck::Zeroable::zeroed();
        sb.block_size_shift = 0;
        assert_eq!(first_data_block(&sb), 1);
        sb.block_size_shift = 2;
        assert_eq!(first_data_block(&sb), 1);
    }
}
