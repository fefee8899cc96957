//! A tiny mkfs: builds a minimal, valid, single-block-group ext2 image directly in memory, for
//! tests that need a real filesystem without shipping a prebuilt image file.

use crate::blockdev::{BlockDevice, MemBlockDevice};
use crate::fs::ext2::bgd::BlockGroupDescriptor;
use crate::fs::ext2::dirent::init_empty_dir;
use crate::fs::ext2::inode::{Ext2Inode, EXT2_S_IFDIR};
use crate::fs::ext2::superblock::{Superblock, EXT2_MAGIC, SUPERBLOCK_OFFSET};
use crate::fs::ext2::ROOT_INODE;
use bytemuck::Zeroable;

/// Builds a `total_blocks`-block, single-group image of the given block size, containing just an
/// empty root directory (inode 2, holding `.` and `..`). Inode 1, conventionally reserved for bad
/// block tracking, is marked used but never populated.
pub fn format_image(total_blocks: u32, block_size: u32) -> MemBlockDevice {
    assert!(
        matches!(block_size, 1024 | 2048 | 4096),
        "unsupported test block size"
    );
    let inodes_per_group: u32 = 64;
    let mut dev = MemBlockDevice::new(total_blocks as usize * block_size as usize);

    let block_size_shift = match block_size {
        1024 => 0,
        2048 => 1,
        4096 => 2,
        _ => unreachable!(),
    };
    // The allocator's block-number skew is unconditional; see `alloc::first_data_block`.
    let first_data_block = 1u32;

    // Fixed layout, starting at the first data block: BGDT, block bitmap, inode bitmap, inode
    // table, then the free pool.
    let bgdt_block = first_data_block;
    let block_bitmap = bgdt_block + 1;
    let inode_bitmap = block_bitmap + 1;
    let inode_table = inode_bitmap + 1;
    let inode_table_blocks = ((inodes_per_group as u64 * 128).div_ceil(block_size as u64)) as u32;
    let first_free_block = inode_table + inode_table_blocks;
    assert!(
        first_free_block < total_blocks,
        "test image too small for its own metadata"
    );

    let mut sb: Superblock = Zeroable::zeroed();
    sb.total_inodes = inodes_per_group;
    sb.total_blocks = total_blocks;
    sb.total_unallocated_blocks = total_blocks - first_free_block;
    sb.total_unallocated_inodes = inodes_per_group - 2;
    sb.superblock_block = if block_size == 1024 { 1 } else { 0 };
    sb.block_size_shift = block_size_shift;
    sb.fragment_size_shift = block_size_shift;
    sb.blocks_per_group = total_blocks;
    sb.fragments_per_group = total_blocks;
    sb.inodes_per_group = inodes_per_group;
    sb.signature = EXT2_MAGIC;
    sb.major_version = 1;
    sb.inode_size = 128;
    sb.first_non_reserved_inode = 11;

    let mut bgd: BlockGroupDescriptor = Zeroable::zeroed();
    bgd.block_usage_bitmap = block_bitmap;
    bgd.inode_usage_bitmap = inode_bitmap;
    bgd.inode_table = inode_table;
    bgd.unallocated_blocks = (total_blocks - first_free_block) as u16;
    bgd.unallocated_inodes = (inodes_per_group - 2) as u16;
    bgd.directories = 1;

    dev.write_at(bytemuck::bytes_of(&sb), SUPERBLOCK_OFFSET).unwrap();
    bgd.write(&mut dev, &sb, 0).unwrap();

    // Inodes 1 (reserved) and 2 (root) are used; everything past them is free.
    let mut inode_bitmap_block = vec![0u8; block_size as usize];
    inode_bitmap_block[0] = 0b0000_0011;
    dev.write_at(&inode_bitmap_block, inode_bitmap as u64 * block_size as u64)
        .unwrap();

    // Every block up to `first_free_block` is metadata, not free pool.
    let used_blocks = (first_free_block - first_data_block) as usize;
    let mut block_bitmap_block = vec![0u8; block_size as usize];
    for bit in 0..used_blocks {
        block_bitmap_block[bit / 8] |= 1 << (bit % 8);
    }
    dev.write_at(&block_bitmap_block, block_bitmap as u64 * block_size as u64)
        .unwrap();

    let mut root_inode: Ext2Inode = Zeroable::zeroed();
    root_inode.type_perm = EXT2_S_IFDIR | 0o755;
    root_inode.hard_links_count = 2;
    init_empty_dir(&mut dev, &mut sb, &mut root_inode, ROOT_INODE, ROOT_INODE).unwrap();
    root_inode.write(&mut dev, &sb, ROOT_INODE).unwrap();

    // `init_empty_dir` allocated the root's first data block through the ordinary allocator,
    // which updated `sb`'s free counts in place; persist that updated superblock.
    dev.write_at(bytemuck::bytes_of(&sb), SUPERBLOCK_OFFSET).unwrap();

    dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext2::Ext2Fs;
    use crate::fs::{FilesystemOps, NodeOps};

    #[test]
    fn formatted_image_mounts_and_exposes_empty_root() {
        let dev = format_image(256, 1024);
        let fs = Ext2Fs::mount(Box::new(dev), false).unwrap();
        let root = fs.root().unwrap();
        let stat = root.stat().unwrap();
        assert_eq!(stat.file_type, crate::fs::FileType::Directory);
        assert_eq!(stat.ino, ROOT_INODE);
    }
}
