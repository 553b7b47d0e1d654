//! File Extent Index (§4.2): maps a file's logical block offsets onto
//! physical block runs via a B+ tree rooted inline in the `FileInode` itself.
//!
//! Grounded in `original_source/src/FileBlocks.{hpp,cpp}`. Files only ever
//! grow at the tail and shrink from the tail (there is no random-offset
//! insert), so the tree only ever grows or shrinks along its rightmost
//! spine — this module exploits that instead of implementing a general B+
//! tree insert/delete.

use crate::alloc::{BlockAddress, BlockAllocator};
use crate::error::{Error, Result};
use crate::layout::{
    BlockRange, BlockRangesInternalNode, BlockRangesLeafNode, ChildNodeReference, FileInode,
    BLOCK_RANGES_INTERNAL_MAX, BLOCK_RANGES_LEAF_MAX, FI_DIRECT, NO_NEXT_LEAF,
};
use crate::storage::{read_pod, write_pod, Storage};

/// Looks up the physical block backing logical block `logical_block`.
/// Returns `Ok(None)` only if the inode's `levels_count`/`items_count`
/// bookkeeping is inconsistent with `blocks_count` (callers should treat
/// that as corruption, not as "hole" — this filesystem has no sparse
/// files).
pub fn lookup<S: Storage>(
    storage: &mut S,
    inode: &FileInode,
    logical_block: u64,
) -> Result<Option<BlockAddress>> {
    if logical_block >= inode.header.blocks_count {
        return Ok(None);
    }
    if inode.levels_count == 0 {
        return Ok(find_in_direct_ranges(inode, inode.items_count as usize, logical_block));
    }

    let mut level = inode.levels_count;
    let mut block = find_child_indirect(inode, inode.items_count as usize, logical_block)?;
    level -= 1;
    while level > 0 {
        let node: BlockRangesInternalNode = read_pod(storage, block.absolute_address())?;
        block = find_child_internal(&node, node.items_count as usize, logical_block)?;
        level -= 1;
    }
    let leaf: BlockRangesLeafNode = read_pod(storage, block.absolute_address())?;
    Ok(find_in_leaf_ranges(&leaf, leaf.items_count as usize, logical_block))
}

fn find_in_direct_ranges(inode: &FileInode, count: usize, logical_block: u64) -> Option<BlockAddress> {
    for i in 0..count {
        let r = inode.direct_range(i);
        let start = r.file_offset;
        let end = start + r.blocks_count as u64;
        if logical_block >= start && logical_block < end {
            return Some(BlockAddress::from_index(r.block_index() + (logical_block - start)));
        }
    }
    None
}

fn find_in_leaf_ranges(leaf: &BlockRangesLeafNode, count: usize, logical_block: u64) -> Option<BlockAddress> {
    for i in 0..count {
        let r = leaf.range(i);
        let start = r.file_offset;
        let end = start + r.blocks_count as u64;
        if logical_block >= start && logical_block < end {
            return Some(BlockAddress::from_index(r.block_index() + (logical_block - start)));
        }
    }
    None
}

fn find_child_indirect(inode: &FileInode, count: usize, logical_block: u64) -> Result<BlockAddress> {
    if count == 0 {
        return Err(Error::InternalExpectationFail("empty indirect node".into()));
    }
    let mut chosen = inode.indirect_child(0).child_block_index;
    for i in 0..count {
        let c = inode.indirect_child(i);
        if c.file_offset <= logical_block {
            chosen = c.child_block_index;
        } else {
            break;
        }
    }
    Ok(BlockAddress::from_index(chosen))
}

fn find_child_internal(
    node: &BlockRangesInternalNode,
    count: usize,
    logical_block: u64,
) -> Result<BlockAddress> {
    if count == 0 {
        return Err(Error::InternalExpectationFail("empty indirect node".into()));
    }
    let mut chosen = node.child(0).child_block_index;
    for i in 0..count {
        let c = node.child(i);
        if c.file_offset <= logical_block {
            chosen = c.child_block_index;
        } else {
            break;
        }
    }
    Ok(BlockAddress::from_index(chosen))
}

/// Appends one already-allocated data block to the end of the file,
/// extending the tree (and its height, if necessary) along the rightmost
/// spine. Does not touch `inode.header.file_size`.
pub fn append<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
    data_block: BlockAddress,
) -> Result<()> {
    let logical = inode.header.blocks_count;

    if inode.levels_count == 0 {
        let n = inode.items_count as usize;
        if n > 0 {
            let mut last = inode.direct_range(n - 1);
            if can_extend(&last, data_block) {
                last.blocks_count += 1;
                inode.set_direct_range(n - 1, last);
                inode.header.blocks_count += 1;
                return Ok(());
            }
        }
        if n < FI_DIRECT {
            inode.set_direct_range(n, BlockRange::new(data_block.index(), 1, logical));
            inode.items_count += 1;
            inode.header.blocks_count += 1;
            return Ok(());
        }
        convert_direct_to_indirect(storage, allocator, inode)?;
    }

    append_indirect(storage, allocator, inode, data_block, logical)?;
    inode.header.blocks_count += 1;
    Ok(())
}

fn can_extend(last: &BlockRange, next: BlockAddress) -> bool {
    last.blocks_count < BlockRange::MAX_COUNT as u16
        && BlockAllocator::is_adjacent(
            BlockAddress::from_index(last.block_index()),
            last.blocks_count as u32,
            next,
        )
}

fn convert_direct_to_indirect<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
) -> Result<()> {
    log::trace!("file inode direct ranges full, converting to an indirect tree");
    let leaf_block = allocator.allocate_one(storage)?;
    let mut leaf = zeroed_leaf();
    let n = inode.items_count as usize;
    for i in 0..n {
        leaf.set_range(i, inode.direct_range(i));
    }
    leaf.items_count = n as u16;
    leaf.next_leaf_node = NO_NEXT_LEAF;
    write_pod(storage, leaf_block.absolute_address(), &leaf)?;

    let first_offset = if n > 0 { inode.direct_range(0).file_offset } else { 0 };
    inode.set_indirect_child(
        0,
        ChildNodeReference { child_block_index: leaf_block.index(), file_offset: first_offset },
    );
    inode.items_count = 1;
    inode.levels_count = 1;
    Ok(())
}

fn zeroed_leaf() -> BlockRangesLeafNode {
    bytemuck::Zeroable::zeroed()
}

fn zeroed_internal() -> BlockRangesInternalNode {
    bytemuck::Zeroable::zeroed()
}

fn append_indirect<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
    data_block: BlockAddress,
    logical: u64,
) -> Result<()> {
    let mut path = Vec::with_capacity(inode.levels_count as usize);
    let mut level = inode.levels_count;
    let n = inode.items_count as usize;
    let mut block = BlockAddress::from_index(inode.indirect_child(n - 1).child_block_index);
    level -= 1;
    while level > 0 {
        path.push(block);
        let node: BlockRangesInternalNode = read_pod(storage, block.absolute_address())?;
        let cn = node.items_count as usize;
        block = BlockAddress::from_index(node.child(cn - 1).child_block_index);
        level -= 1;
    }
    path.push(block);

    let leaf_block = *path.last().unwrap();
    let mut leaf: BlockRangesLeafNode = read_pod(storage, leaf_block.absolute_address())?;
    let ln = leaf.items_count as usize;
    if ln > 0 {
        let mut last = leaf.range(ln - 1);
        if can_extend(&last, data_block) {
            last.blocks_count += 1;
            leaf.set_range(ln - 1, last);
            write_pod(storage, leaf_block.absolute_address(), &leaf)?;
            return Ok(());
        }
    }
    if ln < BLOCK_RANGES_LEAF_MAX {
        leaf.set_range(ln, BlockRange::new(data_block.index(), 1, logical));
        leaf.items_count += 1;
        write_pod(storage, leaf_block.absolute_address(), &leaf)?;
        return Ok(());
    }

    let new_leaf_block = allocator.allocate_one(storage)?;
    let mut new_leaf = zeroed_leaf();
    new_leaf.set_range(0, BlockRange::new(data_block.index(), 1, logical));
    new_leaf.items_count = 1;
    new_leaf.next_leaf_node = NO_NEXT_LEAF;
    leaf.next_leaf_node = new_leaf_block.index();
    write_pod(storage, leaf_block.absolute_address(), &leaf)?;
    write_pod(storage, new_leaf_block.absolute_address(), &new_leaf)?;

    path.pop();
    propagate_new_child(storage, allocator, inode, &path, new_leaf_block, logical)
}

/// Registers `new_child` (first logical block `logical`) as a sibling of the
/// node at the end of `path`, walking upward and splitting/growing as
/// needed. `path` holds internal node addresses from outermost (closest to
/// the inode root) to innermost (closest to the leaf that just split).
fn propagate_new_child<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
    path: &[BlockAddress],
    mut new_child: BlockAddress,
    logical: u64,
) -> Result<()> {
    for &parent_block in path.iter().rev() {
        let mut node: BlockRangesInternalNode = read_pod(storage, parent_block.absolute_address())?;
        let n = node.items_count as usize;
        if n < BLOCK_RANGES_INTERNAL_MAX {
            node.set_child(
                n,
                ChildNodeReference { child_block_index: new_child.index(), file_offset: logical },
            );
            node.items_count += 1;
            write_pod(storage, parent_block.absolute_address(), &node)?;
            return Ok(());
        }
        let new_parent_block = allocator.allocate_one(storage)?;
        let mut new_parent = zeroed_internal();
        new_parent.set_child(
            0,
            ChildNodeReference { child_block_index: new_child.index(), file_offset: logical },
        );
        new_parent.items_count = 1;
        write_pod(storage, new_parent_block.absolute_address(), &new_parent)?;
        new_child = new_parent_block;
    }

    let n = inode.items_count as usize;
    if n < FI_DIRECT {
        inode.set_indirect_child(
            n,
            ChildNodeReference { child_block_index: new_child.index(), file_offset: logical },
        );
        inode.items_count += 1;
        return Ok(());
    }

    grow_height(storage, allocator, inode, new_child, logical)
}

fn grow_height<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
    new_child: BlockAddress,
    logical: u64,
) -> Result<()> {
    log::debug!("file block tree root full, growing tree to level {}", inode.levels_count + 1);
    let old_root_block = allocator.allocate_one(storage)?;
    let mut old_root = zeroed_internal();
    let n = inode.items_count as usize;
    for i in 0..n {
        old_root.set_child(i, inode.indirect_child(i));
    }
    old_root.items_count = n as u16;
    write_pod(storage, old_root_block.absolute_address(), &old_root)?;

    let first_offset = inode.indirect_child(0).file_offset;
    inode.set_indirect_child(
        0,
        ChildNodeReference { child_block_index: old_root_block.index(), file_offset: first_offset },
    );
    inode.set_indirect_child(
        1,
        ChildNodeReference { child_block_index: new_child.index(), file_offset: logical },
    );
    inode.items_count = 2;
    inode.levels_count += 1;
    Ok(())
}

/// Removes the last block of the file, releasing the physical data block
/// and collapsing empty tree nodes (including shrinking `levels_count`)
/// along the rightmost spine. Does not touch `inode.header.file_size`.
pub fn truncate_one<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
) -> Result<()> {
    if inode.header.blocks_count == 0 {
        return Err(Error::InternalExpectationFail("truncate on an empty file".into()));
    }

    if inode.levels_count == 0 {
        let n = inode.items_count as usize;
        let mut last = inode.direct_range(n - 1);
        let freed = BlockAddress::from_index(last.block_index() + last.blocks_count as u64 - 1);
        allocator.release_blocks(storage, freed, 1)?;
        last.blocks_count -= 1;
        let now_empty = last.blocks_count == 0;
        inode.set_direct_range(n - 1, last);
        if now_empty {
            inode.items_count -= 1;
        }
        inode.header.blocks_count -= 1;
        return Ok(());
    }

    let mut path = Vec::with_capacity(inode.levels_count as usize);
    let mut level = inode.levels_count;
    let n = inode.items_count as usize;
    let mut block = BlockAddress::from_index(inode.indirect_child(n - 1).child_block_index);
    level -= 1;
    while level > 0 {
        path.push(block);
        let node: BlockRangesInternalNode = read_pod(storage, block.absolute_address())?;
        let cn = node.items_count as usize;
        block = BlockAddress::from_index(node.child(cn - 1).child_block_index);
        level -= 1;
    }
    let leaf_block = block;
    let mut leaf: BlockRangesLeafNode = read_pod(storage, leaf_block.absolute_address())?;
    let ln = leaf.items_count as usize;
    let mut last = leaf.range(ln - 1);
    let freed = BlockAddress::from_index(last.block_index() + last.blocks_count as u64 - 1);
    allocator.release_blocks(storage, freed, 1)?;
    last.blocks_count -= 1;
    let leaf_now_empty = if last.blocks_count == 0 {
        leaf.set_range(ln - 1, last);
        leaf.items_count -= 1;
        leaf.items_count == 0
    } else {
        leaf.set_range(ln - 1, last);
        false
    };

    if !leaf_now_empty {
        write_pod(storage, leaf_block.absolute_address(), &leaf)?;
        inode.header.blocks_count -= 1;
        return Ok(());
    }

    allocator.release_blocks(storage, leaf_block, 1)?;
    collapse_empty_spine(storage, allocator, inode, &path)?;
    inode.header.blocks_count -= 1;
    Ok(())
}

fn collapse_empty_spine<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    inode: &mut FileInode,
    path: &[BlockAddress],
) -> Result<()> {
    for &parent_block in path.iter().rev() {
        let mut node: BlockRangesInternalNode = read_pod(storage, parent_block.absolute_address())?;
        node.items_count -= 1;
        if node.items_count > 0 {
            write_pod(storage, parent_block.absolute_address(), &node)?;
            return Ok(());
        }
        allocator.release_blocks(storage, parent_block, 1)?;
    }

    inode.items_count -= 1;
    if inode.items_count == 0 {
        inode.levels_count = 0;
    } else if inode.items_count == 1 && inode.levels_count > 1 {
        // sole remaining child becomes the new (shallower) root
        let sole = inode.indirect_child(0).child_block_index;
        let node: BlockRangesInternalNode = read_pod(storage, BlockAddress::from_index(sole).absolute_address())?;
        let cn = node.items_count as usize;
        for i in 0..cn {
            inode.set_indirect_child(i, node.child(i));
        }
        inode.items_count = node.items_count;
        inode.levels_count -= 1;
        allocator.release_blocks(storage, BlockAddress::from_index(sole), 1)?;
    }
    Ok(())
}
