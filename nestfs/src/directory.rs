//! Directory Index (§4.3): a B+ tree keyed by FNV-1a-32 name hash, rooted
//! inline in the `DirectoryInode`, holding variable-length leaf records.
//!
//! Grounded in `original_source/src/Directory.{hpp,cpp}`, which manipulates
//! leaf records in place with `memmove`. This module takes the idiomatic
//! Rust route instead: a leaf's records are decoded into an owned `Vec`,
//! mutated, and re-encoded — same on-storage byte layout, different
//! in-memory technique (see DESIGN.md).

use crate::alloc::{BlockAddress, BlockAllocator};
use crate::error::{Error, FileType, Result};
use crate::fnv::hash_fnv1a_32;
use crate::layout::{
    DirectoryInode, DirectoryTreeChildNodeReference, DirectoryTreeInternalNode, DirectoryTreeLeaf,
    DirectoryTreeLeafItemHeader, DIRECTORY_FLAG, DIR_INTERNAL_MAX, DIR_LEAF_ITEM_HEADER_SIZE,
    DIR_LEAF_MAX_DATA, DIR_NO_NEXT_LEAF, DI_INDIRECT_MAX,
};
use crate::storage::{read_pod, write_pod, Storage};

/// One decoded directory entry, owned so it can outlive the leaf buffer it
/// was read from.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u64,
    pub is_directory: bool,
    pub name: Vec<u8>,
}

fn record_size(name_len: usize) -> usize {
    DIR_LEAF_ITEM_HEADER_SIZE + name_len
}

fn decode_records(data: &[u8], data_size: usize) -> Vec<(u32, DirEntry)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < data_size {
        // Records are packed tight without alignment padding, so a header
        // can start at any byte offset; read it as bytes, not a typed ref.
        let header: DirectoryTreeLeafItemHeader =
            bytemuck::pod_read_unaligned(&data[offset..offset + DIR_LEAF_ITEM_HEADER_SIZE]);
        let name_start = offset + DIR_LEAF_ITEM_HEADER_SIZE;
        let name = data[name_start..name_start + header.name_size as usize].to_vec();
        let is_directory = header.inode & DIRECTORY_FLAG != 0;
        let inode = header.inode & !DIRECTORY_FLAG;
        out.push((header.name_hash, DirEntry { inode, is_directory, name }));
        offset = name_start + header.name_size as usize;
    }
    out
}

fn encode_records(records: &[(u32, DirEntry)], out: &mut [u8]) -> usize {
    let mut offset = 0usize;
    for (hash, entry) in records {
        let header = DirectoryTreeLeafItemHeader {
            inode: entry.inode | if entry.is_directory { DIRECTORY_FLAG } else { 0 },
            name_hash: *hash,
            name_size: entry.name.len() as u16,
        };
        out[offset..offset + DIR_LEAF_ITEM_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        let name_start = offset + DIR_LEAF_ITEM_HEADER_SIZE;
        out[name_start..name_start + entry.name.len()].copy_from_slice(&entry.name);
        offset = name_start + entry.name.len();
    }
    offset
}

fn total_encoded_size(records: &[(u32, DirEntry)]) -> usize {
    records.iter().map(|(_, e)| record_size(e.name.len())).sum()
}

/// Inserts `(hash, entry)` into a sorted-by-hash `Vec`, keeping collisions
/// (equal hashes) adjacent in insertion order, and returns `Err(FileExists)`
/// if an entry with the same name is already present.
fn insert_sorted(records: &mut Vec<(u32, DirEntry)>, hash: u32, entry: DirEntry) -> Result<()> {
    let mut pos = records.len();
    for (i, (h, e)) in records.iter().enumerate() {
        if *h == hash && e.name == entry.name {
            let ty = if e.is_directory { FileType::Directory } else { FileType::Regular };
            return Err(Error::FileExists(ty));
        }
        if *h > hash {
            pos = pos.min(i);
            break;
        }
    }
    records.insert(pos, (hash, entry));
    Ok(())
}

/// Splits a records list roughly in half once it grows past leaf capacity,
/// returning the right half (to be written into a freshly allocated leaf).
///
/// Never splits inside a run of equal hashes: a lookup descends by hash
/// range, so two records sharing a hash must land in the same leaf (this
/// design has no collision-spanning descend to fall back on, unlike the
/// original's neighbor-spanning lookup). Picks whichever valid boundary
/// (a hash change between adjacent records) lands closest to the middle.
/// Fails with `StorageLimitReached` if the whole leaf is one collision run
/// and no valid boundary exists at all.
fn split_if_over_capacity(records: &mut Vec<(u32, DirEntry)>) -> Result<Option<Vec<(u32, DirEntry)>>> {
    if total_encoded_size(records) <= DIR_LEAF_MAX_DATA {
        return Ok(None);
    }
    let target = records.len() / 2;
    let mid = (1..records.len())
        .filter(|&i| records[i].0 != records[i - 1].0)
        .min_by_key(|&i| i.abs_diff(target));
    match mid {
        Some(mid) => Ok(Some(records.split_off(mid))),
        None => Err(Error::StorageLimitReached),
    }
}

fn insert_child_sorted(children: &mut Vec<(u32, u64)>, key: u32, child_block: u64) {
    let pos = children.partition_point(|(k, _)| *k <= key);
    children.insert(pos, (key, child_block));
}

fn split_children_if_over_capacity(
    children: &mut Vec<(u32, u64)>,
    capacity: usize,
) -> Option<Vec<(u32, u64)>> {
    if children.len() <= capacity {
        return None;
    }
    let mid = children.len() / 2;
    Some(children.split_off(mid))
}

fn zeroed_leaf() -> DirectoryTreeLeaf {
    bytemuck::Zeroable::zeroed()
}

fn zeroed_internal() -> DirectoryTreeInternalNode {
    bytemuck::Zeroable::zeroed()
}

fn find_child_inode(dir: &DirectoryInode, count: usize, hash: u32) -> u64 {
    let mut chosen = dir.indirect_child(0).child_block_index;
    for i in 0..count {
        let c = dir.indirect_child(i);
        if c.name_hash <= hash {
            chosen = c.child_block_index;
        } else {
            break;
        }
    }
    chosen
}

fn find_child_internal(node: &DirectoryTreeInternalNode, count: usize, hash: u32) -> u64 {
    let mut chosen = node.child(0).child_block_index;
    for i in 0..count {
        let c = node.child(i);
        if c.name_hash <= hash {
            chosen = c.child_block_index;
        } else {
            break;
        }
    }
    chosen
}

/// Descends from the inode's indirect root to the leaf that would hold
/// `hash`, recording the internal node addresses visited (outermost
/// first).
fn descend<S: Storage>(
    storage: &mut S,
    dir: &DirectoryInode,
    hash: u32,
) -> Result<(Vec<BlockAddress>, BlockAddress)> {
    let mut path = Vec::new();
    let mut level = dir.levels_count;
    let n = dir.items_count_or_data_size as usize;
    let mut block = BlockAddress::from_index(find_child_inode(dir, n, hash));
    level -= 1;
    while level > 0 {
        path.push(block);
        let node: DirectoryTreeInternalNode = read_pod(storage, block.absolute_address())?;
        block = BlockAddress::from_index(find_child_internal(&node, node.items_count as usize, hash));
        level -= 1;
    }
    Ok((path, block))
}

pub fn lookup<S: Storage>(storage: &mut S, dir: &DirectoryInode, name: &[u8]) -> Result<Option<DirEntry>> {
    let hash = hash_fnv1a_32(name);
    let records = if dir.levels_count == 0 {
        decode_records(dir.direct_data(), dir.items_count_or_data_size as usize)
    } else {
        let (_, leaf_block) = descend(storage, dir, hash)?;
        let leaf: DirectoryTreeLeaf = read_pod(storage, leaf_block.absolute_address())?;
        decode_records(&leaf.data, leaf.data_size as usize)
    };
    Ok(records
        .into_iter()
        .find(|(h, e)| *h == hash && e.name == name)
        .map(|(_, e)| e))
}

pub fn iterate<S: Storage>(
    storage: &mut S,
    dir: &DirectoryInode,
    mut visitor: impl FnMut(&DirEntry) -> Result<()>,
) -> Result<()> {
    if dir.levels_count == 0 {
        for (_, e) in decode_records(dir.direct_data(), dir.items_count_or_data_size as usize) {
            visitor(&e)?;
        }
        return Ok(());
    }
    // walk to the leftmost leaf, then follow next_leaf_node chains.
    let mut level = dir.levels_count;
    let mut block = BlockAddress::from_index(dir.indirect_child(0).child_block_index);
    level -= 1;
    while level > 0 {
        let node: DirectoryTreeInternalNode = read_pod(storage, block.absolute_address())?;
        block = BlockAddress::from_index(node.child(0).child_block_index);
        level -= 1;
    }
    let mut current = Some(block);
    while let Some(b) = current {
        let leaf: DirectoryTreeLeaf = read_pod(storage, b.absolute_address())?;
        for (_, e) in decode_records(&leaf.data, leaf.data_size as usize) {
            visitor(&e)?;
        }
        current = if leaf.next_leaf_node == DIR_NO_NEXT_LEAF {
            None
        } else {
            Some(BlockAddress::from_index(leaf.next_leaf_node))
        };
    }
    Ok(())
}

pub fn insert<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    dir: &mut DirectoryInode,
    entry: DirEntry,
) -> Result<()> {
    let hash = hash_fnv1a_32(&entry.name);

    if dir.levels_count == 0 {
        let mut records = decode_records(dir.direct_data(), dir.items_count_or_data_size as usize);
        insert_sorted(&mut records, hash, entry)?;
        if total_encoded_size(&records) <= dir.direct_data().len() {
            let size = encode_records(&records, dir.direct_data_mut());
            dir.items_count_or_data_size = size as u16;
            return Ok(());
        }
        convert_inline_to_indirect(storage, allocator, dir, records)?;
        return Ok(());
    }

    let hash_for_descend = hash;
    let (path, leaf_block) = descend(storage, dir, hash_for_descend)?;
    let mut leaf: DirectoryTreeLeaf = read_pod(storage, leaf_block.absolute_address())?;
    let mut records = decode_records(&leaf.data, leaf.data_size as usize);
    insert_sorted(&mut records, hash, entry)?;

    if let Some(right) = split_if_over_capacity(&mut records)? {
        let right_min_hash = right[0].0;
        log::trace!(
            "directory leaf at {:?} split, {} records moving to a new leaf",
            leaf_block,
            right.len()
        );
        let new_leaf_block = allocator.allocate_one(storage)?;
        let mut new_leaf = zeroed_leaf();
        new_leaf.data_size = encode_records(&right, &mut new_leaf.data) as u16;
        new_leaf.next_leaf_node = leaf.next_leaf_node;
        leaf.next_leaf_node = new_leaf_block.index();
        leaf.data_size = encode_records(&records, &mut leaf.data) as u16;
        write_pod(storage, leaf_block.absolute_address(), &leaf)?;
        write_pod(storage, new_leaf_block.absolute_address(), &new_leaf)?;
        propagate_new_child(storage, allocator, dir, &path, right_min_hash, new_leaf_block)?;
    } else {
        leaf.data_size = encode_records(&records, &mut leaf.data) as u16;
        write_pod(storage, leaf_block.absolute_address(), &leaf)?;
    }
    Ok(())
}

fn convert_inline_to_indirect<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    dir: &mut DirectoryInode,
    records: Vec<(u32, DirEntry)>,
) -> Result<()> {
    let leaf_block = allocator.allocate_one(storage)?;
    let mut leaf = zeroed_leaf();
    leaf.data_size = encode_records(&records, &mut leaf.data) as u16;
    leaf.next_leaf_node = DIR_NO_NEXT_LEAF;
    write_pod(storage, leaf_block.absolute_address(), &leaf)?;

    dir.set_indirect_child(
        0,
        DirectoryTreeChildNodeReference { child_block_index: leaf_block.index(), name_hash: 0 },
    );
    dir.items_count_or_data_size = 1;
    dir.levels_count = 1;
    Ok(())
}

fn propagate_new_child<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    dir: &mut DirectoryInode,
    path: &[BlockAddress],
    mut key: u32,
    mut child: BlockAddress,
) -> Result<()> {
    for &parent_block in path.iter().rev() {
        let node: DirectoryTreeInternalNode = read_pod(storage, parent_block.absolute_address())?;
        let mut children: Vec<(u32, u64)> = (0..node.items_count as usize)
            .map(|i| {
                let c = node.child(i);
                (c.name_hash, c.child_block_index)
            })
            .collect();
        insert_child_sorted(&mut children, key, child.index());

        if let Some(right) = split_children_if_over_capacity(&mut children, DIR_INTERNAL_MAX) {
            write_internal(storage, parent_block, &children)?;
            let new_block = allocator.allocate_one(storage)?;
            key = right[0].0;
            write_internal(storage, new_block, &right)?;
            child = new_block;
            continue;
        }
        write_internal(storage, parent_block, &children)?;
        return Ok(());
    }

    let n = dir.items_count_or_data_size as usize;
    let mut children: Vec<(u32, u64)> = (0..n)
        .map(|i| {
            let c = dir.indirect_child(i);
            (c.name_hash, c.child_block_index)
        })
        .collect();
    insert_child_sorted(&mut children, key, child.index());

    if let Some(right) = split_children_if_over_capacity(&mut children, DI_INDIRECT_MAX) {
        grow_height(storage, allocator, dir, children, right)?;
    } else {
        for (i, (k, c)) in children.iter().enumerate() {
            dir.set_indirect_child(i, DirectoryTreeChildNodeReference { child_block_index: *c, name_hash: *k });
        }
        dir.items_count_or_data_size = children.len() as u16;
    }
    Ok(())
}

fn write_internal<S: Storage>(storage: &mut S, block: BlockAddress, children: &[(u32, u64)]) -> Result<()> {
    let mut node = zeroed_internal();
    for (i, (k, c)) in children.iter().enumerate() {
        node.set_child(i, DirectoryTreeChildNodeReference { child_block_index: *c, name_hash: *k });
    }
    node.items_count = children.len() as u16;
    write_pod(storage, block.absolute_address(), &node)?;
    Ok(())
}

fn grow_height<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    dir: &mut DirectoryInode,
    left: Vec<(u32, u64)>,
    right: Vec<(u32, u64)>,
) -> Result<()> {
    log::debug!("directory inode root full, growing tree to level {}", dir.levels_count + 1);
    let left_block = allocator.allocate_one(storage)?;
    let right_block = allocator.allocate_one(storage)?;
    write_internal(storage, left_block, &left)?;
    write_internal(storage, right_block, &right)?;

    dir.set_indirect_child(
        0,
        DirectoryTreeChildNodeReference { child_block_index: left_block.index(), name_hash: left[0].0 },
    );
    dir.set_indirect_child(
        1,
        DirectoryTreeChildNodeReference { child_block_index: right_block.index(), name_hash: right[0].0 },
    );
    dir.items_count_or_data_size = 2;
    dir.levels_count += 1;
    Ok(())
}

pub fn remove<S: Storage>(
    storage: &mut S,
    allocator: &mut BlockAllocator,
    dir: &mut DirectoryInode,
    name: &[u8],
) -> Result<DirEntry> {
    let hash = hash_fnv1a_32(name);

    if dir.levels_count == 0 {
        let mut records = decode_records(dir.direct_data(), dir.items_count_or_data_size as usize);
        let idx = records
            .iter()
            .position(|(h, e)| *h == hash && e.name == name)
            .ok_or(Error::PathNotFound)?;
        let (_, removed) = records.remove(idx);
        let size = encode_records(&records, dir.direct_data_mut());
        dir.items_count_or_data_size = size as u16;
        return Ok(removed);
    }

    let (_path, leaf_block) = descend(storage, dir, hash)?;
    let mut leaf: DirectoryTreeLeaf = read_pod(storage, leaf_block.absolute_address())?;
    let mut records = decode_records(&leaf.data, leaf.data_size as usize);
    let idx = records
        .iter()
        .position(|(h, e)| *h == hash && e.name == name)
        .ok_or(Error::PathNotFound)?;
    let (_, removed) = records.remove(idx);
    leaf.data_size = encode_records(&records, &mut leaf.data) as u16;
    write_pod(storage, leaf_block.absolute_address(), &leaf)?;
    // Leaves are left in place (possibly empty) rather than merged back into
    // the tree; §9 allows a directory's indirect shape to only grow, never
    // shrink, and an empty leaf costs one block until the whole directory
    // is removed.
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn new_dir() -> DirectoryInode {
        bytemuck::Zeroable::zeroed()
    }

    fn entry(inode: u64, name: &str, is_directory: bool) -> DirEntry {
        DirEntry { inode, is_directory, name: name.as_bytes().to_vec() }
    }

    #[test]
    fn insert_and_lookup_round_trip() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        insert(&mut storage, &mut allocator, &mut dir, entry(10, "alpha", false)).unwrap();
        insert(&mut storage, &mut allocator, &mut dir, entry(11, "beta", true)).unwrap();
        let got = lookup(&mut storage, &dir, b"alpha").unwrap().unwrap();
        assert_eq!(got.inode, 10);
        assert!(!got.is_directory);
        let got = lookup(&mut storage, &dir, b"beta").unwrap().unwrap();
        assert!(got.is_directory);
        assert!(lookup(&mut storage, &dir, b"missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        insert(&mut storage, &mut allocator, &mut dir, entry(1, "x", false)).unwrap();
        let err = insert(&mut storage, &mut allocator, &mut dir, entry(2, "x", false)).unwrap_err();
        assert!(matches!(err, Error::FileExists(FileType::Regular)));
    }

    #[test]
    fn many_inserts_go_indirect_and_remain_lookupable() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        let names: Vec<String> = (0..2000).map(|i| format!("file-{i}")).collect();
        for (i, n) in names.iter().enumerate() {
            insert(&mut storage, &mut allocator, &mut dir, entry(i as u64 + 100, n, false)).unwrap();
        }
        assert!(dir.levels_count > 0);
        for n in &names {
            assert!(lookup(&mut storage, &dir, n.as_bytes()).unwrap().is_some());
        }
    }

    #[test]
    fn fnv_collisions_are_both_retrievable() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        insert(&mut storage, &mut allocator, &mut dir, entry(1, "costarring", false)).unwrap();
        insert(&mut storage, &mut allocator, &mut dir, entry(2, "liquid", false)).unwrap();
        assert_eq!(lookup(&mut storage, &dir, b"costarring").unwrap().unwrap().inode, 1);
        assert_eq!(lookup(&mut storage, &dir, b"liquid").unwrap().unwrap().inode, 2);
    }

    #[test]
    fn remove_drops_entry() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        insert(&mut storage, &mut allocator, &mut dir, entry(1, "a", false)).unwrap();
        insert(&mut storage, &mut allocator, &mut dir, entry(2, "b", false)).unwrap();
        remove(&mut storage, &mut allocator, &mut dir, b"a").unwrap();
        assert!(lookup(&mut storage, &dir, b"a").unwrap().is_none());
        assert!(lookup(&mut storage, &dir, b"b").unwrap().is_some());
    }

    #[test]
    fn iterate_visits_every_entry() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut dir = new_dir();
        let names: Vec<String> = (0..500).map(|i| format!("n{i}")).collect();
        for (i, n) in names.iter().enumerate() {
            insert(&mut storage, &mut allocator, &mut dir, entry(i as u64, n, false)).unwrap();
        }
        let mut seen = std::collections::BTreeSet::new();
        iterate(&mut storage, &dir, |e| {
            seen.insert(String::from_utf8(e.name.clone()).unwrap());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn split_never_separates_a_run_of_equal_hashes() {
        // A long run of hash 42 surrounded by enough distinct-hash padding to
        // force a split; the only valid boundary is between the two groups.
        let mut records: Vec<(u32, DirEntry)> = (0..40)
            .map(|i| (42, entry(i, &format!("same-hash-name-{i}"), false)))
            .collect();
        records.extend((0..40).map(|i| (43 + i as u32, entry(100 + i, &format!("n{i}"), false))));
        let right = split_if_over_capacity(&mut records).unwrap();
        if let Some(right) = right {
            assert!(records.iter().all(|(h, _)| *h == 42));
            assert!(right.iter().all(|(h, _)| *h != 42));
        }
    }

    #[test]
    fn split_over_capacity_with_one_giant_collision_run_fails_loudly() {
        let mut records: Vec<(u32, DirEntry)> = (0..200)
            .map(|i| (42, entry(i, &format!("same-hash-name-{i}"), false)))
            .collect();
        let err = split_if_over_capacity(&mut records).unwrap_err();
        assert!(matches!(err, Error::StorageLimitReached));
    }
}
