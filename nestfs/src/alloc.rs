//! Block Allocator (§4.1): a hierarchical bitmap allocator that owns the
//! on-storage free/used space and grows/shrinks the storage.
//!
//! Grounded in `original_source/src/BlockStorage.{hpp,cpp}`. One deliberate
//! deviation from that source: the original declares a `StorageHeader`
//! member but never reads or writes it, so `occupiedBlocksCount` and the
//! `0xF2F0` magic are dead fields there. spec.md §3/§4.1/§5 describe the
//! header as a real commit point, so this implementation writes it on every
//! mutation and every block offset includes `HEADER_SIZE` as a fixed prefix
//! (see DESIGN.md).

use crate::bitrange;
use crate::error::{Error, Result};
use crate::layout::{
    OccupancyBlock, StorageHeader, BLOCK_SIZE, HEADER_SIZE, LEVELS, MAGIC, OCC_BITS, OCC_SIZE,
    OCC_WORDS,
};
use crate::storage::{read_pod, write_pod, Storage};

const fn compute_level_tables() -> ([u64; LEVELS], [u64; LEVELS]) {
    let mut level_absolute_size = [0u64; LEVELS];
    let mut blocks_in_level = [0u64; LEVELS];
    level_absolute_size[0] = OCC_SIZE as u64 + OCC_BITS * BLOCK_SIZE as u64;
    blocks_in_level[0] = OCC_BITS;
    let mut level = 1;
    while level < LEVELS {
        level_absolute_size[level] = level_absolute_size[level - 1] * OCC_BITS + OCC_SIZE as u64;
        blocks_in_level[level] = blocks_in_level[level - 1] * OCC_BITS;
        level += 1;
    }
    (level_absolute_size, blocks_in_level)
}

const LEVEL_TABLES: ([u64; LEVELS], [u64; LEVELS]) = compute_level_tables();
const LEVEL_ABSOLUTE_SIZE: [u64; LEVELS] = LEVEL_TABLES.0;
const BLOCKS_IN_LEVEL: [u64; LEVELS] = LEVEL_TABLES.1;

/// A validated block index. Opaque so callers can't construct one without
/// going through the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddress(u64);

impl BlockAddress {
    pub fn from_index(index: u64) -> Self {
        BlockAddress(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }

    /// Absolute byte offset of this block's data, per the closed-form
    /// formula of spec.md §4.1.
    pub fn absolute_address(&self) -> u64 {
        let mut occupancy_blocks = self.0 / OCC_BITS + 1;
        for level in 1..LEVELS {
            occupancy_blocks +=
                (self.0 + (BLOCKS_IN_LEVEL[level] - BLOCKS_IN_LEVEL[level - 1])) / BLOCKS_IN_LEVEL[level];
        }
        HEADER_SIZE as u64 + occupancy_blocks * OCC_SIZE as u64 + self.0 * BLOCK_SIZE as u64
    }
}

fn get_occupancy_block_position(group_index: u64) -> u64 {
    BlockAddress::from_index(group_index * OCC_BITS).absolute_address() - OCC_SIZE as u64
}

fn get_block_group_index(block_index: u64) -> u64 {
    block_index / OCC_BITS
}

fn get_block_index_in_group(block_index: u64) -> usize {
    (block_index % OCC_BITS) as usize
}

fn get_size_for_n_blocks(n: u64) -> u64 {
    if n == 0 {
        HEADER_SIZE as u64
    } else {
        BlockAddress::from_index(n - 1).absolute_address() + BLOCK_SIZE as u64
    }
}

fn get_blocks_count_by_storage_size(size: u64) -> Result<u64> {
    if size < HEADER_SIZE as u64 {
        return Err(Error::InvalidStorageFormat(
            "storage shorter than the header".into(),
        ));
    }
    let mut size = size - HEADER_SIZE as u64;
    let mut blocks_count = 0u64;
    for level in (0..LEVELS).rev() {
        let groups_count = size / LEVEL_ABSOLUTE_SIZE[level];
        size %= LEVEL_ABSOLUTE_SIZE[level];
        blocks_count += groups_count * BLOCKS_IN_LEVEL[level];
        if level == 0 {
            if size > 0
                && (size < OCC_SIZE as u64 || (size - OCC_SIZE as u64) % BLOCK_SIZE as u64 != 0)
            {
                return Err(Error::InvalidStorageFormat(
                    "storage size doesn't correspond to a legal block layout".into(),
                ));
            }
            if size > 0 {
                blocks_count += (size - OCC_SIZE as u64) / BLOCK_SIZE as u64;
            }
        } else if size > LEVEL_ABSOLUTE_SIZE[level - 1] {
            size -= OCC_SIZE as u64;
        }
    }
    Ok(blocks_count)
}

/// The Block Allocator. Owns nothing persistent beyond what's reconstructed
/// from the storage: `blocks_count` is recomputed on open via
/// `get_blocks_count_by_storage_size`.
pub struct BlockAllocator {
    blocks_count: u64,
}

impl BlockAllocator {
    /// Formats a fresh, empty allocator: truncates storage to just the
    /// header and writes the magic.
    pub fn format<S: Storage>(storage: &mut S) -> Result<Self> {
        storage.resize(0)?;
        storage.resize(HEADER_SIZE as u64)?;
        let header = StorageHeader::new();
        write_pod(storage, 0, &header)?;
        Ok(Self { blocks_count: 0 })
    }

    /// Reopens an allocator from existing storage bytes.
    pub fn open<S: Storage>(storage: &mut S) -> Result<Self> {
        if storage.size() < HEADER_SIZE as u64 {
            return Err(Error::InvalidStorageFormat(
                "storage shorter than the header".into(),
            ));
        }
        let header: StorageHeader = read_pod(storage, 0)?;
        if header.magic != MAGIC {
            return Err(Error::InvalidStorageFormat("bad magic".into()));
        }
        let blocks_count = get_blocks_count_by_storage_size(storage.size())?;
        if blocks_count != header.occupied_blocks_count {
            return Err(Error::InvalidStorageFormat(
                "occupied_blocks_count does not match storage size".into(),
            ));
        }
        Ok(Self { blocks_count })
    }

    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    fn write_header<S: Storage>(&self, storage: &mut S) -> Result<()> {
        let header = StorageHeader {
            magic: MAGIC,
            reserved: [0; 6],
            occupied_blocks_count: self.blocks_count,
        };
        write_pod(storage, 0, &header)?;
        Ok(())
    }

    pub fn allocate_one<S: Storage>(&mut self, storage: &mut S) -> Result<BlockAddress> {
        let mut result = None;
        self.allocate_blocks(storage, 1, |addr| result = Some(addr))?;
        result.ok_or_else(|| Error::InternalExpectationFail("allocate_one produced nothing".into()))
    }

    /// Allocates `num_blocks` blocks, invoking `visitor` for each.
    pub fn allocate_blocks<S: Storage>(
        &mut self,
        storage: &mut S,
        num_blocks: u64,
        mut visitor: impl FnMut(BlockAddress),
    ) -> Result<()> {
        if self.blocks_count + num_blocks >= BLOCKS_IN_LEVEL[LEVELS - 1] {
            log::warn!(
                "allocation of {num_blocks} blocks would exceed the top-level occupancy group"
            );
            return Err(Error::StorageLimitReached);
        }
        if self.blocks_count + num_blocks > self.current_capacity() {
            let needed = get_size_for_n_blocks(self.blocks_count + num_blocks);
            if needed > storage.size() {
                log::trace!("growing storage from {} to {needed} bytes", storage.size());
                storage.resize(needed)?;
            }
        }
        let mut remaining = num_blocks;
        self.allocate_level(storage, &mut remaining, LEVELS - 1, 0, 0, &mut visitor)?;
        if remaining > 0 {
            return Err(Error::InternalExpectationFail(
                "allocator exhausted before satisfying request".into(),
            ));
        }
        self.write_header(storage)?;
        Ok(())
    }

    fn current_capacity(&self) -> u64 {
        // the largest block index addressable without growing storage further
        self.blocks_count
    }

    fn allocate_level<S: Storage>(
        &mut self,
        storage: &mut S,
        remaining: &mut u64,
        level: usize,
        absolute_offset: u64,
        blocks_offset: u64,
        visitor: &mut impl FnMut(BlockAddress),
    ) -> Result<bool> {
        if level == 0 {
            return self.allocate_level0(storage, remaining, absolute_offset, blocks_offset, visitor);
        }
        let position = absolute_offset + LEVEL_ABSOLUTE_SIZE[level - 1];
        let mut block = if position >= storage.size() {
            OccupancyBlock::zeroed_block()
        } else {
            read_pod(storage, position)?
        };
        let mut dirty = false;
        let mut next_word = 0usize;
        while *remaining > 0 {
            let Some(free_group) = bitrange::find_first_zero_bit(&block.bitmap, next_word) else {
                break;
            };
            next_word = free_group / 64;
            let child_absolute = if free_group == 0 {
                absolute_offset
            } else {
                absolute_offset
                    + OCC_SIZE as u64
                    + free_group as u64 * LEVEL_ABSOLUTE_SIZE[level - 1]
            };
            let child_blocks_offset = blocks_offset + free_group as u64 * BLOCKS_IN_LEVEL[level - 1];
            let full = self.allocate_level(
                storage,
                remaining,
                level - 1,
                child_absolute,
                child_blocks_offset,
                visitor,
            )?;
            if full {
                dirty = true;
                bitrange::set_bit(&mut block.bitmap, free_group);
            }
        }
        if dirty && position < storage.size() {
            write_pod(storage, position, &block)?;
        }
        Ok(bitrange::find_first_zero_bit(&block.bitmap, 0).is_none())
    }

    fn allocate_level0<S: Storage>(
        &mut self,
        storage: &mut S,
        remaining: &mut u64,
        absolute_offset: u64,
        blocks_offset: u64,
        visitor: &mut impl FnMut(BlockAddress),
    ) -> Result<bool> {
        let mut block = if absolute_offset >= storage.size() {
            OccupancyBlock::zeroed_block()
        } else {
            read_pod(storage, absolute_offset)?
        };
        let mut dirty = false;
        let mut next_word = 0usize;
        while *remaining > 0 {
            let Some(bit) = bitrange::find_and_set_first_zero_bit(&mut block.bitmap, next_word) else {
                break;
            };
            next_word = bit / 64;
            dirty = true;
            let occupied_block = blocks_offset + bit as u64;
            if occupied_block > self.blocks_count {
                return Err(Error::InternalExpectationFail(
                    "allocated block beyond current high-water mark".into(),
                ));
            }
            if occupied_block == self.blocks_count {
                let needed = get_size_for_n_blocks(self.blocks_count + *remaining);
                if needed > storage.size() {
                    storage.resize(needed)?;
                }
                self.blocks_count += 1;
            }
            visitor(BlockAddress::from_index(occupied_block));
            *remaining -= 1;
        }
        if dirty {
            write_pod(storage, absolute_offset, &block)?;
        }
        Ok(bitrange::find_first_zero_bit(&block.bitmap, 0).is_none())
    }

    /// Releases `num_blocks` blocks starting at `addr`.
    pub fn release_blocks<S: Storage>(
        &mut self,
        storage: &mut S,
        addr: BlockAddress,
        num_blocks: u64,
    ) -> Result<()> {
        let block_index = addr.index();
        if block_index + num_blocks > self.blocks_count {
            return Err(Error::InternalExpectationFail(
                "release_blocks on blocks beyond the high-water mark".into(),
            ));
        }

        let (begin, end) = if block_index + num_blocks == self.blocks_count {
            let begin = self.find_start_of_free_blocks_range(storage, block_index)?;
            let end = self.blocks_count - 1;
            log::trace!("releasing trailing blocks {begin}..={end}, truncating storage");
            self.truncate_storage(storage, begin)?;
            (begin, end)
        } else {
            (block_index, block_index + num_blocks - 1)
        };

        self.mark_blocks_as_free(storage, begin, end, LEVELS - 1, 0, 0)?;
        self.write_header(storage)?;
        Ok(())
    }

    fn truncate_storage<S: Storage>(&mut self, storage: &mut S, num_blocks: u64) -> Result<()> {
        self.blocks_count = num_blocks;
        storage.resize(get_size_for_n_blocks(num_blocks))?;
        Ok(())
    }

    fn find_start_of_free_blocks_range<S: Storage>(
        &self,
        storage: &mut S,
        end_block_index: u64,
    ) -> Result<u64> {
        if end_block_index == 0 {
            return Ok(0);
        }
        let end_group_index = get_block_group_index(end_block_index - 1);
        let mut group_index = end_group_index;
        loop {
            let block: OccupancyBlock = read_pod(storage, get_occupancy_block_position(group_index))?;
            let last_bit = if group_index == end_group_index {
                get_block_index_in_group(end_block_index - 1) + 1
            } else {
                OCC_BITS as usize
            };
            if let Some(last_occupied) = bitrange::find_last_set_bit(&block.bitmap, last_bit) {
                return Ok(group_index * OCC_BITS + last_occupied as u64 + 1);
            }
            if group_index == 0 {
                break;
            }
            group_index -= 1;
        }
        Ok(0)
    }

    /// Returns true if the group at this level became fully occupied (i.e.
    /// had no free blocks at all, since we're only ever clearing bits here —
    /// matches the original's "had no free blocks before this release"
    /// semantics used to decide whether the parent's bit must be cleared).
    fn mark_blocks_as_free<S: Storage>(
        &mut self,
        storage: &mut S,
        begin: u64,
        end: u64,
        level: usize,
        absolute_offset: u64,
        blocks_offset: u64,
    ) -> Result<bool> {
        if level == 0 {
            if absolute_offset < storage.size() {
                let mut block: OccupancyBlock = read_pod(storage, absolute_offset)?;
                let had_free = bitrange::has_zero_bit(&block.bitmap, OCC_BITS as usize);
                bitrange::clear_bit_range(&mut block.bitmap, begin as usize, end as usize);
                write_pod(storage, absolute_offset, &block)?;
                Ok(!had_free)
            } else {
                Ok(false)
            }
        } else {
            let begin_sub = begin / BLOCKS_IN_LEVEL[level - 1];
            let end_sub = end / BLOCKS_IN_LEVEL[level - 1];
            for sub_group in begin_sub..=end_sub {
                let begin_in_sub = if sub_group == begin_sub {
                    begin % BLOCKS_IN_LEVEL[level - 1]
                } else {
                    0
                };
                let end_in_sub = if sub_group == end_sub {
                    end % BLOCKS_IN_LEVEL[level - 1]
                } else {
                    BLOCKS_IN_LEVEL[level - 1] - 1
                };
                let child_absolute = if sub_group == 0 {
                    absolute_offset
                } else {
                    absolute_offset + OCC_SIZE as u64 + sub_group * LEVEL_ABSOLUTE_SIZE[level - 1]
                };
                let child_blocks_offset = blocks_offset + sub_group * BLOCKS_IN_LEVEL[level - 1];
                self.mark_blocks_as_free(
                    storage,
                    begin_in_sub,
                    end_in_sub,
                    level - 1,
                    child_absolute,
                    child_blocks_offset,
                )?;
            }

            let position = absolute_offset + LEVEL_ABSOLUTE_SIZE[level - 1];
            if position < storage.size() {
                let mut block: OccupancyBlock = read_pod(storage, position)?;
                let had_free = bitrange::has_zero_bit(&block.bitmap, OCC_BITS as usize);
                bitrange::clear_bit_range(&mut block.bitmap, begin_sub as usize, end_sub as usize);
                write_pod(storage, position, &block)?;
                Ok(!had_free)
            } else {
                Ok(true)
            }
        }
    }

    pub fn is_adjacent(range_start: BlockAddress, range_size: u32, next: BlockAddress) -> bool {
        let last_in_range = range_start.index() + range_size as u64 - 1;
        last_in_range + 1 == next.index()
            && BlockAddress::from_index(last_in_range).absolute_address() + BLOCK_SIZE as u64
                == next.absolute_address()
    }

    pub fn check_allocated_block<S: Storage>(&self, storage: &mut S, addr: BlockAddress) -> Result<()> {
        if addr.index() >= self.blocks_count {
            return Err(Error::InternalExpectationFail(
                "block address beyond high-water mark".into(),
            ));
        }
        let block: OccupancyBlock =
            read_pod(storage, get_occupancy_block_position(get_block_group_index(addr.index())))?;
        if !bitrange::get_bit(&block.bitmap, get_block_index_in_group(addr.index())) {
            return Err(Error::InternalExpectationFail(
                "block referenced but not marked allocated".into(),
            ));
        }
        Ok(())
    }

    pub fn enumerate_allocated<S: Storage>(
        &self,
        storage: &mut S,
        mut visitor: impl FnMut(BlockAddress),
    ) -> Result<()> {
        let mut block_index = 0u64;
        let mut group_index = 0u64;
        while block_index < self.blocks_count {
            let block: OccupancyBlock = read_pod(storage, get_occupancy_block_position(group_index))?;
            let mut in_group = 0usize;
            while block_index < self.blocks_count && (in_group as u64) < OCC_BITS {
                if bitrange::get_bit(&block.bitmap, in_group) {
                    visitor(BlockAddress::from_index(block_index));
                }
                block_index += 1;
                in_group += 1;
            }
            group_index += 1;
        }
        Ok(())
    }

    /// Full consistency check (§4.1 "Invariant maintenance").
    pub fn check<S: Storage>(&self, storage: &mut S) -> Result<()> {
        let mut counted = 0u64;
        self.check_level(storage, LEVELS - 1, 0, 0, &mut counted)?;
        if counted != self.blocks_count {
            return Err(Error::InternalExpectationFail(
                "sum of set level-0 bits does not match blocks_count".into(),
            ));
        }
        Ok(())
    }

    fn check_level<S: Storage>(
        &self,
        storage: &mut S,
        level: usize,
        absolute_offset: u64,
        blocks_offset: u64,
        counted: &mut u64,
    ) -> Result<bool> {
        if level == 0 {
            if absolute_offset >= storage.size() {
                return Ok(true);
            }
            let block: OccupancyBlock = read_pod(storage, absolute_offset)?;
            for bit in 0..OCC_WORDS * 64 {
                let block_idx = blocks_offset + bit as u64;
                if block_idx >= self.blocks_count {
                    break;
                }
                if bitrange::get_bit(&block.bitmap, bit) {
                    *counted += 1;
                }
            }
            Ok(bitrange::find_first_zero_bit(&block.bitmap, 0).is_none())
        } else {
            let position = absolute_offset + LEVEL_ABSOLUTE_SIZE[level - 1];
            let block = if position >= storage.size() {
                OccupancyBlock::zeroed_block()
            } else {
                read_pod(storage, position)?
            };
            let mut group = 0u64;
            loop {
                let group_blocks_offset = blocks_offset + group * BLOCKS_IN_LEVEL[level - 1];
                if group_blocks_offset >= self.blocks_count {
                    break;
                }
                let child_absolute = if group == 0 {
                    absolute_offset
                } else {
                    absolute_offset + OCC_SIZE as u64 + group * LEVEL_ABSOLUTE_SIZE[level - 1]
                };
                let fully_occupied =
                    self.check_level(storage, level - 1, child_absolute, group_blocks_offset, counted)?;
                let bit_set = bitrange::get_bit(&block.bitmap, group as usize);
                if fully_occupied != bit_set {
                    return Err(Error::InternalExpectationFail(
                        "occupancy bit doesn't match subgroup fullness".into(),
                    ));
                }
                group += 1;
            }
            Ok(bitrange::find_first_zero_bit(&block.bitmap, 0).is_none())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use std::collections::BTreeSet;

    #[test]
    fn format_leaves_only_the_header() {
        let mut storage = MemStorage::new();
        let allocator = BlockAllocator::format(&mut storage).unwrap();
        assert_eq!(allocator.blocks_count(), 0);
        assert_eq!(storage.size(), HEADER_SIZE as u64);
    }

    #[test]
    fn allocate_then_release_returns_to_post_format_size() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut addrs = Vec::new();
        allocator
            .allocate_blocks(&mut storage, 50, |a| addrs.push(a))
            .unwrap();
        assert_eq!(addrs.len(), 50);
        for a in addrs.into_iter().rev() {
            allocator.release_blocks(&mut storage, a, 1).unwrap();
        }
        assert_eq!(allocator.blocks_count(), 0);
        assert_eq!(storage.size(), HEADER_SIZE as u64);
    }

    #[test]
    fn allocation_addresses_are_unique() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut seen = BTreeSet::new();
        allocator
            .allocate_blocks(&mut storage, 20_000, |a| {
                assert!(seen.insert(a.index()));
            })
            .unwrap();
    }

    #[test]
    fn enumerate_matches_allocated_set() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut addrs = Vec::new();
        allocator
            .allocate_blocks(&mut storage, 9000, |a| addrs.push(a))
            .unwrap();
        // release every third block
        let released: Vec<_> = addrs.iter().step_by(3).cloned().collect();
        for a in released.iter().rev() {
            allocator.release_blocks(&mut storage, *a, 1).unwrap();
        }
        let remaining: BTreeSet<u64> = addrs
            .iter()
            .map(|a| a.index())
            .filter(|i| !released.iter().any(|r| r.index() == *i))
            .collect();
        let mut enumerated = Vec::new();
        allocator
            .enumerate_allocated(&mut storage, |a| enumerated.push(a.index()))
            .unwrap();
        assert!(enumerated.windows(2).all(|w| w[0] < w[1]));
        let enumerated_set: BTreeSet<u64> = enumerated.into_iter().collect();
        assert_eq!(enumerated_set, remaining);
    }

    #[test]
    fn reopen_reconstructs_same_blocks_count() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        allocator.allocate_blocks(&mut storage, 500, |_| {}).unwrap();
        let reopened = BlockAllocator::open(&mut storage).unwrap();
        assert_eq!(reopened.blocks_count(), allocator.blocks_count());
    }

    #[test]
    fn check_passes_after_stress() {
        let mut storage = MemStorage::new();
        let mut allocator = BlockAllocator::format(&mut storage).unwrap();
        let mut addrs = Vec::new();
        for i in 0..30_000u64 {
            let a = allocator.allocate_one(&mut storage).unwrap();
            addrs.push(a);
            if (i + 1) % 10_000 == 0 {
                allocator.check(&mut storage).unwrap();
            }
        }
        for a in addrs.into_iter().rev() {
            allocator.release_blocks(&mut storage, a, 1).unwrap();
        }
        assert_eq!(storage.size(), HEADER_SIZE as u64);
    }
}
