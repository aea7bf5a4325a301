//! First-fit allocator living inside the code cache file.
//!
//! All allocator state is stored in the mapped file itself so that the
//! compile monitor, which allocates, and the node, which frees storage of
//! stale entries when opening the cache, always agree on free space.
//!
//! File layout:
//!
//! ```text
//! [0, 512)       allocator header: magic, heap end, free list head, free bytes
//! [512, 1024)    code cache header (see `layout`)
//! [1024, end)    heap of blocks
//! ```
//!
//! Every block starts with a 16 byte header `{size, next}` where `size`
//! covers the header and `next` links free blocks in address order, or
//! holds [`ALLOCATED`] for blocks in use.

use crate::error::CacheError;
use crate::layout::TOTAL_HEADER_SIZE;
use byteorder::{ByteOrder, LittleEndian};

const MAGIC: u64 = u64::from_le_bytes(*b"SVOCALOC");

const MAGIC_OFFSET: usize = 0;
const HEAP_END_OFFSET: usize = 8;
const FREE_HEAD_OFFSET: usize = 16;
const FREE_BYTES_OFFSET: usize = 24;

const BLOCK_HEADER_SIZE: u64 = 16;
const ALIGNMENT: u64 = 16;
const MIN_BLOCK_SIZE: u64 = 2 * BLOCK_HEADER_SIZE;
const ALLOCATED: u64 = u64::MAX;
const NIL: u64 = 0;

/// Start of the heap.
pub const HEAP_START: u64 = TOTAL_HEADER_SIZE as u64;

fn align_up(n: u64) -> u64 {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

fn align_down(n: u64) -> u64 {
    n & !(ALIGNMENT - 1)
}

/// A view of the allocator in a mapped cache file.
pub struct CacheAllocator<'a> {
    map: &'a mut [u8],
}

impl<'a> CacheAllocator<'a> {
    /// Lays out an empty heap covering the whole of `map`.
    pub fn format(map: &'a mut [u8]) -> Result<Self, CacheError> {
        let end = align_down(map.len() as u64);
        if end < HEAP_START + MIN_BLOCK_SIZE {
            return Err(CacheError::TooSmall(map.len() as u64));
        }
        let mut allocator = Self { map };
        allocator.write(MAGIC_OFFSET as u64, MAGIC);
        allocator.write(HEAP_END_OFFSET as u64, end);
        allocator.write(FREE_HEAD_OFFSET as u64, HEAP_START);
        allocator.write(FREE_BYTES_OFFSET as u64, end - HEAP_START);
        allocator.write_block(HEAP_START, end - HEAP_START, NIL);
        Ok(allocator)
    }

    /// Attaches to an existing heap, checking the free list is sane.
    pub fn open(map: &'a mut [u8]) -> Result<Self, CacheError> {
        if map.len() < TOTAL_HEADER_SIZE {
            return Err(CacheError::TooSmall(map.len() as u64));
        }
        let allocator = Self { map };
        if allocator.read(MAGIC_OFFSET as u64) != MAGIC {
            return Err(CacheError::Corrupt("allocator magic mismatch".into()));
        }
        allocator.check_free_list()?;
        Ok(allocator)
    }

    fn check_free_list(&self) -> Result<(), CacheError> {
        let end = self.heap_end();
        if end > self.map.len() as u64 || end < HEAP_START || end % ALIGNMENT != 0 {
            return Err(CacheError::Corrupt("heap end outside of the file".into()));
        }
        let mut total = 0u64;
        let mut last_end = HEAP_START;
        let mut block = self.read(FREE_HEAD_OFFSET as u64);
        while block != NIL {
            let header_in_heap = block
                .checked_add(BLOCK_HEADER_SIZE)
                .is_some_and(|e| e <= end);
            if block < last_end || block % ALIGNMENT != 0 || !header_in_heap {
                return Err(CacheError::Corrupt(format!("bad free block at {block}")));
            }
            let size = self.read(block);
            if size < MIN_BLOCK_SIZE || block.checked_add(size).is_none_or(|e| e > end) {
                return Err(CacheError::Corrupt(format!("bad free block at {block}")));
            }
            total += size;
            last_end = block + size;
            block = self.read(block + 8);
        }
        if total != self.free_bytes() {
            return Err(CacheError::Corrupt("free byte count mismatch".into()));
        }
        Ok(())
    }

    /// End of the heap, which is also the usable size of the file.
    pub fn heap_end(&self) -> u64 {
        self.read(HEAP_END_OFFSET as u64)
    }

    /// Bytes not handed out, block headers included.
    pub fn free_bytes(&self) -> u64 {
        self.read(FREE_BYTES_OFFSET as u64)
    }

    /// Reserves room for `size` bytes, returning the offset of the payload.
    ///
    /// Payloads are 16 byte aligned. `None` when no free block is large
    /// enough.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let need = align_up(size.max(1).checked_add(BLOCK_HEADER_SIZE)?).max(MIN_BLOCK_SIZE);
        let mut prev = NIL;
        let mut block = self.read(FREE_HEAD_OFFSET as u64);
        while block != NIL {
            let block_size = self.read(block);
            let next = self.read(block + 8);
            if block_size >= need {
                let (taken, replacement) = if block_size - need >= MIN_BLOCK_SIZE {
                    let rest = block + need;
                    self.write_block(rest, block_size - need, next);
                    (need, rest)
                } else {
                    (block_size, next)
                };
                self.link(prev, replacement);
                self.write_block(block, taken, ALLOCATED);
                self.write(FREE_BYTES_OFFSET as u64, self.free_bytes() - taken);
                return Some(block + BLOCK_HEADER_SIZE);
            }
            prev = block;
            block = next;
        }
        None
    }

    /// Returns the block whose payload starts at `offset` to the free list.
    pub fn deallocate(&mut self, offset: u64) -> Result<(), CacheError> {
        let block = self
            .allocated_block(offset)
            .ok_or_else(|| CacheError::Corrupt(format!("{offset} is not an allocation")))?;
        let size = self.read(block);
        self.insert_free(block, size);
        Ok(())
    }

    /// Extends the heap to cover a mapping that grew to `map.len()` bytes.
    pub fn grow(&mut self) {
        let old_end = self.heap_end();
        let new_end = align_down(self.map.len() as u64);
        if new_end < old_end + MIN_BLOCK_SIZE {
            return;
        }
        self.write(HEAP_END_OFFSET as u64, new_end);
        self.insert_free(old_end, new_end - old_end);
    }

    /// Payload bytes of an allocation.
    pub fn bytes(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.map.get(start..start.checked_add(len)?)
    }

    /// Mutable payload bytes of an allocation.
    pub fn bytes_mut(&mut self, offset: u64, len: usize) -> Option<&mut [u8]> {
        let start = usize::try_from(offset).ok()?;
        self.map.get_mut(start..start.checked_add(len)?)
    }

    /// Copies `bytes` to the front of the allocation at `offset`.
    ///
    /// Fails without writing anything unless `offset` is an allocation
    /// with room for all of `bytes`.
    pub fn write_allocation(&mut self, offset: u64, bytes: &[u8]) -> Result<(), CacheError> {
        let block = self
            .allocated_block(offset)
            .ok_or_else(|| CacheError::Corrupt(format!("{offset} is not an allocation")))?;
        let capacity = self.read(block) - BLOCK_HEADER_SIZE;
        if bytes.len() as u64 > capacity {
            return Err(CacheError::Corrupt(format!(
                "{} bytes do not fit the allocation at {offset}",
                bytes.len()
            )));
        }
        self.bytes_mut(offset, bytes.len())
            .ok_or_else(|| CacheError::Corrupt(format!("allocation at {offset} is outside the file")))?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Whole payload of the allocation at `offset`, if it is one.
    pub fn allocation(&self, offset: u64) -> Option<&[u8]> {
        let block = self.allocated_block(offset)?;
        let size = self.read(block);
        self.bytes(offset, usize::try_from(size - BLOCK_HEADER_SIZE).ok()?)
    }

    fn allocated_block(&self, offset: u64) -> Option<u64> {
        let block = offset
            .checked_sub(BLOCK_HEADER_SIZE)
            .filter(|b| *b >= HEAP_START && b % ALIGNMENT == 0 && *b < self.heap_end())?;
        let size = self.read(block);
        let in_heap = block.checked_add(size).is_some_and(|e| e <= self.heap_end());
        (self.read(block + 8) == ALLOCATED && size >= MIN_BLOCK_SIZE && in_heap).then_some(block)
    }

    fn insert_free(&mut self, block: u64, size: u64) {
        let mut prev = NIL;
        let mut next = self.read(FREE_HEAD_OFFSET as u64);
        while next != NIL && next < block {
            prev = next;
            next = self.read(next + 8);
        }
        self.write(FREE_BYTES_OFFSET as u64, self.free_bytes() + size);

        let (mut start, mut size) = (block, size);
        let mut after = next;
        if after != NIL && start + size == after {
            size += self.read(after);
            after = self.read(after + 8);
        }
        if prev != NIL && prev + self.read(prev) == start {
            size += self.read(prev);
            start = prev;
            self.write_block(start, size, after);
            return;
        }
        self.write_block(start, size, after);
        self.link(prev, start);
    }

    fn link(&mut self, prev: u64, next: u64) {
        if prev == NIL {
            self.write(FREE_HEAD_OFFSET as u64, next);
        } else {
            self.write(prev + 8, next);
        }
    }

    fn write_block(&mut self, block: u64, size: u64, next: u64) {
        self.write(block, size);
        self.write(block + 8, next);
    }

    fn read(&self, offset: u64) -> u64 {
        let o = offset as usize;
        LittleEndian::read_u64(&self.map[o..o + 8])
    }

    fn write(&mut self, offset: u64, value: u64) {
        let o = offset as usize;
        LittleEndian::write_u64(&mut self.map[o..o + 8], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 64 * 1024;

    #[test]
    fn fresh_heap_is_all_free() {
        let mut map = vec![0u8; SIZE];
        let allocator = CacheAllocator::format(&mut map).unwrap();
        assert_eq!(allocator.free_bytes(), SIZE as u64 - HEAP_START);
        assert_eq!(allocator.heap_end(), SIZE as u64);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut map = vec![0u8; SIZE];
        let mut allocator = CacheAllocator::format(&mut map).unwrap();
        let a = allocator.allocate(5).unwrap();
        let b = allocator.allocate(100).unwrap();
        let c = allocator.allocate(0).unwrap();
        for offset in [a, b, c] {
            assert_eq!(offset % ALIGNMENT, 0);
        }
        assert!(a + 5 <= b - BLOCK_HEADER_SIZE);
        assert!(b + 100 <= c - BLOCK_HEADER_SIZE);
        assert!(allocator.allocation(b).unwrap().len() >= 100);
        assert!(allocator.allocation(b + 16).is_none());
    }

    #[test]
    fn freeing_everything_coalesces_back_to_one_block() {
        let mut map = vec![0u8; SIZE];
        let mut allocator = CacheAllocator::format(&mut map).unwrap();
        let initial = allocator.free_bytes();
        let offsets: Vec<u64> = (1..20).map(|i| allocator.allocate(i * 37).unwrap()).collect();
        // free in an interleaved order so both merge directions are exercised
        for offset in offsets.iter().step_by(2).chain(offsets.iter().skip(1).step_by(2)) {
            allocator.deallocate(*offset).unwrap();
        }
        assert_eq!(allocator.free_bytes(), initial);
        assert_eq!(allocator.allocate(initial - BLOCK_HEADER_SIZE), Some(HEAP_START + 16));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut map = vec![0u8; 4096];
        let mut allocator = CacheAllocator::format(&mut map).unwrap();
        assert!(allocator.allocate(4096).is_none());
        assert!(allocator.allocate(1024).is_some());
        assert!(allocator.allocate(1900).is_some());
        assert!(allocator.allocate(1024).is_none());
    }

    #[test]
    fn double_free_is_detected() {
        let mut map = vec![0u8; SIZE];
        let mut allocator = CacheAllocator::format(&mut map).unwrap();
        let a = allocator.allocate(64).unwrap();
        allocator.deallocate(a).unwrap();
        assert!(matches!(allocator.deallocate(a), Err(CacheError::Corrupt(_))));
        assert!(matches!(allocator.deallocate(3), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn writes_must_fit_their_allocation() {
        let mut map = vec![0u8; SIZE];
        let mut allocator = CacheAllocator::format(&mut map).unwrap();
        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();

        allocator.write_allocation(a, &[0xab; 16]).unwrap();
        assert_eq!(allocator.allocation(a).unwrap()[..16], [0xab; 16]);

        assert!(matches!(
            allocator.write_allocation(a, &[0xcd; 64]),
            Err(CacheError::Corrupt(_))
        ));
        assert!(matches!(
            allocator.write_allocation(a + 16, &[0xcd]),
            Err(CacheError::Corrupt(_))
        ));
        assert!(matches!(
            allocator.write_allocation(SIZE as u64 * 4, &[0xcd]),
            Err(CacheError::Corrupt(_))
        ));
        // neither failed write touched the neighbouring block
        assert!(allocator.allocation(b).unwrap().iter().all(|byte| *byte == 0));
        assert_eq!(allocator.allocation(a).unwrap()[..16], [0xab; 16]);
    }

    #[test]
    fn state_persists_in_the_mapping() {
        let mut map = vec![0u8; SIZE];
        let a = {
            let mut allocator = CacheAllocator::format(&mut map).unwrap();
            allocator.allocate(300).unwrap()
        };
        let mut allocator = CacheAllocator::open(&mut map).unwrap();
        let b = allocator.allocate(300).unwrap();
        assert_ne!(a, b);
        allocator.deallocate(a).unwrap();
    }

    #[test]
    fn growing_adds_free_space() {
        let mut map = vec![0u8; SIZE];
        let before = CacheAllocator::format(&mut map).unwrap().free_bytes();
        map.resize(2 * SIZE, 0);
        let mut allocator = CacheAllocator::open(&mut map).unwrap();
        allocator.grow();
        assert_eq!(allocator.free_bytes(), before + SIZE as u64);
        // the old tail and the new space merged into one block
        assert!(allocator.allocate(SIZE as u64 + 1024).is_some());
    }

    #[test]
    fn corrupt_free_list_is_rejected() {
        let mut map = vec![0u8; SIZE];
        CacheAllocator::format(&mut map).unwrap();
        LittleEndian::write_u64(&mut map[FREE_BYTES_OFFSET..FREE_BYTES_OFFSET + 8], 7);
        assert!(matches!(
            CacheAllocator::open(&mut map),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn free_list_pointing_outside_the_heap_is_rejected() {
        let mut map = vec![0u8; SIZE];
        for head in [1u64 << 40, u64::MAX - 7, SIZE as u64 - 8, HEAP_START + 8] {
            CacheAllocator::format(&mut map).unwrap();
            LittleEndian::write_u64(&mut map[FREE_HEAD_OFFSET..FREE_HEAD_OFFSET + 8], head);
            assert!(
                matches!(CacheAllocator::open(&mut map), Err(CacheError::Corrupt(_))),
                "free list head {head} accepted"
            );
        }
    }

    #[test]
    fn free_block_linking_past_the_heap_is_rejected() {
        let mut map = vec![0u8; SIZE];
        {
            let mut allocator = CacheAllocator::format(&mut map).unwrap();
            allocator.allocate(64).unwrap();
        }
        let next = HEAP_START as usize + 80 + 8;
        LittleEndian::write_u64(&mut map[next..next + 8], 1 << 40);
        assert!(matches!(
            CacheAllocator::open(&mut map),
            Err(CacheError::Corrupt(_))
        ));
    }
}
