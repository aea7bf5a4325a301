//! The code cache header stored at a fixed offset of `code_cache.bin`.
use byteorder::{ByteOrder, LittleEndian};

/// Offset of the code cache header, right after the allocator header.
pub const HEADER_OFFSET: usize = 512;
/// Space reserved for the code cache header.
pub const HEADER_SIZE: usize = 512;
/// Bytes in front of the allocator heap.
pub const TOTAL_HEADER_SIZE: usize = HEADER_OFFSET + HEADER_SIZE;

/// Identifies a code cache file of the current format.
pub const HEADER_ID: u64 = 0x32434f4d56534f45;

const ID_OFFSET: usize = HEADER_OFFSET;
const DIRTY_OFFSET: usize = HEADER_OFFSET + 8;
const INDEX_OFFSET: usize = HEADER_OFFSET + 16;

/// Name of the cache file inside the data directory.
pub const CACHE_FILE_NAME: &str = "code_cache.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheHeader {
    pub id: u64,
    /// Set while a node has the cache open.
    pub dirty: bool,
    /// Allocation holding the persisted descriptors, 0 when there is none.
    pub serialized_descriptor_index: u64,
}

impl Default for CodeCacheHeader {
    fn default() -> Self {
        Self {
            id: HEADER_ID,
            dirty: false,
            serialized_descriptor_index: 0,
        }
    }
}

impl CodeCacheHeader {
    pub fn read(map: &[u8]) -> Self {
        Self {
            id: LittleEndian::read_u64(&map[ID_OFFSET..ID_OFFSET + 8]),
            dirty: map[DIRTY_OFFSET] != 0,
            serialized_descriptor_index: LittleEndian::read_u64(
                &map[INDEX_OFFSET..INDEX_OFFSET + 8],
            ),
        }
    }

    pub fn write(&self, map: &mut [u8]) {
        LittleEndian::write_u64(&mut map[ID_OFFSET..ID_OFFSET + 8], self.id);
        map[DIRTY_OFFSET] = u8::from(self.dirty);
        LittleEndian::write_u64(
            &mut map[INDEX_OFFSET..INDEX_OFFSET + 8],
            self.serialized_descriptor_index,
        );
    }
}
