//! Opening and closing `code_cache.bin`.
use crate::allocator::CacheAllocator;
use crate::error::CacheError;
use crate::layout::{CodeCacheHeader, HEADER_ID, TOTAL_HEADER_SIZE};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use sysvmoc_types::{CodeDescriptor, CURRENT_CODEGEN_VERSION};

/// Smallest accepted cache size.
pub const MINIMUM_CACHE_SIZE: u64 = 16 * 1024;

/// Entries dropped at a time when the index does not fit on close.
pub(crate) const EVICTION_BATCH: usize = 25;

pub(crate) struct LoadedCache {
    pub file: File,
    /// Persisted entries, least recently used first.
    pub descriptors: Vec<CodeDescriptor>,
    pub free_bytes: u64,
}

/// Opens the cache at `path`, creating it if needed.
///
/// A file that is dirty or fails validation is replaced by an empty cache
/// once; a freshly created file that fails is an error. The returned file
/// is marked dirty until [`close_cache_file`] runs.
pub(crate) fn open_cache_file(path: &Path, cache_size: u64) -> Result<LoadedCache, CacheError> {
    if cache_size < MINIMUM_CACHE_SIZE {
        return Err(CacheError::TooSmall(cache_size));
    }
    let created = !path.exists();
    if created {
        create_cache_file(path, cache_size)?;
    }
    match open_existing(path, cache_size) {
        Err(
            err @ (CacheError::IncompatibleHeader | CacheError::Dirty | CacheError::Corrupt(_)),
        ) if !created => {
            tracing::warn!(path = %path.display(), error = %err, "code cache unusable, starting with an empty one");
            fs::remove_file(path)?;
            create_cache_file(path, cache_size)?;
            open_existing(path, cache_size)
        }
        other => other,
    }
}

fn create_cache_file(path: &Path, cache_size: u64) -> Result<(), CacheError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(cache_size)?;
    // SAFETY: the file was just created and nothing else maps it yet.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    CacheAllocator::format(&mut map)?;
    CodeCacheHeader::default().write(&mut map);
    map.flush()?;
    Ok(())
}

fn open_existing(path: &Path, cache_size: u64) -> Result<LoadedCache, CacheError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len < TOTAL_HEADER_SIZE as u64 {
        return Err(CacheError::Corrupt("file is shorter than its headers".into()));
    }
    let grow = len < cache_size;
    if grow {
        file.set_len(cache_size)?;
    }

    // SAFETY: the compile monitor only maps the file once a session is
    // opened, which happens after this returns.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    let mut header = CodeCacheHeader::read(&map);
    if header.id != HEADER_ID {
        return Err(CacheError::IncompatibleHeader);
    }
    if header.dirty {
        return Err(CacheError::Dirty);
    }

    let (descriptors, free_bytes) = {
        let mut allocator = CacheAllocator::open(&mut map)?;
        if grow {
            allocator.grow();
        }
        let descriptors = load_index(&mut allocator, header.serialized_descriptor_index)?;
        (descriptors, allocator.free_bytes())
    };

    header.serialized_descriptor_index = 0;
    header.dirty = true;
    header.write(&mut map);
    map.flush()?;
    tracing::info!(
        entries = descriptors.len(),
        free_bytes,
        size = cache_size.max(len),
        "opened code cache"
    );
    Ok(LoadedCache {
        file,
        descriptors,
        free_bytes,
    })
}

/// Reads the persisted index, frees its block and drops entries produced
/// by a different code generator.
fn load_index(
    allocator: &mut CacheAllocator<'_>,
    offset: u64,
) -> Result<Vec<CodeDescriptor>, CacheError> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    let payload = allocator
        .allocation(offset)
        .ok_or_else(|| CacheError::Corrupt("descriptor index is not an allocation".into()))?;
    let descriptors: Vec<CodeDescriptor> = bincode::deserialize(payload)
        .map_err(|e| CacheError::Corrupt(format!("descriptor index: {e}")))?;
    allocator.deallocate(offset)?;

    let (current, stale): (Vec<_>, Vec<_>) = descriptors
        .into_iter()
        .partition(|d| d.codegen_version == CURRENT_CODEGEN_VERSION);
    for descriptor in &stale {
        free_code_storage(allocator, descriptor)?;
    }
    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "dropped code compiled by another code generator");
    }
    Ok(current)
}

pub(crate) fn free_code_storage(
    allocator: &mut CacheAllocator<'_>,
    descriptor: &CodeDescriptor,
) -> Result<(), CacheError> {
    allocator.deallocate(descriptor.code_begin)?;
    allocator.deallocate(descriptor.initdata_begin)
}

/// Persists `descriptors` (least recently used first) and marks the file
/// clean.
///
/// `orphans` are entries whose storage is still allocated but which are no
/// longer indexed. When the index does not fit, the oldest entries are
/// dropped [`EVICTION_BATCH`] at a time.
pub(crate) fn close_cache_file(
    file: &File,
    mut descriptors: Vec<CodeDescriptor>,
    orphans: &[CodeDescriptor],
) -> Result<(), CacheError> {
    // SAFETY: the compile monitor session has ended, no one else maps the file.
    let mut map = unsafe { MmapMut::map_mut(file)? };
    let mut header = CodeCacheHeader::read(&map);
    {
        let mut allocator = CacheAllocator::open(&mut map)?;
        for descriptor in orphans {
            free_code_storage(&mut allocator, descriptor)?;
        }
        header.serialized_descriptor_index = loop {
            let serialized = bincode::serialize(&descriptors)
                .map_err(|e| CacheError::Corrupt(format!("descriptor index: {e}")))?;
            if let Some(offset) = allocator.allocate(serialized.len() as u64) {
                allocator.write_allocation(offset, &serialized)?;
                break offset;
            }
            if descriptors.is_empty() {
                break 0;
            }
            let n = descriptors.len().min(EVICTION_BATCH);
            for descriptor in descriptors.drain(..n) {
                free_code_storage(&mut allocator, &descriptor)?;
            }
        };
    }
    map.flush()?;
    header.dirty = false;
    header.write(&mut map);
    map.flush()?;
    tracing::debug!(entries = descriptors.len(), "persisted code cache index");
    Ok(())
}
