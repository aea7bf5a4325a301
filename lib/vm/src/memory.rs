//! The sliced virtual memory layout a thread runs contracts in.
//!
//! A memory reserves `sliced_pages + 1` slices of
//! [`TOTAL_MEMORY_PER_SLICE`] bytes each. Slice `p` maps the shared
//! prologue followed by `p` wasm pages, all backed by the same memfd at
//! offset 0, so every slice sees the same control block, globals, table,
//! jump table and linear memory content. Everything past the mapped part
//! of a slice stays inaccessible.
//!
//! Running with `n` pages means using the base of slice `n`: any access at
//! or beyond `n` pages faults without a bounds check in generated code.
use crate::control_block::ControlBlock;
use crate::error::MemoryError;
use crate::intrinsics;
use more_asserts::debug_assert_ge;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr;
use sysvmoc_ipc::create_memfd;
use sysvmoc_types::constraints::{MAXIMUM_LINEAR_MEMORY_PAGES, WASM_PAGE_SIZE};
use sysvmoc_types::memory_layout::{
    intrinsic_offset, MEMORY_PROLOGUE_SIZE, TOTAL_MEMORY_PER_SLICE,
};

/// Distance between the bases of two consecutive slices.
pub const STRIDE: u64 = TOTAL_MEMORY_PER_SLICE;

/// The memory slices of one executing thread.
#[derive(Debug)]
pub struct Memory {
    // Addresses are kept as `usize` so the struct is `Send` and `Sync`;
    // the mapping is owned and only touched by the thread executing in it.
    mapbase: usize,
    mapsize: usize,
    sliced_pages: u64,
    backing: File,
}

impl Memory {
    /// Reserves and maps slices for up to `sliced_pages` pages.
    ///
    /// Threads that only run read-only transactions use a small count and
    /// grow past it with private pages, see
    /// [`SLICED_PAGES_FOR_RO_THREAD`](sysvmoc_types::memory_layout::SLICED_PAGES_FOR_RO_THREAD).
    pub fn new(sliced_pages: u64) -> Result<Self, MemoryError> {
        if sliced_pages > MAXIMUM_LINEAR_MEMORY_PAGES {
            return Err(MemoryError::TooManyPages {
                requested: sliced_pages,
                maximum: MAXIMUM_LINEAR_MEMORY_PAGES,
            });
        }
        let wasm_memory_size = sliced_pages * WASM_PAGE_SIZE;

        let backing = File::from(create_memfd(c"sysvmoc_memory").map_err(MemoryError::Backing)?);
        backing
            .set_len(wasm_memory_size + MEMORY_PROLOGUE_SIZE)
            .map_err(MemoryError::Backing)?;

        let mapsize = (TOTAL_MEMORY_PER_SLICE * (sliced_pages + 1)) as usize;
        // SAFETY: a fresh anonymous reservation, nothing else refers to it.
        let mapbase = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapsize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mapbase == libc::MAP_FAILED {
            return Err(MemoryError::Reserve {
                size: mapsize,
                source: io::Error::last_os_error(),
            });
        }
        let memory = Self {
            mapbase: mapbase as usize,
            mapsize,
            sliced_pages,
            backing,
        };

        for slice in 0..=sliced_pages {
            let start = memory.mapbase + (slice * TOTAL_MEMORY_PER_SLICE) as usize;
            let length = (MEMORY_PROLOGUE_SIZE + slice * WASM_PAGE_SIZE) as usize;
            // SAFETY: the range lies inside our reservation.
            let mapped = unsafe {
                libc::mmap(
                    start as *mut libc::c_void,
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    memory.backing.as_raw_fd(),
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(MemoryError::MapSlice {
                    slice,
                    source: io::Error::last_os_error(),
                });
            }
        }

        for (ordinal, address) in intrinsics::jump_table().into_iter().enumerate() {
            let slot = memory
                .zero_page_memory_base()
                .wrapping_sub(intrinsic_offset(ordinal) as usize);
            // SAFETY: the jump table lies inside the mapped prologue.
            unsafe { slot.cast::<usize>().write(address) };
        }

        tracing::debug!(
            sliced_pages,
            reserved = mapsize,
            "created memory slices"
        );
        Ok(memory)
    }

    /// Base of linear memory while no page is granted.
    pub fn zero_page_memory_base(&self) -> *mut u8 {
        (self.mapbase + MEMORY_PROLOGUE_SIZE as usize) as *mut u8
    }

    /// Base of the slice granting every sliced page.
    pub fn full_page_memory_base(&self) -> *mut u8 {
        self.memory_base_for_pages(self.sliced_pages)
    }

    /// Base to run with when `pages` pages are granted.
    ///
    /// Past the sliced pages the base stays at
    /// [`Memory::full_page_memory_base`] and the extra pages have to be
    /// made accessible explicitly.
    pub fn memory_base_for_pages(&self, pages: u64) -> *mut u8 {
        let slice = pages.min(self.sliced_pages);
        self.zero_page_memory_base()
            .wrapping_add((slice * STRIDE) as usize)
    }

    /// The control block, shared by every slice.
    pub fn control_block(&self) -> *mut ControlBlock {
        ControlBlock::locate(self.zero_page_memory_base())
    }

    /// Start of the whole reservation.
    pub fn start_of_memory_slices(&self) -> *mut u8 {
        self.mapbase as *mut u8
    }

    /// Size of the whole reservation.
    pub fn size_of_memory_slice_mapping(&self) -> usize {
        self.mapsize
    }

    /// Number of pages reachable by moving between slices.
    pub fn sliced_pages(&self) -> u64 {
        self.sliced_pages
    }

    /// `true` if `address` lies within the reservation.
    pub fn contains(&self, address: usize) -> bool {
        (self.mapbase..self.mapbase + self.mapsize).contains(&address)
    }

    /// Start and byte length of pages `[from, to)` of the full page slice.
    fn private_pages(&self, from: u64, to: u64) -> (*mut u8, usize) {
        let start = self
            .full_page_memory_base()
            .wrapping_add((from * WASM_PAGE_SIZE) as usize);
        (start, ((to - from) * WASM_PAGE_SIZE) as usize)
    }

    /// Makes pages `[from, to)` accessible, where `from` is at least the
    /// number of sliced pages. These pages are private to the process and
    /// start out zeroed.
    pub(crate) fn unprotect_private_pages(&self, from: u64, to: u64) -> Result<(), region::Error> {
        debug_assert_ge!(from, self.sliced_pages);
        debug_assert_ge!(to, from);
        let (start, len) = self.private_pages(from, to);
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the pages are inside the reservation of the last slice.
        unsafe { region::protect(start as *const u8, len, region::Protection::READ_WRITE) }
    }

    /// Drops the content of every private page below `pages` and makes
    /// them inaccessible again.
    pub(crate) fn reset_private_pages(&self, pages: u64) -> Result<(), region::Error> {
        if pages <= self.sliced_pages {
            return Ok(());
        }
        let (start, len) = self.private_pages(self.sliced_pages, pages);
        // SAFETY: as above, and no native code is running.
        unsafe {
            libc::madvise(start.cast(), len, libc::MADV_DONTNEED);
            region::protect(start as *const u8, len, region::Protection::NONE)
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // SAFETY: the reservation is ours and nothing points into it anymore.
        let r = unsafe { libc::munmap(self.mapbase as *mut libc::c_void, self.mapsize) };
        debug_assert_eq!(r, 0, "munmap failed when dropping memory slices");
    }
}
