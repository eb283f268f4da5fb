// Non-secure shared memory management
// OP-TEE lets the normal world allocate ranges inside a memory window that
// is hardcoded in the TZOS binary; addresses outside it earn unhelpful
// secure-world errors. This manager hands out page-aligned ranges from that
// window. Plain bookkeeping only: the caller makes sure the window is
// actually mapped.

use std::collections::HashMap;

use teehost_core::{CoreError, Result};

const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Page-aligned bump allocator over the non-secure shared memory window.
///
/// Freed ranges are never reused; allocation only ever appends. Good enough
/// for rehosting sessions, but a free list would be needed for anything
/// long-running.
pub struct NonSecureSharedMemoryManager {
    start_address: u64,
    page_size: u64,
    // physical start address -> allocation size in bytes
    memory_map: HashMap<u64, u64>,
    next_allocation_address: u64,
}

impl NonSecureSharedMemoryManager {
    pub fn new(start_address: u64) -> Self {
        Self::with_page_size(start_address, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(start_address: u64, page_size: u64) -> Self {
        Self {
            start_address,
            page_size,
            memory_map: HashMap::new(),
            next_allocation_address: start_address,
        }
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// Allocate pages; the returned address is page-aligned by
    /// construction.
    pub fn allocate_pages(&mut self, num_pages: u64) -> u64 {
        let address = self.next_allocation_address;
        let size = num_pages * self.page_size;
        log::debug!(
            "allocating {num_pages:#x} page(s) (size: {size:#x} bytes, address: {address:#x})"
        );
        self.memory_map.insert(address, size);
        self.next_allocation_address += size;
        address
    }

    /// Allocate a range of at least `num_bytes`, rounded up to whole pages.
    pub fn allocate_bytes(&mut self, num_bytes: u64) -> u64 {
        let num_pages = num_bytes.div_ceil(self.page_size);
        log::debug!("allocating {num_bytes:#x} bytes (requires {num_pages:#x} pages)");
        self.allocate_pages(num_pages)
    }

    /// Release a previously allocated range. The range is only forgotten,
    /// not recycled.
    pub fn free(&mut self, address: u64) -> Result<()> {
        log::debug!("freeing memory range at address {address:#x}");
        self.memory_map
            .remove(&address)
            .map(|_| ())
            .ok_or(CoreError::MemoryRangeNotFound { address })
    }

    /// Size of the allocation starting at `address`, if any.
    pub fn allocation_size(&self, address: u64) -> Option<u64> {
        self.memory_map.get(&address).copied()
    }
}
