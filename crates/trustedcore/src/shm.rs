// Shared-memory bump manager
// TrustedCore commands reference UUIDs and operation blocks by physical
// address, so the host needs a place inside the shared-memory window to
// park those blobs. A plain bump allocator writing through the host-side
// buffer is sufficient; between command cycles the region is reset
// wholesale.

use teehost_core::peripherals::SharedBuffer;
use teehost_core::Result;

// keep clear of the command queue at the start of the window
const BLOB_REGION_OFFSET: u64 = 0x10000;

pub struct SharedMemoryManager {
    shared_memory: SharedBuffer,
    start_address: u64,
    next_unused_address: u64,
}

impl SharedMemoryManager {
    pub fn new(shared_memory: SharedBuffer) -> Self {
        let base = shared_memory.lock().expect("shared memory lock").address();
        let start_address = base + BLOB_REGION_OFFSET;
        Self {
            shared_memory,
            start_address,
            next_unused_address: start_address,
        }
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// Store `data` in the blob region and return its address.
    pub fn allocate(&mut self, data: &[u8]) -> Result<u64> {
        let address = self.next_unused_address;
        let base = {
            let mut buffer = self.shared_memory.lock().expect("shared memory lock");
            let base = buffer.address();
            buffer.write_at((address - base) as usize, data)?;
            base
        };
        log::debug!(
            "allocated {:#x} byte(s) at {address:#x} (offset {:#x})",
            data.len(),
            address - base
        );
        self.next_unused_address += data.len() as u64;
        Ok(address)
    }

    /// Forget all allocations; used between command cycles.
    pub fn reset(&mut self) {
        self.next_unused_address = self.start_address;
    }
}
