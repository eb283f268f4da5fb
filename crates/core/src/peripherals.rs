// Memory peripherals
// Backing stores for mapped memory regions. An in-memory buffer is
// addressable both by the emulated CPU and directly by the host, which makes
// it the natural carrier for the world-shared command memory. A forwarder
// proxies loads and stores to another target at a translated address.

use std::sync::{Arc, Mutex};

use crate::{CoreError, Result, TargetHandle};

/// A peripheral servicing loads/stores for one mapped region.
///
/// Addresses are absolute; implementations translate to their own backing.
pub trait MemoryPeripheral {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;
}

/// Shared handle to a peripheral, cloned into every party that maps it.
pub type PeripheralHandle = Arc<Mutex<dyn MemoryPeripheral + Send>>;

/// A contiguous byte buffer of fixed size backing a mapped region.
///
/// Readable and writable directly from the host without going through a
/// target's memory interface, which is both faster and possible before any
/// target exists.
pub struct InMemoryBuffer {
    name: String,
    address: u64,
    data: Vec<u8>,
}

impl InMemoryBuffer {
    pub fn new(name: &str, address: u64, size: usize) -> Self {
        Self {
            name: name.to_string(),
            address,
            data: vec![0; size],
        }
    }

    /// Base address of the mapped region.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read at a buffer-relative offset; reads past the end are zero-padded.
    pub fn read_at(&self, offset: usize, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        if offset < self.data.len() {
            let available = (self.data.len() - offset).min(size);
            out[..available].copy_from_slice(&self.data[offset..offset + available]);
        }
        out
    }

    /// Write at a buffer-relative offset; must stay within the buffer.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len());
        match end {
            Some(end) if end <= self.data.len() => {
                self.data[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(CoreError::MemoryAccess {
                address: self.address + offset as u64,
                size: data.len(),
            }),
        }
    }

    /// Write data directly at the start of the buffer.
    pub fn write_at_base(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(0, data)
    }

    fn offset_of(&self, address: u64, size: usize) -> Result<usize> {
        if address < self.address {
            return Err(CoreError::MemoryAccess { address, size });
        }
        Ok((address - self.address) as usize)
    }
}

impl MemoryPeripheral for InMemoryBuffer {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>> {
        let offset = self.offset_of(address, size)?;
        let data = self.read_at(offset, size);
        log::trace!(
            "read \"{}\" address={address:#x} offset={offset:#x} size={size:#x}",
            self.name
        );
        Ok(data)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let offset = self.offset_of(address, data.len())?;
        log::trace!(
            "write \"{}\" address={address:#x} offset={offset:#x} size={:#x}",
            self.name,
            data.len()
        );
        self.write_at(offset, data)
    }
}

/// Shared in-memory buffer, the common way the buffer is held.
pub type SharedBuffer = Arc<Mutex<InMemoryBuffer>>;

/// Create a new shared in-memory buffer peripheral.
pub fn in_memory_buffer(name: &str, address: u64, size: usize) -> SharedBuffer {
    Arc::new(Mutex::new(InMemoryBuffer::new(name, address, size)))
}

/// Forwards memory accesses to another target's memory.
///
/// Useful when the destination memory is only reachable through virtual
/// addresses on that target: accesses at `base + off` land at
/// `destination_virtual_base + off`.
pub struct MemoryForwarder {
    name: String,
    base: u64,
    destination_virtual_base: u64,
    destination: TargetHandle,
}

impl MemoryForwarder {
    pub fn new(
        name: &str,
        base: u64,
        destination_virtual_base: u64,
        destination: TargetHandle,
    ) -> Self {
        Self {
            name: name.to_string(),
            base,
            destination_virtual_base,
            destination,
        }
    }

    fn translate(&self, address: u64) -> u64 {
        address - self.base + self.destination_virtual_base
    }
}

impl MemoryPeripheral for MemoryForwarder {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>> {
        let translated = self.translate(address);
        log::trace!("forward-read \"{}\" {address:#x} -> {translated:#x}", self.name);
        self.destination
            .lock()
            .expect("destination target lock")
            .read_memory(translated, size)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let translated = self.translate(address);
        log::trace!("forward-write \"{}\" {address:#x} -> {translated:#x}", self.name);
        self.destination
            .lock()
            .expect("destination target lock")
            .write_memory(translated, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_round_trip() {
        let mut buffer = InMemoryBuffer::new("shm", 0x1000, 0x100);
        buffer.write_at(0x10, b"hello").unwrap();
        assert_eq!(buffer.read_at(0x10, 5), b"hello");
    }

    #[test]
    fn test_read_past_end_zero_padded() {
        let mut buffer = InMemoryBuffer::new("shm", 0x1000, 8);
        buffer.write_at_base(&[0xAA; 8]).unwrap();
        let data = buffer.read_at(4, 8);
        assert_eq!(&data[..4], &[0xAA; 4]);
        assert_eq!(&data[4..], &[0u8; 4]);
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut buffer = InMemoryBuffer::new("shm", 0x1000, 8);
        assert!(matches!(
            buffer.write_at(6, &[0; 4]),
            Err(CoreError::MemoryAccess { .. })
        ));
    }

    #[test]
    fn test_absolute_addressing() {
        let mut buffer = InMemoryBuffer::new("shm", 0x2000, 0x40);
        buffer.write(0x2008, &0x1122_3344u32.to_le_bytes()).unwrap();
        assert_eq!(buffer.read(0x2008, 4).unwrap(), 0x1122_3344u32.to_le_bytes());
        assert!(buffer.read(0x1FFF, 4).is_err());
    }

    #[test]
    fn test_forwarder_translates_to_destination() {
        use crate::mock_target::MockTarget;
        use std::sync::Mutex;

        let destination = Arc::new(Mutex::new(MockTarget::new()));
        destination.lock().unwrap().map_ram(0x12C0_0000, 0x1000);

        let mut forwarder = MemoryForwarder::new(
            "shared_mem",
            0x4200_0000,
            0x12C0_0000,
            destination.clone(),
        );
        forwarder.write(0x4200_0010, b"ping").unwrap();

        let mut destination = destination.lock().unwrap();
        assert_eq!(destination.cpu().read_mem(0x12C0_0010, 4).unwrap(), b"ping");
        drop(destination);
        assert_eq!(forwarder.read(0x4200_0010, 4).unwrap(), b"ping");
    }
}
