// Memory layout description
// Named, non-overlapping ranges making up the address space a rehosted TZOS
// sees. The layout is configuration for whoever owns the emulator process;
// the mock target consumes it directly in tests.

use serde::{Deserialize, Serialize};

use crate::peripherals::PeripheralHandle;
use crate::{CoreError, Result};

/// Access permissions of a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const RW: Self = Self { read: true, write: true, execute: false };
    pub const RX: Self = Self { read: true, write: false, execute: true };
    pub const RWX: Self = Self { read: true, write: true, execute: true };
}

/// One mapped range. `backing` is present when the range is serviced by a
/// host-side peripheral rather than plain emulator RAM.
#[derive(Clone, Serialize, Deserialize)]
pub struct MemoryRange {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub permissions: Permissions,
    #[serde(skip)]
    pub backing: Option<PeripheralHandle>,
}

impl std::fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRange")
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &format_args!("{:#x}", self.size))
            .field("backed", &self.backing.is_some())
            .finish()
    }
}

impl MemoryRange {
    pub fn ram(name: &str, address: u64, size: u64, permissions: Permissions) -> Self {
        Self {
            name: name.to_string(),
            address,
            size,
            permissions,
            backing: None,
        }
    }

    pub fn backed(
        name: &str,
        address: u64,
        size: u64,
        permissions: Permissions,
        backing: PeripheralHandle,
    ) -> Self {
        Self {
            name: name.to_string(),
            address,
            size,
            permissions,
            backing: Some(backing),
        }
    }

    fn overlaps(&self, other: &MemoryRange) -> bool {
        self.address < other.address + other.size && other.address < self.address + self.size
    }
}

/// The full set of ranges for one rehosted machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryLayout {
    ranges: Vec<MemoryRange>,
}

impl MemoryLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range, rejecting overlaps with anything already mapped.
    pub fn add(&mut self, range: MemoryRange) -> Result<()> {
        if self.ranges.iter().any(|r| r.overlaps(&range)) {
            return Err(CoreError::OverlappingRange {
                name: range.name,
                address: range.address,
            });
        }
        log::debug!(
            "mapping \"{}\" at {:#x} (size {:#x})",
            range.name,
            range.address,
            range.size
        );
        self.ranges.push(range);
        Ok(())
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    pub fn find(&self, name: &str) -> Option<&MemoryRange> {
        self.ranges.iter().find(|r| r.name == name)
    }
}
