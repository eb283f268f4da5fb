// Target abstraction
// A target is an emulated (or remote) CPU reachable through a debug
// protocol: named registers, byte-addressable memory, breakpoints and
// execution control. The emulator process itself lives outside this crate;
// everything here talks to it through this trait only.

use crate::Result;

/// Execution state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Stopped,
    Exited,
}

/// Debug-protocol abstraction over an emulated CPU.
///
/// All mutating operations require the target to be stopped; `cont`
/// transitions it to running, and it becomes stopped again at a breakpoint,
/// a completed step, or a fault. Addresses are target-physical.
pub trait Target {
    fn read_register(&mut self, name: &str) -> Result<u64>;

    fn write_register(&mut self, name: &str, value: u64) -> Result<()>;

    /// Read `size` raw bytes starting at `address`.
    fn read_memory(&mut self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Write raw bytes starting at `address`.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Read a little-endian integer of 1..=8 bytes.
    fn read_word(&mut self, address: u64, size: usize) -> Result<u64> {
        let bytes = self.read_memory(address, size)?;
        let mut padded = [0u8; 8];
        padded[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        Ok(u64::from_le_bytes(padded))
    }

    /// Write a little-endian integer of 1..=8 bytes.
    fn write_word(&mut self, address: u64, size: usize, value: u64) -> Result<()> {
        self.write_memory(address, &value.to_le_bytes()[..size.min(8)])
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<()>;

    fn remove_breakpoint(&mut self, address: u64) -> Result<()>;

    /// Resume execution. Returns once the target has halted again.
    fn cont(&mut self) -> Result<()>;

    /// Block until the target has halted (breakpoint, step or exit).
    fn wait(&mut self) -> Result<()>;

    /// Execute a single instruction.
    fn step(&mut self) -> Result<()>;

    fn state(&self) -> TargetState;
}
