// In-process mock target
// Stands in for the external emulator in tests: a named register file,
// mapped memory regions (RAM or peripheral-backed), breakpoints, an
// interpreter for the assembler subset the stubs use, and a script of
// "TZOS actions" that model what the opaque secure-world binary would do
// between two stops.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::asm::{self, Insn};
use crate::memory_map::MemoryLayout;
use crate::peripherals::PeripheralHandle;
use crate::target::{Target, TargetState};
use crate::{CoreError, Result};

// Upper bound on instructions executed per cont(); once exceeded, control is
// treated as having left instrumented code.
const INTERPRETER_STEP_LIMIT: usize = 4096;

enum Backing {
    Ram(Vec<u8>),
    Peripheral(PeripheralHandle),
}

struct Region {
    base: u64,
    size: u64,
    backing: Backing,
}

impl Region {
    fn contains(&self, address: u64, size: usize) -> bool {
        address >= self.base && address + size as u64 <= self.base + self.size
    }
}

/// Register file and memory of the mock target, handed to script actions.
#[derive(Default)]
pub struct MockCpu {
    registers: HashMap<String, u64>,
    regions: Vec<Region>,
    breakpoints: HashSet<u64>,
}

impl MockCpu {
    /// Current value of a register; unset registers read as zero.
    pub fn reg(&self, name: &str) -> u64 {
        self.registers.get(name).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, name: &str, value: u64) {
        self.registers.insert(name.to_string(), value);
    }

    pub fn read_mem(&mut self, address: u64, size: usize) -> Result<Vec<u8>> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(address, size))
            .ok_or(CoreError::MemoryAccess { address, size })?;
        match &mut region.backing {
            Backing::Ram(data) => {
                let offset = (address - region.base) as usize;
                Ok(data[offset..offset + size].to_vec())
            }
            Backing::Peripheral(handle) => {
                handle.lock().expect("peripheral lock").read(address, size)
            }
        }
    }

    pub fn write_mem(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(address, data.len()))
            .ok_or(CoreError::MemoryAccess { address, size: data.len() })?;
        match &mut region.backing {
            Backing::Ram(ram) => {
                let offset = (address - region.base) as usize;
                ram[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Backing::Peripheral(handle) => {
                handle.lock().expect("peripheral lock").write(address, data)
            }
        }
    }

    pub fn has_breakpoint(&self, address: u64) -> bool {
        self.breakpoints.contains(&address)
    }

    /// Little-endian integer read, for script actions inspecting structs.
    pub fn read_mem_word(&mut self, address: u64, size: usize) -> Result<u64> {
        let bytes = self.read_mem(address, size)?;
        let mut padded = [0u8; 8];
        padded[..bytes.len()].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(padded))
    }

    fn fetch(&mut self, pc: u64) -> Option<Insn> {
        let bytes = self.read_mem(pc, 4).ok()?;
        let word = u32::from_le_bytes(bytes.try_into().ok()?);
        asm::decode(word)
    }

    // Executes one decoded instruction; MSR to a register outside the shared
    // sysreg table counts as undecodable.
    fn execute(&mut self, insn: Insn) -> Option<()> {
        let pc = self.reg("pc");
        match insn {
            Insn::Eret => {
                let spsr = self.reg("spsr_el3");
                let elr = self.reg("elr_el3");
                self.set_reg("cpsr", spsr);
                self.set_reg("pc", elr);
            }
            Insn::Nop => self.set_reg("pc", pc + 4),
            Insn::Msr { reg, rt } => {
                let name = asm::sysreg_name(reg)?;
                let value = self.reg(&format!("x{rt}"));
                self.set_reg(name, value);
                self.set_reg("pc", pc + 4);
            }
            Insn::Movz { rd, imm16, shift } => {
                self.set_reg(&format!("x{rd}"), u64::from(imm16) << shift);
                self.set_reg("pc", pc + 4);
            }
            Insn::Movk { rd, imm16, shift } => {
                let name = format!("x{rd}");
                let mask = 0xFFFFu64 << shift;
                let value = (self.reg(&name) & !mask) | (u64::from(imm16) << shift);
                self.set_reg(&name, value);
                self.set_reg("pc", pc + 4);
            }
        }
        Some(())
    }
}

/// A scripted TZOS action: runs against the CPU state when execution leaves
/// instrumented code, and typically parks the pc back on the SMC entry.
pub type ScriptAction = Box<dyn FnMut(&mut MockCpu) -> Result<()> + Send>;

/// Mock implementation of [`Target`].
///
/// Resume semantics: the instruction at the resume point always executes
/// (its stop has already been reported; writing the pc register counts as
/// establishing a resume point), and breakpoints pause execution when
/// reached after that.
pub struct MockTarget {
    cpu: MockCpu,
    script: VecDeque<ScriptAction>,
    state: TargetState,
    resume_pc: Option<u64>,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    pub fn new() -> Self {
        Self {
            cpu: MockCpu::default(),
            script: VecDeque::new(),
            state: TargetState::Stopped,
            resume_pc: None,
        }
    }

    /// Map a zero-initialized RAM region.
    pub fn map_ram(&mut self, base: u64, size: u64) {
        self.cpu.regions.push(Region {
            base,
            size,
            backing: Backing::Ram(vec![0; size as usize]),
        });
    }

    /// Map a region serviced by a host-side peripheral.
    pub fn map_peripheral(&mut self, base: u64, size: u64, peripheral: PeripheralHandle) {
        self.cpu.regions.push(Region {
            base,
            size,
            backing: Backing::Peripheral(peripheral),
        });
    }

    /// Map every range of a layout: backed ranges keep their peripheral,
    /// plain ranges become RAM.
    pub fn map_layout(&mut self, layout: &MemoryLayout) {
        for range in layout.ranges() {
            match &range.backing {
                Some(peripheral) => {
                    self.map_peripheral(range.address, range.size, peripheral.clone());
                }
                None => self.map_ram(range.address, range.size),
            }
        }
    }

    /// Append a TZOS action to the script.
    pub fn push_action<F>(&mut self, action: F)
    where
        F: FnMut(&mut MockCpu) -> Result<()> + Send + 'static,
    {
        self.script.push_back(Box::new(action));
    }

    /// Direct CPU access for test assertions.
    pub fn cpu(&mut self) -> &mut MockCpu {
        &mut self.cpu
    }

    fn require_stopped(&self, operation: &'static str) -> Result<()> {
        if self.state != TargetState::Stopped {
            return Err(CoreError::TargetNotStopped {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn stop_at_current_pc(&mut self) {
        self.state = TargetState::Stopped;
        self.resume_pc = Some(self.cpu.reg("pc"));
    }

    fn leave_instrumented_code(&mut self) -> Result<()> {
        match self.script.pop_front() {
            Some(mut action) => {
                action(&mut self.cpu)?;
                self.stop_at_current_pc();
                Ok(())
            }
            None => {
                log::debug!("mock target script exhausted, exiting");
                self.state = TargetState::Exited;
                Ok(())
            }
        }
    }
}

impl Target for MockTarget {
    fn read_register(&mut self, name: &str) -> Result<u64> {
        Ok(self.cpu.reg(name))
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.require_stopped("write_register")?;
        if name == "pc" {
            self.resume_pc = Some(value);
        }
        self.cpu.set_reg(name, value);
        Ok(())
    }

    fn read_memory(&mut self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.cpu.read_mem(address, size)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.require_stopped("write_memory")?;
        self.cpu.write_mem(address, data)
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<()> {
        self.require_stopped("set_breakpoint")?;
        self.cpu.breakpoints.insert(address);
        Ok(())
    }

    fn remove_breakpoint(&mut self, address: u64) -> Result<()> {
        self.require_stopped("remove_breakpoint")?;
        self.cpu.breakpoints.remove(&address);
        Ok(())
    }

    fn cont(&mut self) -> Result<()> {
        if self.state == TargetState::Exited {
            return Err(CoreError::TargetExited);
        }
        self.require_stopped("cont")?;
        self.state = TargetState::Running;

        let mut allow_current = self.resume_pc == Some(self.cpu.reg("pc"));
        for _ in 0..INTERPRETER_STEP_LIMIT {
            let pc = self.cpu.reg("pc");
            if self.cpu.breakpoints.contains(&pc) && !allow_current {
                self.stop_at_current_pc();
                return Ok(());
            }
            allow_current = false;

            match self.cpu.fetch(pc) {
                Some(insn) => {
                    if self.cpu.execute(insn).is_none() {
                        return self.leave_instrumented_code();
                    }
                }
                None => return self.leave_instrumented_code(),
            }
        }
        self.leave_instrumented_code()
    }

    fn wait(&mut self) -> Result<()> {
        // cont() and step() are synchronous, there is nothing to wait for
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.require_stopped("step")?;
        let pc = self.cpu.reg("pc");
        let insn = self
            .cpu
            .fetch(pc)
            .ok_or(CoreError::MemoryAccess { address: pc, size: 4 })?;
        self.cpu
            .execute(insn)
            .ok_or(CoreError::MemoryAccess { address: pc, size: 4 })?;
        self.resume_pc = Some(self.cpu.reg("pc"));
        Ok(())
    }

    fn state(&self) -> TargetState {
        self.state
    }
}
