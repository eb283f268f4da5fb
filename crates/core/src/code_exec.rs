// Temporary code execution
// Some state (EL3 system registers, most notably) cannot be written through
// the debug protocol. This helper keeps a dedicated code region around,
// fills it with just-in-time assembled instructions and runs them under a
// temporary breakpoint, leaving no other trace on the target.

use std::thread;
use std::time::Duration;

use crate::asm;
use crate::peripherals::SharedBuffer;
use crate::target::TargetState;
use crate::{CoreError, Result, TargetHandle};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Block until the target reports stopped, tolerating debug-protocol races
/// where the state change trails the stop event.
pub fn wait_until_stopped(target: &TargetHandle) -> Result<()> {
    loop {
        let state = target.lock().expect("target lock").state();
        match state {
            TargetState::Stopped => return Ok(()),
            TargetState::Exited => return Err(CoreError::TargetExited),
            TargetState::Running => thread::sleep(STATE_POLL_INTERVAL),
        }
    }
}

/// Runs the code currently stored in the execution region.
///
/// Does not store any pre-execution state besides the pc; callers that
/// clobber registers must back them up themselves.
struct SafeCodeExecutor {
    target: TargetHandle,
    region_address: u64,
    code_size: usize,
    old_pc: Option<u64>,
}

impl SafeCodeExecutor {
    fn breakpoint_location(&self) -> u64 {
        // one instruction before the end of the stored code
        self.region_address + self.code_size as u64 - 4
    }

    fn enter(&mut self) -> Result<()> {
        wait_until_stopped(&self.target)?;
        let mut target = self.target.lock().expect("target lock");
        self.old_pc = Some(target.read_register("pc")?);
        target.write_register("pc", self.region_address)?;
        target.set_breakpoint(self.breakpoint_location())?;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        {
            let mut target = self.target.lock().expect("target lock");
            target.cont()?;
            target.wait()?;
        }
        wait_until_stopped(&self.target)?;
        // suspended one instruction short of the end; step once so the final
        // instruction actually executes
        self.target.lock().expect("target lock").step()
    }

    fn exit(&mut self) -> Result<()> {
        let old_pc = self.old_pc.expect("enter ran");
        wait_until_stopped(&self.target)?;
        let mut target = self.target.lock().expect("target lock");
        target.write_register("pc", old_pc)?;
        target.remove_breakpoint(self.breakpoint_location())?;
        Ok(())
    }
}

/// Maps and manages a memory region used to run just-in-time assembled code.
pub struct TemporaryCodeExecutionHelper {
    target: TargetHandle,
    buffer: SharedBuffer,
    code_size: usize,
}

impl TemporaryCodeExecutionHelper {
    /// `buffer` is the host-visible peripheral backing the execution region;
    /// it must be mapped executable on the target.
    pub fn new(target: TargetHandle, buffer: SharedBuffer) -> Self {
        Self {
            target,
            buffer,
            code_size: 0,
        }
    }

    pub fn region_address(&self) -> u64 {
        self.buffer.lock().expect("buffer lock").address()
    }

    /// Assemble AArch64 code and store it in the execution region.
    ///
    /// A trailing `nop` landing pad is appended so the temporary breakpoint
    /// always sits after the payload instructions.
    pub fn assemble_and_store(&mut self, code: &str) -> Result<()> {
        let mut assembly = asm::aarch64_asm(code)?;
        assembly.extend_from_slice(&asm::aarch64_asm("nop")?);
        self.code_size = assembly.len();
        self.buffer
            .lock()
            .expect("buffer lock")
            .write_at_base(&assembly)
    }

    /// Execute the stored code; on return the pc and the temporary
    /// breakpoint are restored/removed, even if execution failed.
    pub fn run_stored_code(&mut self) -> Result<()> {
        assert!(self.code_size > 0, "no code stored in execution region");

        let mut executor = SafeCodeExecutor {
            target: self.target.clone(),
            region_address: self.region_address(),
            code_size: self.code_size,
            old_pc: None,
        };

        executor.enter()?;
        let run_result = executor.run();
        let exit_result = executor.exit();
        run_result.and(exit_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_target::MockTarget;
    use crate::peripherals::in_memory_buffer;
    use std::sync::{Arc, Mutex};

    fn setup() -> (Arc<Mutex<MockTarget>>, TemporaryCodeExecutionHelper) {
        let buffer = in_memory_buffer("temp_code_execution", 0x90000, 0x1000);
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        mock.lock().unwrap().map_peripheral(0x90000, 0x1000, buffer.clone());
        let handle: TargetHandle = mock.clone();
        let helper = TemporaryCodeExecutionHelper::new(handle, buffer);
        (mock, helper)
    }

    #[test]
    fn test_stored_code_executes_and_restores_pc() {
        let (mock, mut helper) = setup();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("pc", 0x400);
            mock.cpu().set_reg("x0", 0x600003C4);
        }

        helper.assemble_and_store("msr spsr_el3, x0").unwrap();
        helper.run_stored_code().unwrap();

        let mut mock = mock.lock().unwrap();
        assert_eq!(mock.cpu().reg("spsr_el3"), 0x600003C4);
        assert_eq!(mock.cpu().reg("pc"), 0x400);
        // the temporary breakpoint (at the landing pad) is gone again
        assert!(!mock.cpu().has_breakpoint(0x90004));
    }

    #[test]
    fn test_multi_instruction_payload() {
        let (mock, mut helper) = setup();
        mock.lock().unwrap().cpu().set_reg("pc", 0x400);

        helper
            .assemble_and_store("movz x3, #0xbeef\nmovk x3, #0xdead, lsl #16\nmsr elr_el3, x3")
            .unwrap();
        helper.run_stored_code().unwrap();

        let mut mock = mock.lock().unwrap();
        assert_eq!(mock.cpu().reg("elr_el3"), 0xDEAD_BEEF);
        assert_eq!(mock.cpu().reg("pc"), 0x400);
    }
}
