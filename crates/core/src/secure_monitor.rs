// Secure-monitor emulator
// The emulator does not model EL3, so SMCs issued by the TZOS land on a
// stub at a known entry address. This handler plays the secure monitor's
// role: it classifies the SMC by function identifier and either replies
// locally, memorizes the boot handshake, or hands the call to the
// normal-world TEE driver emulation.

use std::sync::Arc;

use crate::context::RehostingContext;
use crate::runner::BreakpointHandler;
use crate::{Result, RunEvent};

/// Normal-world emulation invoked for every "call into normal world" SMC.
///
/// Returning an event completes the in-flight TZOS command without touching
/// the return path; returning `None` lets the secure monitor set up the
/// eret back into the TZOS.
pub trait TeeDriverEmulator {
    fn handle_rpc(&mut self) -> Result<Option<RunEvent>>;
}

/// Breakpoint handler installed on the SMC entry address.
pub struct SecureMonitorEmulator {
    context: Arc<RehostingContext>,
    tee_driver: Box<dyn TeeDriverEmulator + Send>,
}

impl SecureMonitorEmulator {
    pub fn new(
        context: Arc<RehostingContext>,
        tee_driver: Box<dyn TeeDriverEmulator + Send>,
    ) -> Self {
        Self { context, tee_driver }
    }

    // Up to 7 arguments arrive in x0-x6 and results return in x0-x3; the
    // function identifier is always in x0.
    fn read_function_identifier(&self) -> Result<u64> {
        self.context
            .target()
            .lock()
            .expect("target lock")
            .read_register("x0")
    }

    fn handle_default_smc(&mut self) -> Result<Option<RunEvent>> {
        self.context.write_smc_return_assembly("eret")?;
        Ok(None)
    }

    // The address used to pass control back to the TZOS through eret is
    // reported exactly once, in this SMC.
    fn handle_return_from_tzos_boot(&mut self) -> Result<Option<RunEvent>> {
        let entrypoint = self
            .context
            .target()
            .lock()
            .expect("target lock")
            .read_register("x1")?;
        self.context.record_tzos_eret_entrypoint(entrypoint)?;
        log::debug!("TZOS eret entrypoint: {entrypoint:#x}");
        Ok(Some(RunEvent::Booted))
    }

    fn handle_call_from_tzos_to_normal_world(&mut self) -> Result<Option<RunEvent>> {
        if let Some(event) = self.tee_driver.handle_rpc()? {
            return Ok(Some(event));
        }

        // reply with default parameters and return into the TZOS
        self.context
            .write_system_register("spsr_el3", self.context.smc_spsr_value())?;
        self.context
            .write_system_register("elr_el3", self.context.require_tzos_eret_entrypoint()?)?;
        self.context.write_smc_return_assembly("eret")?;
        Ok(None)
    }
}

impl BreakpointHandler for SecureMonitorEmulator {
    fn breakpoint_addresses(&self) -> Vec<u64> {
        vec![self.context.smc_entry_address()]
    }

    fn handle_breakpoint(&mut self, _pc: u64) -> Result<Option<RunEvent>> {
        let function_identifier = self.read_function_identifier()?;

        if function_identifier == self.context.smc_boot_return_id() {
            log::info!("SMC {function_identifier:#x} received (return from TZOS boot)");
            self.handle_return_from_tzos_boot()
        } else if function_identifier == self.context.smc_nw_call_id() {
            log::info!("SMC {function_identifier:#x} received (call into normal world)");
            self.handle_call_from_tzos_to_normal_world()
        } else {
            log::info!("SMC {function_identifier:#x} received, using default handler");
            self.handle_default_smc()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_exec::TemporaryCodeExecutionHelper;
    use crate::context::RehostingContextConfig;
    use crate::mock_target::MockTarget;
    use crate::peripherals::in_memory_buffer;
    use crate::target_bridge::DefaultTargetBridge;
    use crate::{CoreError, TargetHandle};
    use std::sync::Mutex;

    struct NoRpc;

    impl TeeDriverEmulator for NoRpc {
        fn handle_rpc(&mut self) -> Result<Option<RunEvent>> {
            Ok(Some(RunEvent::CommandFinished))
        }
    }

    fn emulator() -> (Arc<Mutex<MockTarget>>, SecureMonitorEmulator) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let handle: TargetHandle = mock.clone();

        let shared = in_memory_buffer("shared_mem", 0x7000_0000, 0x1000);
        let code = in_memory_buffer("temp_code_execution", 0x7000_1000, 0x1000);
        {
            let mut mock = mock.lock().unwrap();
            mock.map_ram(0x400, 0x1000);
            mock.map_peripheral(0x7000_0000, 0x1000, shared.clone());
            mock.map_peripheral(0x7000_1000, 0x1000, code.clone());
        }

        let context = Arc::new(RehostingContext::new(
            handle.clone(),
            shared,
            TemporaryCodeExecutionHelper::new(handle.clone(), code),
            Box::new(DefaultTargetBridge::new(handle)),
            RehostingContextConfig {
                smc_entry_address: 0x400,
                smc_spsr_value: 0x600003C4,
                smc_boot_return_id: 0xBE00_0000,
                smc_nw_call_id: 0xBE00_0005,
                nsec_shared_memory_address: None,
                trusted_apps_dir: None,
            },
        ));
        let emulator = SecureMonitorEmulator::new(context, Box::new(NoRpc));
        (mock, emulator)
    }

    #[test]
    fn test_boot_return_records_entrypoint_once() {
        let (mock, mut emulator) = emulator();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x0", 0xBE00_0000);
            mock.cpu().set_reg("x1", 0xDEAD_BEEF);
            mock.cpu().set_reg("pc", 0x400);
        }

        let event = emulator.handle_breakpoint(0x400).unwrap();
        assert_eq!(event, Some(RunEvent::Booted));
        assert_eq!(emulator.context.tzos_eret_entrypoint(), Some(0xDEAD_BEEF));

        // a second boot-return SMC must fail
        assert!(matches!(
            emulator.handle_breakpoint(0x400),
            Err(CoreError::EretEntrypointAlreadySet)
        ));
    }

    #[test]
    fn test_default_smc_writes_eret_stub() {
        let (mock, mut emulator) = emulator();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x0", 0x8000_0000);
            mock.cpu().set_reg("pc", 0x400);
        }

        assert_eq!(emulator.handle_breakpoint(0x400).unwrap(), None);
        let word = mock.lock().unwrap().cpu().read_mem_word(0x400, 4).unwrap();
        assert_eq!(word, 0xD69F_03E0);
    }

    #[test]
    fn test_nw_call_event_bypasses_return_path() {
        let (mock, mut emulator) = emulator();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x0", 0xBE00_0005);
            mock.cpu().set_reg("pc", 0x400);
        }

        let event = emulator.handle_breakpoint(0x400).unwrap();
        assert_eq!(event, Some(RunEvent::CommandFinished));
        // the SMC entry stub was left untouched
        let word = mock.lock().unwrap().cpu().read_mem_word(0x400, 4).unwrap();
        assert_eq!(word, 0);
    }
}
