// Call-into-TZOS strategy, OP-TEE flavor
// Stages an optee_msg_arg at the shared-memory base, prepares the EL3
// return state and the registers OP-TEE's std entry expects, then lets the
// runner resume the target through an eret stub.

use std::sync::Arc;

use teehost_core::tzos_runner::{CallIntoTzosStrategy, CommandResult};
use teehost_core::wire::WireStruct;
use teehost_core::{RehostingContext, Result};

use crate::structs::OpteeMsgArg;
use crate::OPTEE_SMC_CALL_WITH_ARG;

pub struct OpteeCallIntoTzosStrategy {
    context: Arc<RehostingContext>,
}

impl OpteeCallIntoTzosStrategy {
    pub fn new(context: Arc<RehostingContext>) -> Self {
        Self { context }
    }
}

impl CallIntoTzosStrategy for OpteeCallIntoTzosStrategy {
    type Command = OpteeMsgArg;
    type Response = OpteeMsgArg;

    fn execute_tzos_command(&mut self, command: &OpteeMsgArg) -> Result<()> {
        // the boot handshake must have happened, otherwise there is no
        // entrypoint to return through
        let eret_entrypoint = self.context.require_tzos_eret_entrypoint()?;

        log::debug!("staging command: {command:x?}");
        self.context
            .shared_memory()
            .lock()
            .expect("shared memory lock")
            .write_at_base(&command.to_bytes())?;

        // system registers are unreachable for the debug stub, set them
        // through just-in-time assembled code
        self.context
            .write_system_register("spsr_el3", self.context.smc_spsr_value())?;
        self.context
            .write_system_register("elr_el3", eret_entrypoint)?;

        let shared_memory_address = self.context.shared_memory_address();
        {
            let mut target = self.context.target().lock().expect("target lock");
            target.write_register("x0", OPTEE_SMC_CALL_WITH_ARG)?;
            target.write_register("x2", shared_memory_address)?;
            // only x1 really needs clearing, the rest is for good measure
            for register in ["x1", "x3", "x4", "x5", "x6"] {
                target.write_register(register, 0)?;
            }
        }

        self.context.write_smc_return_assembly("eret")?;
        Ok(())
    }

    fn parse_return_value(&mut self) -> Result<CommandResult<OpteeMsgArg>> {
        let response =
            OpteeMsgArg::read_from_target(self.context.target(), self.context.shared_memory_address())?;
        log::debug!("parsed response: {response:x?}");

        if response.ret != 0 {
            return Ok(CommandResult::Failed(response));
        }
        Ok(CommandResult::Ok(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands;
    use crate::structs::{OpteeMsgParam, OpteeMsgParamValue};
    use std::sync::Mutex;
    use teehost_core::code_exec::TemporaryCodeExecutionHelper;
    use teehost_core::context::RehostingContextConfig;
    use teehost_core::mock_target::MockTarget;
    use teehost_core::peripherals::in_memory_buffer;
    use teehost_core::target_bridge::DefaultTargetBridge;
    use teehost_core::{CoreError, TargetHandle};

    const SMC_ENTRY: u64 = 0x400;
    const SHM_BASE: u64 = 0x7D9A_1000;

    fn strategy() -> (Arc<Mutex<MockTarget>>, OpteeCallIntoTzosStrategy) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let handle: TargetHandle = mock.clone();
        let shared = in_memory_buffer("shared_mem", SHM_BASE, 0x1_0000);
        let code = in_memory_buffer("temp_code_execution", SHM_BASE + 0x1_0000, 0x1000);
        {
            let mut mock = mock.lock().unwrap();
            mock.map_ram(SMC_ENTRY, 0x1000);
            mock.map_peripheral(SHM_BASE, 0x1_0000, shared.clone());
            mock.map_peripheral(SHM_BASE + 0x1_0000, 0x1000, code.clone());
            mock.cpu().set_reg("pc", SMC_ENTRY);
        }
        let context = Arc::new(RehostingContext::new(
            handle.clone(),
            shared,
            TemporaryCodeExecutionHelper::new(handle.clone(), code),
            Box::new(DefaultTargetBridge::new(handle)),
            RehostingContextConfig {
                smc_entry_address: SMC_ENTRY,
                smc_spsr_value: 0x600003C4,
                smc_boot_return_id: 0xBE00_0000,
                smc_nw_call_id: 0xBE00_0005,
                nsec_shared_memory_address: None,
                trusted_apps_dir: None,
            },
        ));
        (mock, OpteeCallIntoTzosStrategy::new(context))
    }

    #[test]
    fn test_execute_requires_boot() {
        let (_mock, mut strategy) = strategy();
        let command = commands::open_ta_session("11223344556677889900aabbccddeeff").unwrap();
        assert!(matches!(
            strategy.execute_tzos_command(&command),
            Err(CoreError::TzosNotBooted)
        ));
    }

    #[test]
    fn test_execute_stages_command_and_registers() {
        let (mock, mut strategy) = strategy();
        strategy.context.record_tzos_eret_entrypoint(0xE10_18FC).unwrap();

        let command = OpteeMsgArg {
            cmd: 0,
            params: vec![OpteeMsgParam::new(
                0x101,
                OpteeMsgParamValue::new(0x1122, 0x3344, 0),
            )],
            ..OpteeMsgArg::default()
        };
        strategy.execute_tzos_command(&command).unwrap();

        // command serialized at the shared-memory base
        let staged =
            OpteeMsgArg::read_from_target(&(mock.clone() as TargetHandle), SHM_BASE).unwrap();
        assert_eq!(staged, command);

        let mut mock = mock.lock().unwrap();
        assert_eq!(mock.cpu().reg("x0"), OPTEE_SMC_CALL_WITH_ARG);
        assert_eq!(mock.cpu().reg("x2"), SHM_BASE);
        assert_eq!(mock.cpu().reg("x1"), 0);
        assert_eq!(mock.cpu().reg("spsr_el3"), 0x600003C4);
        assert_eq!(mock.cpu().reg("elr_el3"), 0xE10_18FC);
        // eret stub parked at the SMC entry
        assert_eq!(mock.cpu().read_mem_word(SMC_ENTRY, 4).unwrap(), 0xD69F_03E0);
    }

    #[test]
    fn test_parse_flags_nonzero_ret() {
        let (mock, mut strategy) = strategy();
        let mut response = OpteeMsgArg::default();
        response.ret = 0xFFFF_0006;
        mock.lock()
            .unwrap()
            .cpu()
            .write_mem(SHM_BASE, &response.to_bytes())
            .unwrap();

        match strategy.parse_return_value().unwrap() {
            CommandResult::Failed(parsed) => assert_eq!(parsed.ret, 0xFFFF_0006),
            CommandResult::Ok(_) => panic!("expected failure"),
        }
    }
}
