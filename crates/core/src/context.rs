// Rehosting context
// Common state shared between the components of one rehosting session, plus
// the register/memory conveniences they all need. Created by a platform
// factory before any target runs.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use crate::asm::aarch64_asm;
use crate::code_exec::TemporaryCodeExecutionHelper;
use crate::peripherals::SharedBuffer;
use crate::target_bridge::TargetBridge;
use crate::{CoreError, Result, TargetHandle};

// scratch register used while staging system-register writes
const TEMP_GP_REGISTER: &str = "x0";

pub struct RehostingContext {
    target: TargetHandle,
    smc_entry_address: u64,
    shared_memory: SharedBuffer,
    code_helper: Mutex<TemporaryCodeExecutionHelper>,
    target_bridge: Box<dyn TargetBridge + Send + Sync>,

    smc_spsr_value: u64,
    smc_boot_return_id: u64,
    smc_nw_call_id: u64,

    nsec_shared_memory_address: Option<u64>,
    trusted_apps_dir: Option<PathBuf>,

    // set exactly once, by the first return-from-boot SMC
    tzos_eret_entrypoint: OnceLock<u64>,
}

/// All the knobs a platform factory has to provide.
pub struct RehostingContextConfig {
    pub smc_entry_address: u64,
    pub smc_spsr_value: u64,
    pub smc_boot_return_id: u64,
    pub smc_nw_call_id: u64,
    pub nsec_shared_memory_address: Option<u64>,
    pub trusted_apps_dir: Option<PathBuf>,
}

impl RehostingContext {
    pub fn new(
        target: TargetHandle,
        shared_memory: SharedBuffer,
        code_helper: TemporaryCodeExecutionHelper,
        target_bridge: Box<dyn TargetBridge + Send + Sync>,
        config: RehostingContextConfig,
    ) -> Self {
        Self {
            target,
            smc_entry_address: config.smc_entry_address,
            shared_memory,
            code_helper: Mutex::new(code_helper),
            target_bridge,
            smc_spsr_value: config.smc_spsr_value,
            smc_boot_return_id: config.smc_boot_return_id,
            smc_nw_call_id: config.smc_nw_call_id,
            nsec_shared_memory_address: config.nsec_shared_memory_address,
            trusted_apps_dir: config.trusted_apps_dir,
            tzos_eret_entrypoint: OnceLock::new(),
        }
    }

    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    pub fn smc_entry_address(&self) -> u64 {
        self.smc_entry_address
    }

    pub fn shared_memory(&self) -> &SharedBuffer {
        &self.shared_memory
    }

    pub fn shared_memory_address(&self) -> u64 {
        self.shared_memory.lock().expect("shared memory lock").address()
    }

    pub fn target_bridge(&self) -> &(dyn TargetBridge + Send + Sync) {
        self.target_bridge.as_ref()
    }

    pub fn smc_spsr_value(&self) -> u64 {
        self.smc_spsr_value
    }

    pub fn smc_boot_return_id(&self) -> u64 {
        self.smc_boot_return_id
    }

    pub fn smc_nw_call_id(&self) -> u64 {
        self.smc_nw_call_id
    }

    pub fn nsec_shared_memory_address(&self) -> Option<u64> {
        self.nsec_shared_memory_address
    }

    pub fn trusted_apps_dir(&self) -> Option<&PathBuf> {
        self.trusted_apps_dir.as_ref()
    }

    /// The address the TZOS expects control to resume at after its SMC
    /// returns; `None` until the boot-return SMC has been observed.
    pub fn tzos_eret_entrypoint(&self) -> Option<u64> {
        self.tzos_eret_entrypoint.get().copied()
    }

    /// Like [`Self::tzos_eret_entrypoint`], but an error before boot.
    pub fn require_tzos_eret_entrypoint(&self) -> Result<u64> {
        self.tzos_eret_entrypoint()
            .ok_or(CoreError::TzosNotBooted)
    }

    /// Record the eret entrypoint reported by the boot-return SMC. May only
    /// ever happen once per session.
    pub fn record_tzos_eret_entrypoint(&self, entrypoint: u64) -> Result<()> {
        self.tzos_eret_entrypoint
            .set(entrypoint)
            .map_err(|_| CoreError::EretEntrypointAlreadySet)
    }

    /// Assemble and place return code at the SMC entry address. The TZOS
    /// never reads this region until a resume crosses it, so rewriting it
    /// between stops is safe.
    pub fn write_smc_return_assembly(&self, code: &str) -> Result<usize> {
        let assembly = aarch64_asm(code)?;
        self.target
            .lock()
            .expect("target lock")
            .write_memory(self.smc_entry_address, &assembly)?;
        Ok(assembly.len())
    }

    /// Set a system register by staging the value in a general-purpose
    /// register and running a just-in-time assembled `msr`.
    ///
    /// The scratch register is saved and restored around the write, so the
    /// only observable effect is the new system-register value.
    pub fn write_system_register(&self, system_register: &str, value: u64) -> Result<()> {
        let old_value = {
            let mut target = self.target.lock().expect("target lock");
            let old = target.read_register(TEMP_GP_REGISTER)?;
            target.write_register(TEMP_GP_REGISTER, value)?;
            old
        };

        let code = format!("msr {system_register}, {TEMP_GP_REGISTER}");
        let result = {
            let mut helper = self.code_helper.lock().expect("code helper lock");
            helper
                .assemble_and_store(&code)
                .and_then(|()| helper.run_stored_code())
        };

        self.target
            .lock()
            .expect("target lock")
            .write_register(TEMP_GP_REGISTER, old_value)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_target::MockTarget;
    use crate::peripherals::in_memory_buffer;
    use crate::target_bridge::DefaultTargetBridge;
    use std::sync::Arc;

    fn context_with_mock() -> (Arc<Mutex<MockTarget>>, RehostingContext) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let handle: TargetHandle = mock.clone();

        let shared_memory = in_memory_buffer("shared_mem", 0x7D9A_1000, 0x10000);
        let code_buffer = in_memory_buffer("temp_code_execution", 0x7D9B_1000, 0x1000);
        {
            let mut mock = mock.lock().unwrap();
            mock.map_ram(0x400, 0x1000);
            mock.map_peripheral(0x7D9A_1000, 0x10000, shared_memory.clone());
            mock.map_peripheral(0x7D9B_1000, 0x1000, code_buffer.clone());
        }

        let helper = TemporaryCodeExecutionHelper::new(handle.clone(), code_buffer);
        let context = RehostingContext::new(
            handle.clone(),
            shared_memory,
            helper,
            Box::new(DefaultTargetBridge::new(handle)),
            RehostingContextConfig {
                smc_entry_address: 0x400,
                smc_spsr_value: 0x600003C4,
                smc_boot_return_id: 0xBE00_0000,
                smc_nw_call_id: 0xBE00_0005,
                nsec_shared_memory_address: Some(0x4200_0000),
                trusted_apps_dir: None,
            },
        );
        (mock, context)
    }

    #[test]
    fn test_eret_entrypoint_is_write_once() {
        let (_mock, context) = context_with_mock();
        assert!(matches!(
            context.require_tzos_eret_entrypoint(),
            Err(CoreError::TzosNotBooted)
        ));
        context.record_tzos_eret_entrypoint(0xDEAD_BEEF).unwrap();
        assert_eq!(context.tzos_eret_entrypoint(), Some(0xDEAD_BEEF));
        assert!(matches!(
            context.record_tzos_eret_entrypoint(0x1234),
            Err(CoreError::EretEntrypointAlreadySet)
        ));
    }

    #[test]
    fn test_smc_return_assembly_lands_at_entry() {
        let (mock, context) = context_with_mock();
        let len = context.write_smc_return_assembly("eret").unwrap();
        assert_eq!(len, 4);
        let word = mock.lock().unwrap().cpu().read_mem_word(0x400, 4).unwrap();
        assert_eq!(word, 0xD69F_03E0);
    }

    #[test]
    fn test_write_system_register_preserves_scratch_and_pc() {
        let (mock, context) = context_with_mock();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("pc", 0x400);
            mock.cpu().set_reg("x0", 0x1111);
        }

        context.write_system_register("spsr_el3", 0x600003C4).unwrap();

        let mut mock = mock.lock().unwrap();
        assert_eq!(mock.cpu().reg("spsr_el3"), 0x600003C4);
        assert_eq!(mock.cpu().reg("x0"), 0x1111);
        assert_eq!(mock.cpu().reg("pc"), 0x400);
    }
}
