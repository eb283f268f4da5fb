// Platform factory
// Wires one rehosted TrustedCore machine together. The P9 Lite build is the
// only board exercised so far; its memory map mirrors the physical device,
// with one big window per populated region.

use std::collections::HashMap;
use std::sync::Arc;

use teehost_core::code_exec::TemporaryCodeExecutionHelper;
use teehost_core::context::{RehostingContext, RehostingContextConfig};
use teehost_core::memory_map::{MemoryLayout, MemoryRange, Permissions};
use teehost_core::peripherals::in_memory_buffer;
use teehost_core::progress_monitor::ProgressMonitor;
use teehost_core::runner::BreakpointHandlingRunner;
use teehost_core::secure_monitor::SecureMonitorEmulator;
use teehost_core::target_bridge::AArch64Compat32TargetBridge;
use teehost_core::tzos_runner::TzosRunner;
use teehost_core::{Result, TargetHandle};

use crate::driver::TrustedCoreTeeDriverEmulator;
use crate::exception::FatalExceptionHandler;
use crate::shm::SharedMemoryManager;
use crate::strategy::TrustedCoreCallIntoTzosStrategy;
use crate::{TC_SMC_NW_CALL, TC_SMC_RETURN_FROM_BOOT, TC_SMC_SPSR_VALUE};

const SMC_ENTRYPOINT_ADDRESS: u64 = 0x600;
const SMC_STUB_SIZE: u64 = 0x10000;
const SHARED_MEMORY_ADDRESS: u64 = 0xE000_0000;
const SHARED_MEMORY_SIZE: u64 = 0x100_0000;
const TEMP_CODE_SIZE: u64 = 0x10000;
// osExceptionHandle in the P9 Lite image
const EXCEPTION_HANDLER_ADDRESS: u64 = 0xC000_8B1C;

/// Everything a script needs to drive one rehosted TrustedCore.
pub struct TrustedCoreSession {
    pub layout: MemoryLayout,
    pub context: Arc<RehostingContext>,
    pub runner: TzosRunner<TrustedCoreCallIntoTzosStrategy>,
    pub shm_manager: SharedMemoryManager,
}

/// Huawei P9 Lite build of TrustedCore.
pub struct TrustedCoreP9LiteFactory {
    exception_handler_address: Option<u64>,
    progress_labels: HashMap<u64, String>,
}

impl Default for TrustedCoreP9LiteFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedCoreP9LiteFactory {
    pub fn new() -> Self {
        Self {
            exception_handler_address: Some(EXCEPTION_HANDLER_ADDRESS),
            progress_labels: HashMap::new(),
        }
    }

    /// Replace or disable the fatal-exception breakpoint.
    pub fn with_exception_handler(mut self, address: Option<u64>) -> Self {
        self.exception_handler_address = address;
        self
    }

    /// Attach a progress-label table (address -> description).
    pub fn with_progress_labels(mut self, labels: HashMap<u64, String>) -> Self {
        self.progress_labels = labels;
        self
    }

    fn layout(shared_memory: &teehost_core::peripherals::SharedBuffer,
              temp_code: &teehost_core::peripherals::SharedBuffer) -> Result<MemoryLayout> {
        let mut layout = MemoryLayout::new();
        layout.add(MemoryRange::ram(
            "smc_handler_stub",
            SMC_ENTRYPOINT_ADDRESS,
            SMC_STUB_SIZE,
            Permissions::RX,
        ))?;
        layout.add(MemoryRange::ram("ta_ram", 0x2_0000, 0x1000, Permissions::RWX))?;
        layout.add(MemoryRange::ram("teeos", 0x3620_0000, 0x1E0_0000, Permissions::RWX))?;
        layout.add(MemoryRange::ram("range0", 0x3800_0000, 0x6D00_0000, Permissions::RW))?;
        layout.add(MemoryRange::ram("range1", 0xAC00_0000, 0x3300_0000, Permissions::RW))?;
        layout.add(MemoryRange::backed(
            "shared_mem",
            SHARED_MEMORY_ADDRESS,
            SHARED_MEMORY_SIZE,
            Permissions::RW,
            shared_memory.clone(),
        ))?;
        layout.add(MemoryRange::backed(
            "temp_code_execution",
            SHARED_MEMORY_ADDRESS + SHARED_MEMORY_SIZE,
            TEMP_CODE_SIZE,
            Permissions::RX,
            temp_code.clone(),
        ))?;
        layout.add(MemoryRange::ram("range2", 0xE110_0000, 0x1F00_0000, Permissions::RW))?;
        layout.add(MemoryRange::ram("range3", 0xF000_0000, 0xDF0_2000, Permissions::RW))?;
        layout.add(MemoryRange::ram("range4", 0xFDF0_3000, 0x202_F000, Permissions::RW))?;
        layout.add(MemoryRange::ram("range5", 0xFFF3_3000, 0xCD_000, Permissions::RW))?;
        Ok(layout)
    }

    pub fn build(&self, target: TargetHandle) -> Result<TrustedCoreSession> {
        let shared_memory = in_memory_buffer(
            "shared_mem",
            SHARED_MEMORY_ADDRESS,
            SHARED_MEMORY_SIZE as usize,
        );
        let temp_code = in_memory_buffer(
            "temp_code_execution",
            SHARED_MEMORY_ADDRESS + SHARED_MEMORY_SIZE,
            TEMP_CODE_SIZE as usize,
        );
        let layout = Self::layout(&shared_memory, &temp_code)?;

        let context = Arc::new(RehostingContext::new(
            target.clone(),
            shared_memory.clone(),
            TemporaryCodeExecutionHelper::new(target.clone(), temp_code),
            Box::new(AArch64Compat32TargetBridge::new(target.clone())),
            RehostingContextConfig {
                smc_entry_address: SMC_ENTRYPOINT_ADDRESS,
                smc_spsr_value: TC_SMC_SPSR_VALUE,
                smc_boot_return_id: TC_SMC_RETURN_FROM_BOOT,
                smc_nw_call_id: TC_SMC_NW_CALL,
                nsec_shared_memory_address: None,
                trusted_apps_dir: None,
            },
        ));

        let mut runner = BreakpointHandlingRunner::new(target);
        if let Some(address) = self.exception_handler_address {
            runner.register_handler(Box::new(FatalExceptionHandler::new(
                context.clone(),
                address,
            )))?;
        }
        if !self.progress_labels.is_empty() {
            runner.register_handler(Box::new(ProgressMonitor::new(
                self.progress_labels.clone(),
            )))?;
        }
        runner.register_handler(Box::new(SecureMonitorEmulator::new(
            context.clone(),
            Box::new(TrustedCoreTeeDriverEmulator::new()),
        )))?;

        let strategy = TrustedCoreCallIntoTzosStrategy::new(context.clone());
        Ok(TrustedCoreSession {
            layout,
            context,
            runner: TzosRunner::new(runner, strategy),
            shm_manager: SharedMemoryManager::new(shared_memory),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use teehost_core::mock_target::MockTarget;

    #[test]
    fn test_session_wiring() {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let session = TrustedCoreP9LiteFactory::new().build(mock.clone()).unwrap();

        assert_eq!(session.context.smc_entry_address(), 0x600);
        assert_eq!(session.context.shared_memory_address(), SHARED_MEMORY_ADDRESS);
        assert_eq!(session.shm_manager.start_address(), SHARED_MEMORY_ADDRESS + 0x10000);

        let mut mock = mock.lock().unwrap();
        assert!(mock.cpu().has_breakpoint(0x600));
        assert!(mock.cpu().has_breakpoint(EXCEPTION_HANDLER_ADDRESS));
    }

    #[test]
    fn test_exception_handler_can_be_disabled() {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        TrustedCoreP9LiteFactory::new()
            .with_exception_handler(None)
            .build(mock.clone())
            .unwrap();
        assert!(!mock.lock().unwrap().cpu().has_breakpoint(EXCEPTION_HANDLER_ADDRESS));
    }

    #[test]
    fn test_layout_is_overlap_free() {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let session = TrustedCoreP9LiteFactory::new().build(mock).unwrap();
        for name in ["smc_handler_stub", "teeos", "shared_mem", "temp_code_execution"] {
            assert!(session.layout.find(name).is_some(), "{name}");
        }
    }
}
