// Platform factories
// Wire one rehosted OP-TEE machine together: memory layout, shared-memory
// peripherals, rehosting context, normal-world emulation and the runner.
// Concrete factories only differ in their per-board memory mappings and
// boot-patch tables; everything else is uniform.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use teehost_core::boot_patcher::{BootPatch, BootPatcher, PatchAction};
use teehost_core::code_exec::TemporaryCodeExecutionHelper;
use teehost_core::context::{RehostingContext, RehostingContextConfig};
use teehost_core::memory_map::{MemoryLayout, MemoryRange, Permissions};
use teehost_core::peripherals::in_memory_buffer;
use teehost_core::runner::BreakpointHandlingRunner;
use teehost_core::secure_monitor::SecureMonitorEmulator;
use teehost_core::target_bridge::DefaultTargetBridge;
use teehost_core::tzos_runner::TzosRunner;
use teehost_core::{Result, TargetHandle};

use crate::driver::OpteeTeeDriverEmulator;
use crate::strategy::OpteeCallIntoTzosStrategy;
use crate::{OPTEE_SMC_NW_CALL, OPTEE_SMC_RETURN_FROM_BOOT};

// OP-TEE's SMC vector ends up here by default; a stub region is mapped so
// the secure-monitor emulation can rewrite the return path at will.
const SMC_ENTRYPOINT_ADDRESS: u64 = 0x400;
const SMC_STUB_SIZE: u64 = 0x10000;
const TEMP_CODE_SIZE: u64 = 0x10000;
const SMC_SPSR_VALUE: u64 = 0x6000_03C4;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    address: u64,
    size: u64,
}

/// Host-side directories a session works against.
pub struct OpteeDirs {
    pub trusted_apps_dir: PathBuf,
    pub secure_storage_dir: PathBuf,
}

impl OpteeDirs {
    pub fn new(trusted_apps_dir: &Path, secure_storage_dir: &Path) -> Self {
        Self {
            trusted_apps_dir: trusted_apps_dir.to_path_buf(),
            secure_storage_dir: secure_storage_dir.to_path_buf(),
        }
    }
}

/// Everything a script needs to drive one rehosted OP-TEE.
pub struct OpteeSession {
    pub layout: MemoryLayout,
    pub context: Arc<RehostingContext>,
    pub runner: TzosRunner<OpteeCallIntoTzosStrategy>,
}

struct OpteeFactoryBase {
    tee_ram: Mapping,
    ta_ram: Mapping,
    nw_ram: Mapping,
    nsec_shared_memory: Mapping,
    temp_code: Mapping,
    extra_ranges: Vec<(String, Mapping)>,
    boot_patches: Vec<BootPatch>,
}

impl OpteeFactoryBase {
    fn build(&self, target: TargetHandle, dirs: &OpteeDirs) -> Result<OpteeSession> {
        let mut layout = MemoryLayout::new();

        // TZOS image, TA RAM and normal-world RAM are plain emulator memory
        layout.add(MemoryRange::ram(
            "tee_ram",
            self.tee_ram.address,
            self.tee_ram.size,
            Permissions::RWX,
        ))?;
        layout.add(MemoryRange::ram(
            "ta_ram",
            self.ta_ram.address,
            self.ta_ram.size,
            Permissions::RWX,
        ))?;
        layout.add(MemoryRange::ram(
            "nw_ram",
            self.nw_ram.address,
            self.nw_ram.size,
            Permissions::RW,
        ))?;
        for (name, mapping) in &self.extra_ranges {
            layout.add(MemoryRange::ram(
                name,
                mapping.address,
                mapping.size,
                Permissions::RW,
            ))?;
        }

        // the TZOS allocates shared ranges in here via TEE driver RPCs; the
        // host writes command structs into the same window
        let shared_memory = in_memory_buffer(
            "nsec_shared_memory",
            self.nsec_shared_memory.address,
            self.nsec_shared_memory.size as usize,
        );
        layout.add(MemoryRange::backed(
            "nsec_shared_memory",
            self.nsec_shared_memory.address,
            self.nsec_shared_memory.size,
            Permissions::RW,
            shared_memory.clone(),
        ))?;

        layout.add(MemoryRange::ram(
            "smc_handler_stub",
            SMC_ENTRYPOINT_ADDRESS,
            SMC_STUB_SIZE,
            Permissions::RX,
        ))?;

        let temp_code = in_memory_buffer(
            "temp_code_execution",
            self.temp_code.address,
            self.temp_code.size as usize,
        );
        layout.add(MemoryRange::backed(
            "temp_code_execution",
            self.temp_code.address,
            self.temp_code.size,
            Permissions::RX,
            temp_code.clone(),
        ))?;

        let context = Arc::new(RehostingContext::new(
            target.clone(),
            shared_memory,
            TemporaryCodeExecutionHelper::new(target.clone(), temp_code),
            Box::new(DefaultTargetBridge::new(target.clone())),
            RehostingContextConfig {
                smc_entry_address: SMC_ENTRYPOINT_ADDRESS,
                smc_spsr_value: SMC_SPSR_VALUE,
                smc_boot_return_id: OPTEE_SMC_RETURN_FROM_BOOT,
                smc_nw_call_id: OPTEE_SMC_NW_CALL,
                nsec_shared_memory_address: Some(self.nsec_shared_memory.address),
                trusted_apps_dir: Some(dirs.trusted_apps_dir.clone()),
            },
        ));

        let mut runner = BreakpointHandlingRunner::new(target.clone());
        if !self.boot_patches.is_empty() {
            runner.register_handler(Box::new(BootPatcher::new(
                context.clone(),
                self.boot_patches.clone(),
            )))?;
        }

        let tee_driver = OpteeTeeDriverEmulator::new(
            target,
            self.nsec_shared_memory.address,
            &dirs.trusted_apps_dir,
            &dirs.secure_storage_dir,
        )?;
        runner.register_handler(Box::new(SecureMonitorEmulator::new(
            context.clone(),
            Box::new(tee_driver),
        )))?;

        let strategy = OpteeCallIntoTzosStrategy::new(context.clone());
        Ok(OpteeSession {
            layout,
            context,
            runner: TzosRunner::new(runner, strategy),
        })
    }
}

/// QEMU virt (v8) build of OP-TEE.
pub struct OpteeQemuv8Factory {
    base: OpteeFactoryBase,
}

impl Default for OpteeQemuv8Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl OpteeQemuv8Factory {
    pub fn new() -> Self {
        let set_register = |register: &str, value: u64| PatchAction::SetRegister {
            register: register.to_string(),
            value,
        };
        Self {
            base: OpteeFactoryBase {
                tee_ram: Mapping { address: 0x0E10_0000, size: 0x20_0000 },
                ta_ram: Mapping { address: 0x0E30_0000, size: 0xD0_0000 },
                nw_ram: Mapping { address: 0x4000_0000, size: 0x200_0000 },
                nsec_shared_memory: Mapping { address: 0x4200_0000, size: 0x20_0000 },
                // JIT region directly after the shared-memory window
                temp_code: Mapping { address: 0x4220_0000, size: TEMP_CODE_SIZE },
                extra_ranges: vec![(
                    "gic".to_string(),
                    Mapping { address: 0x0800_0000, size: 0x100_0000 },
                )],
                boot_patches: vec![
                    BootPatch {
                        address: 0x0E10_FF84,
                        note: "indicate gic version 3".into(),
                        action: set_register("x1", 0x3),
                    },
                    BootPatch {
                        address: 0x0E10_FFC0,
                        note: "skip gic sysreg".into(),
                        action: PatchAction::SkipInstruction,
                    },
                    BootPatch {
                        address: 0x0E10_FFC8,
                        note: "skip gic sysreg".into(),
                        action: PatchAction::SkipInstruction,
                    },
                    BootPatch {
                        address: 0x0E11_0008,
                        note: "skip gic sysreg".into(),
                        action: PatchAction::SkipInstruction,
                    },
                    BootPatch {
                        address: 0x0E10_F630,
                        note: "skip gic sysreg".into(),
                        action: PatchAction::SkipInstruction,
                    },
                    BootPatch {
                        address: 0x0E10_F994,
                        note: "modify in gic add".into(),
                        action: set_register("x1", 0x1D),
                    },
                    BootPatch {
                        address: 0x0E10_FC68,
                        note: "modify in gic enable".into(),
                        action: set_register("x1", 0x1D),
                    },
                ],
            },
        }
    }

    pub fn build(&self, target: TargetHandle, dirs: &OpteeDirs) -> Result<OpteeSession> {
        self.base.build(target, dirs)
    }
}

/// HiKey 620 build of OP-TEE.
pub struct OpteeHiKey620Factory {
    base: OpteeFactoryBase,
}

impl Default for OpteeHiKey620Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl OpteeHiKey620Factory {
    pub fn new() -> Self {
        Self {
            base: OpteeFactoryBase {
                tee_ram: Mapping { address: 0x3F00_0000, size: 0x20_0000 },
                ta_ram: Mapping { address: 0x3F20_0000, size: 0xE0_0000 },
                nw_ram: Mapping { address: 0x4000_0000, size: 0x1000_0000 },
                nsec_shared_memory: Mapping { address: 0x3EE0_0000, size: 0x20_0000 },
                // the window right below the shared memory is unclaimed
                temp_code: Mapping { address: 0x3ED0_0000, size: TEMP_CODE_SIZE },
                extra_ranges: vec![
                    ("io_nsec".to_string(), Mapping { address: 0xF800_0000, size: 0x20_0000 }),
                    ("io_nsec_1".to_string(), Mapping { address: 0xF700_0000, size: 0x20_0000 }),
                ],
                boot_patches: Vec::new(),
            },
        }
    }

    pub fn build(&self, target: TargetHandle, dirs: &OpteeDirs) -> Result<OpteeSession> {
        self.base.build(target, dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use teehost_core::mock_target::MockTarget;

    #[test]
    fn test_qemuv8_layout_has_all_ranges() {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let dir = tempfile::tempdir().unwrap();
        let session = OpteeQemuv8Factory::new()
            .build(
                mock.clone(),
                &OpteeDirs::new(dir.path(), &dir.path().join("secure-storage")),
            )
            .unwrap();

        for name in [
            "tee_ram",
            "ta_ram",
            "nw_ram",
            "nsec_shared_memory",
            "smc_handler_stub",
            "temp_code_execution",
            "gic",
        ] {
            assert!(session.layout.find(name).is_some(), "{name}");
        }
        assert_eq!(session.context.smc_entry_address(), 0x400);
        assert_eq!(session.context.shared_memory_address(), 0x4200_0000);

        // registering installed the SMC and boot-patch breakpoints
        let mut mock = mock.lock().unwrap();
        assert!(mock.cpu().has_breakpoint(0x400));
        assert!(mock.cpu().has_breakpoint(0x0E10_FF84));
    }

    #[test]
    fn test_hikey_layout_does_not_overlap() {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let dir = tempfile::tempdir().unwrap();
        let session = OpteeHiKey620Factory::new()
            .build(
                mock,
                &OpteeDirs::new(dir.path(), &dir.path().join("secure-storage")),
            )
            .unwrap();
        assert_eq!(session.context.shared_memory_address(), 0x3EE0_0000);
    }
}
