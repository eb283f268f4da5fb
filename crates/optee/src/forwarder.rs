// Cross-device SMC forwarding
// Synchronizes a rehosted OP-TEE with the normal world of a physical
// device: SMCs observed on either side are classified by x0 and shipped to
// the peer, with a generated stub re-establishing the EL3 return state on
// the emulator side. The two targets are never driven simultaneously; every
// hand-over surfaces as a world-switch event.

use std::sync::{Arc, Mutex};

use teehost_core::asm::{aarch64_asm, load_immediate};
use teehost_core::peripherals::{MemoryForwarder, PeripheralHandle};
use teehost_core::{CoreError, Result, RunEvent, TargetHandle};

use crate::structs::OpteeMsgArg;
use crate::{OPTEE_SMC_CALL_RETURN_FROM_RPC, OPTEE_SMC_CALL_WITH_RPC_ARG, OPTEE_SMC_NW_CALL, OPTEE_SMC_RETURN_FROM_BOOT};

/// Wiring of the two targets and their shared-memory views.
pub struct ForwarderConfig {
    pub smc_emulator_entrypoint: u64,
    pub smc_physical_device_entrypoint: u64,
    /// Physical address of the non-secure shared memory on the emulator.
    pub nsec_shared_memory_address: u64,
    pub nsec_shared_memory_size: u64,
    /// Where that memory is mapped in the physical device's normal world.
    pub shm_va_physical_device: u64,
    /// Where the emulator-side TZOS expects it.
    pub shm_va_emulator: u64,
    /// SPSR value restored before every eret into the emulator TZOS.
    pub smc_spsr_value: u64,
    /// Number of setup SMCs to let pass before forwarding starts.
    pub skip_calls_until_ready: i64,
}

pub struct OpteeSecureMonitorForwarder {
    emulator: TargetHandle,
    physical_device: TargetHandle,
    config: ForwarderConfig,
    skip_calls_until_ready: i64,
    // initialized when the rehosted TZOS finishes booting
    emulator_eret_entrypoint: Option<u64>,
}

impl OpteeSecureMonitorForwarder {
    pub fn new(
        emulator: TargetHandle,
        physical_device: TargetHandle,
        config: ForwarderConfig,
    ) -> Self {
        let skip = config.skip_calls_until_ready;
        Self {
            emulator,
            physical_device,
            config,
            skip_calls_until_ready: skip,
            emulator_eret_entrypoint: None,
        }
    }

    pub fn emulator_eret_entrypoint(&self) -> Option<u64> {
        self.emulator_eret_entrypoint
    }

    /// Peripheral mirroring the emulator's shared-memory region into the
    /// physical device's virtual address space. Map it on the emulator side.
    pub fn shared_memory_mirror(&self) -> PeripheralHandle {
        Arc::new(Mutex::new(MemoryForwarder::new(
            "shared_mem",
            self.config.nsec_shared_memory_address,
            self.config.shm_va_physical_device,
            self.physical_device.clone(),
        )))
    }

    /// Continue the rehosted TZOS until it boots or hands control to the
    /// physical world.
    pub fn cont_emulator(&mut self) -> Result<RunEvent> {
        let entry = self.config.smc_emulator_entrypoint;
        self.emulator
            .lock()
            .expect("emulator lock")
            .set_breakpoint(entry)?;

        loop {
            {
                let mut emulator = self.emulator.lock().expect("emulator lock");
                emulator.cont()?;
                emulator.wait()?;
            }

            let pc = self
                .emulator
                .lock()
                .expect("emulator lock")
                .read_register("pc")?;
            if pc != entry {
                // clean up our own breakpoint so an unrelated continuation
                // of the script is not affected
                self.emulator
                    .lock()
                    .expect("emulator lock")
                    .remove_breakpoint(entry)?;
                return Err(CoreError::ForeignBreakpoint { pc });
            }

            if let Some(event) = self.handle_smc_from_tzos()? {
                return Ok(event);
            }
        }
    }

    /// Continue the physical device's normal world until it issues an SMC
    /// that belongs to the rehosted secure world.
    pub fn cont_physical_device(&mut self) -> Result<RunEvent> {
        let entry = self.config.smc_physical_device_entrypoint;
        self.physical_device
            .lock()
            .expect("physical device lock")
            .set_breakpoint(entry)?;

        loop {
            {
                let mut device = self.physical_device.lock().expect("physical device lock");
                device.cont()?;
                device.wait()?;
            }

            let pc = self
                .physical_device
                .lock()
                .expect("physical device lock")
                .read_register("pc")?;
            if pc != entry {
                self.physical_device
                    .lock()
                    .expect("physical device lock")
                    .remove_breakpoint(entry)?;
                return Err(CoreError::ForeignBreakpoint { pc });
            }

            if let Some(event) = self.handle_smc_from_nw()? {
                return Ok(event);
            }
        }
    }

    fn handle_smc_from_tzos(&mut self) -> Result<Option<RunEvent>> {
        let function_identifier = self
            .emulator
            .lock()
            .expect("emulator lock")
            .read_register("x0")?;
        log::info!("SW->SMC->NW {function_identifier:#x} received");

        match function_identifier {
            OPTEE_SMC_RETURN_FROM_BOOT => {
                if self.emulator_eret_entrypoint.is_some() {
                    return Err(CoreError::EretEntrypointAlreadySet);
                }
                let entrypoint = self
                    .emulator
                    .lock()
                    .expect("emulator lock")
                    .read_register("x1")?;
                log::info!("emulator eret entrypoint: {entrypoint:#x}");
                self.emulator_eret_entrypoint = Some(entrypoint);
                Ok(Some(RunEvent::Booted))
            }
            OPTEE_SMC_NW_CALL => {
                let arg = OpteeMsgArg::read_from_target(
                    &self.emulator,
                    self.config.shm_va_emulator,
                )?;
                log::debug!("emulator-side request: {arg:x?}");
                self.forward_to_physical_device()?;
                Ok(Some(RunEvent::WorldSwitch))
            }
            _ => {
                self.write_emulator_stub("eret")?;
                Ok(None)
            }
        }
    }

    fn handle_smc_from_nw(&mut self) -> Result<Option<RunEvent>> {
        let function_identifier = self
            .physical_device
            .lock()
            .expect("physical device lock")
            .read_register("x0")?;
        log::info!("NW->SMC->SW {function_identifier:#x} received");

        match function_identifier {
            OPTEE_SMC_CALL_WITH_RPC_ARG => self.handle_call_with_args(),
            OPTEE_SMC_CALL_RETURN_FROM_RPC => {
                if self.skip_calls_until_ready > 0 {
                    // still booting, leave the physical secure monitor to it
                    Ok(None)
                } else {
                    self.handle_call_with_args()
                }
            }
            // everything else is the physical device's own business
            _ => Ok(None),
        }
    }

    fn handle_call_with_args(&mut self) -> Result<Option<RunEvent>> {
        if self.skip_calls_until_ready > 0 {
            self.skip_calls_until_ready -= 1;
            return Ok(None);
        }
        if self.skip_calls_until_ready == 0 {
            self.skip_calls_until_ready -= 1;
            log::info!("forwarding SMCs now");
        }

        let arg_address = self
            .physical_device
            .lock()
            .expect("physical device lock")
            .read_register("x2")?;
        if arg_address != 0 {
            let arg = OpteeMsgArg::read_from_target(
                &self.physical_device,
                self.config.shm_va_physical_device,
            )?;
            log::debug!("physical-side request: {arg:x?}");
        }

        self.forward_to_emulator(arg_address)?;
        Ok(Some(RunEvent::WorldSwitch))
    }

    fn write_emulator_stub(&self, code: &str) -> Result<()> {
        let assembly = aarch64_asm(code)?;
        self.emulator
            .lock()
            .expect("emulator lock")
            .write_memory(self.config.smc_emulator_entrypoint, &assembly)
    }

    // Ship the pending normal-world call into the rehosted TZOS: copy the
    // argument registers over and re-create the EL3 return state with a
    // generated stub, since the emulator's secure monitor is not modeled.
    fn forward_to_emulator(&mut self, arg_address: u64) -> Result<()> {
        let eret_entrypoint = self
            .emulator_eret_entrypoint
            .ok_or(CoreError::TzosNotBooted)?;

        let (function_identifier, x1, x3) = {
            let mut device = self.physical_device.lock().expect("physical device lock");
            (
                device.read_register("x0")?,
                device.read_register("x1")?,
                device.read_register("x3")?,
            )
        };

        {
            let mut emulator = self.emulator.lock().expect("emulator lock");
            emulator.write_register("x1", x1)?;
            emulator.write_register("x2", arg_address)?;
            emulator.write_register("x3", x3)?;
        }

        let stub = format!(
            "{spsr}\nmsr spsr_el3, x0\n{elr}\nmsr elr_el3, x0\n{funcid}\neret",
            spsr = load_immediate(0, self.config.smc_spsr_value),
            elr = load_immediate(0, eret_entrypoint),
            funcid = load_immediate(0, function_identifier),
        );
        self.write_emulator_stub(&stub)
    }

    // The reverse direction: hand the emulator TZOS's reply to the real
    // normal world. The function identifier slot is not used over there;
    // the shm cookie, when present, travels in r5.
    fn forward_to_physical_device(&mut self) -> Result<()> {
        let eret_entrypoint = self.config.smc_physical_device_entrypoint + 4;

        let (x1, x2, x4) = {
            let mut emulator = self.emulator.lock().expect("emulator lock");
            (
                emulator.read_register("x1")?,
                emulator.read_register("x2")?,
                emulator.read_register("x4")?,
            )
        };

        let mut device = self.physical_device.lock().expect("physical device lock");
        device.write_register("r0", x1)?;
        device.write_register("r1", x2)?;
        let cookie = device.read_register("r5")?;
        if cookie != 0 {
            device.write_register("r2", cookie)?;
        } else {
            let fallback = device.read_register("r3")?;
            device.write_register("r2", fallback)?;
        }
        device.write_register("r3", x4)?;
        device.write_register("pc", eret_entrypoint)?;
        Ok(())
    }
}
