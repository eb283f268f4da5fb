// TEE driver emulation
// Plays the role of the normal-world OP-TEE Linux driver: reacts to the RPC
// function requested in x1 whenever the TZOS switches worlds, then parks
// OPTEE_SMC_CALL_RETURN_FROM_RPC in x0 so the TZOS resumes correctly.

use std::path::Path;
use std::sync::{Arc, Mutex};

use teehost_core::secure_monitor::TeeDriverEmulator;
use teehost_core::{CoreError, Result, RunEvent, TargetHandle};

use crate::shm::NonSecureSharedMemoryManager;
use crate::supplicant::OpteeTeeSupplicantEmulator;
use crate::{
    OPTEE_SMC_CALL_RETURN_FROM_RPC, OPTEE_SMC_RETURN_OK, OPTEE_SMC_RPC_FUNC_ALLOC,
    OPTEE_SMC_RPC_FUNC_CMD, OPTEE_SMC_RPC_FUNC_FREE,
};

pub struct OpteeTeeDriverEmulator {
    target: TargetHandle,
    shm_manager: Arc<Mutex<NonSecureSharedMemoryManager>>,
    supplicant: OpteeTeeSupplicantEmulator,
}

impl OpteeTeeDriverEmulator {
    pub fn new(
        target: TargetHandle,
        nsec_shared_memory_address: u64,
        trusted_apps_dir: &Path,
        secure_storage_dir: &Path,
    ) -> Result<Self> {
        let shm_manager = Arc::new(Mutex::new(NonSecureSharedMemoryManager::new(
            nsec_shared_memory_address,
        )));
        let supplicant = OpteeTeeSupplicantEmulator::new(
            target.clone(),
            shm_manager.clone(),
            trusted_apps_dir,
            secure_storage_dir,
        )?;
        Ok(Self {
            target,
            shm_manager,
            supplicant,
        })
    }

    fn handle_memory_allocation(&mut self) -> Result<()> {
        let size = self
            .target
            .lock()
            .expect("target lock")
            .read_register("x2")?;
        log::debug!("TZOS wants to allocate shared memory, size: {size:#x}");

        let shm = self
            .shm_manager
            .lock()
            .expect("shm manager lock")
            .allocate_bytes(size);

        let mut target = self.target.lock().expect("target lock");
        // physical address in x1:x2, matching virtual address in x4:x5
        target.write_register("x1", 0)?;
        target.write_register("x2", shm)?;
        target.write_register("x4", 0)?;
        target.write_register("x5", shm)?;
        // anything non-zero here earns an EBADADDR from the TZOS
        target.write_register("x3", 0)?;
        target.write_register("x6", 0)?;
        Ok(())
    }

    fn handle_memory_free(&mut self) -> Result<()> {
        let address = {
            let mut target = self.target.lock().expect("target lock");
            (target.read_register("x2")? << 32) | target.read_register("x3")?
        };
        self.shm_manager
            .lock()
            .expect("shm manager lock")
            .free(address)?;

        let mut target = self.target.lock().expect("target lock");
        for register in ["x0", "x1", "x2", "x3", "x4", "x5", "x6"] {
            target.write_register(register, 0)?;
        }
        Ok(())
    }

    fn rpc_error_message(rpc_func: u64) -> &'static str {
        match rpc_func {
            0x1 => "OPTEE_SMC_RETURN_ETHREAD_LIMIT",
            0x2 => "OPTEE_SMC_RETURN_EBUSY",
            0x3 => "OPTEE_SMC_RETURN_ERESUME",
            0x4 => "OPTEE_SMC_RETURN_EBADADDR",
            0x5 => "OPTEE_SMC_RETURN_EBADCMD",
            0x6 => "OPTEE_SMC_RETURN_ENOMEM",
            0x7 => "OPTEE_SMC_RETURN_ENOTAVAIL",
            _ => "unknown RPC function",
        }
    }
}

impl TeeDriverEmulator for OpteeTeeDriverEmulator {
    fn handle_rpc(&mut self) -> Result<Option<RunEvent>> {
        let rpc_func = self
            .target
            .lock()
            .expect("target lock")
            .read_register("x1")?;
        log::info!("handling RPC call: {rpc_func:#x}");

        match rpc_func {
            OPTEE_SMC_RPC_FUNC_ALLOC => self.handle_memory_allocation()?,
            OPTEE_SMC_RPC_FUNC_FREE => self.handle_memory_free()?,
            OPTEE_SMC_RPC_FUNC_CMD => self.supplicant.handle_rpc_cmd()?,
            OPTEE_SMC_RETURN_OK => {
                // the call staged by the strategy has completed
                return Ok(Some(RunEvent::CommandFinished));
            }
            other => {
                let message = Self::rpc_error_message(other).to_string();
                log::error!("{message} ({other:#x})");
                // continuing past an unserviceable RPC only spams the log
                return Err(CoreError::UnsupportedRpc {
                    rpc_func: other,
                    message,
                });
            }
        }

        self.target
            .lock()
            .expect("target lock")
            .write_register("x0", OPTEE_SMC_CALL_RETURN_FROM_RPC)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teehost_core::mock_target::MockTarget;

    fn driver() -> (
        Arc<Mutex<MockTarget>>,
        tempfile::TempDir,
        OpteeTeeDriverEmulator,
    ) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        mock.lock().unwrap().map_ram(0x4200_0000, 0x20_0000);
        let dir = tempfile::tempdir().unwrap();
        let driver = OpteeTeeDriverEmulator::new(
            mock.clone(),
            0x4200_0000,
            dir.path(),
            &dir.path().join("secure-storage"),
        )
        .unwrap();
        (mock, dir, driver)
    }

    #[test]
    fn test_alloc_register_contract() {
        let (mock, _dir, mut driver) = driver();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x1", OPTEE_SMC_RPC_FUNC_ALLOC);
            mock.cpu().set_reg("x2", 0x2000);
            mock.cpu().set_reg("x3", 0x5555);
            mock.cpu().set_reg("x6", 0x6666);
        }

        assert_eq!(driver.handle_rpc().unwrap(), None);

        let mut mock = mock.lock().unwrap();
        let address = mock.cpu().reg("x2");
        assert_eq!(address % 0x1000, 0);
        assert_eq!(mock.cpu().reg("x1"), 0);
        assert_eq!(mock.cpu().reg("x4"), 0);
        assert_eq!(mock.cpu().reg("x5"), address);
        assert_eq!(mock.cpu().reg("x3"), 0);
        assert_eq!(mock.cpu().reg("x6"), 0);
        assert_eq!(mock.cpu().reg("x0"), OPTEE_SMC_CALL_RETURN_FROM_RPC);
    }

    #[test]
    fn test_free_combines_split_address_and_clears_registers() {
        let (mock, _dir, mut driver) = driver();
        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x1", OPTEE_SMC_RPC_FUNC_ALLOC);
            mock.cpu().set_reg("x2", 0x1000);
        }
        driver.handle_rpc().unwrap();
        let allocated = mock.lock().unwrap().cpu().reg("x2");

        {
            let mut mock = mock.lock().unwrap();
            mock.cpu().set_reg("x1", OPTEE_SMC_RPC_FUNC_FREE);
            mock.cpu().set_reg("x2", allocated >> 32);
            mock.cpu().set_reg("x3", allocated & 0xFFFF_FFFF);
        }
        assert_eq!(driver.handle_rpc().unwrap(), None);

        let mut mock = mock.lock().unwrap();
        for register in ["x1", "x2", "x3", "x4", "x5", "x6"] {
            assert_eq!(mock.cpu().reg(register), 0, "{register}");
        }
        assert_eq!(mock.cpu().reg("x0"), OPTEE_SMC_CALL_RETURN_FROM_RPC);
    }

    #[test]
    fn test_return_ok_surfaces_command_finished() {
        let (mock, _dir, mut driver) = driver();
        mock.lock().unwrap().cpu().set_reg("x1", OPTEE_SMC_RETURN_OK);
        assert_eq!(
            driver.handle_rpc().unwrap(),
            Some(RunEvent::CommandFinished)
        );
        // x0 stays untouched on the event path
        assert_eq!(mock.lock().unwrap().cpu().reg("x0"), 0);
    }

    #[test]
    fn test_known_error_codes_are_unsupported_rpcs() {
        let (mock, _dir, mut driver) = driver();
        mock.lock().unwrap().cpu().set_reg("x1", 0x6);
        match driver.handle_rpc() {
            Err(CoreError::UnsupportedRpc { rpc_func, message }) => {
                assert_eq!(rpc_func, 0x6);
                assert_eq!(message, "OPTEE_SMC_RETURN_ENOMEM");
            }
            other => panic!("expected UnsupportedRpc, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_rpc_func_is_unsupported() {
        let (mock, _dir, mut driver) = driver();
        mock.lock().unwrap().cpu().set_reg("x1", 0xDEAD_BEEF);
        assert!(matches!(
            driver.handle_rpc(),
            Err(CoreError::UnsupportedRpc { rpc_func: 0xDEAD_BEEF, .. })
        ));
    }
}
