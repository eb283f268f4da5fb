// TEE supplicant emulation
// Services the RPC commands OP-TEE would normally send to the userspace
// tee-supplicant: shared-memory allocation, trusted-application loading and
// secure-storage file operations. The request struct travels through the
// shared memory range whose address arrives in x2:x3.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use teehost_core::{CoreError, Result, TargetHandle};
use uuid::Uuid;

use crate::shm::NonSecureSharedMemoryManager;
use crate::storage::OpteeSecureStorageEmulator;
use crate::structs::OpteeMsgArg;
use crate::{
    OPTEE_MSG_RPC_CMD_FS, OPTEE_MSG_RPC_CMD_LOAD_TA, OPTEE_MSG_RPC_CMD_SHM_ALLOC,
    OPTEE_MSG_RPC_CMD_SHM_FREE, TEEC_ORIGIN_COMMS,
};

pub struct OpteeTeeSupplicantEmulator {
    target: TargetHandle,
    shm_manager: Arc<Mutex<NonSecureSharedMemoryManager>>,
    secure_storage: OpteeSecureStorageEmulator,
    trusted_apps_dir: PathBuf,
}

impl OpteeTeeSupplicantEmulator {
    pub fn new(
        target: TargetHandle,
        shm_manager: Arc<Mutex<NonSecureSharedMemoryManager>>,
        trusted_apps_dir: &Path,
        secure_storage_dir: &Path,
    ) -> Result<Self> {
        let secure_storage =
            OpteeSecureStorageEmulator::new(target.clone(), secure_storage_dir)?;
        Ok(Self {
            target,
            shm_manager,
            secure_storage,
            trusted_apps_dir: trusted_apps_dir.to_path_buf(),
        })
    }

    fn handle_shm_alloc(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        // params[0].a carries the pool type, which does not matter here;
        // params[0].b is the requested size
        let requested = arg.params[0].value.b;
        log::debug!("supplicant SHM alloc, size {requested:#x}");

        let shm = self
            .shm_manager
            .lock()
            .expect("shm manager lock")
            .allocate_bytes(requested);

        // contiguous tmem output; the shm_ref cookie doubles as the address
        // to keep the bookkeeping trivial
        arg.params[0].attr = 0xA;
        arg.params[0].value.a = shm;
        arg.params[0].value.b = requested;
        arg.params[0].value.c = shm;
        arg.ret = 0;
        Ok(())
    }

    fn handle_shm_free(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        log::debug!("supplicant SHM free");
        self.shm_manager
            .lock()
            .expect("shm manager lock")
            .free(arg.params[0].value.b)?;
        arg.ret = 0;
        Ok(())
    }

    // The UUID arrives as two 64-bit little-endian words whose byte
    // concatenation is the canonical big-endian UUID.
    fn ta_file_name(arg: &OpteeMsgArg) -> String {
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&arg.params[0].value.a.to_le_bytes());
        uuid_bytes[8..].copy_from_slice(&arg.params[0].value.b.to_le_bytes());
        format!("{}.ta", Uuid::from_bytes(uuid_bytes).hyphenated())
    }

    fn handle_load_ta(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let file_name = Self::ta_file_name(arg);
        log::debug!("load TA request for {file_name}");

        let content = fs::read(self.trusted_apps_dir.join(&file_name))?;

        if arg.params[1].value.b != 0 {
            // a buffer was provided, fill it with the binary
            self.target
                .lock()
                .expect("target lock")
                .write_memory(arg.params[1].value.c, &content)?;
        }
        // with no buffer, the size reply tells the TZOS how big it must be
        arg.params[1].value.b = content.len() as u64;
        arg.ret = 0;
        Ok(())
    }

    /// Handle one OPTEE_SMC_RPC_FUNC_CMD request.
    pub fn handle_rpc_cmd(&mut self) -> Result<()> {
        let shm_address = {
            let mut target = self.target.lock().expect("target lock");
            (target.read_register("x2")? << 32) | target.read_register("x3")?
        };
        log::debug!("supplicant command, shared memory at {shm_address:#x}");

        let mut arg = OpteeMsgArg::read_from_target(&self.target, shm_address)?;
        log::debug!("received command {:#x} with {} param(s)", arg.cmd, arg.params.len());

        match arg.cmd {
            OPTEE_MSG_RPC_CMD_SHM_ALLOC => self.handle_shm_alloc(&mut arg)?,
            OPTEE_MSG_RPC_CMD_SHM_FREE => self.handle_shm_free(&mut arg)?,
            OPTEE_MSG_RPC_CMD_LOAD_TA => self.handle_load_ta(&mut arg)?,
            OPTEE_MSG_RPC_CMD_FS => self.secure_storage.handle_rpc(&mut arg)?,
            cmd => return Err(CoreError::UnknownCommand { cmd }),
        }

        arg.ret_origin = TEEC_ORIGIN_COMMS;
        arg.write_to_target(&self.target, shm_address)?;

        // the reply's location goes back in x1/x2
        let mut target = self.target.lock().expect("target lock");
        target.write_register("x1", 0)?;
        target.write_register("x2", shm_address)?;
        for register in ["x3", "x4", "x5", "x6"] {
            target.write_register(register, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{OpteeMsgParam, OpteeMsgParamValue};
    use teehost_core::mock_target::MockTarget;
    use teehost_core::wire::WireStruct;

    const SHM_BASE: u64 = 0x4200_0000;

    fn supplicant() -> (
        Arc<Mutex<MockTarget>>,
        tempfile::TempDir,
        OpteeTeeSupplicantEmulator,
    ) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        {
            let mut mock = mock.lock().unwrap();
            mock.map_ram(SHM_BASE, 0x20_0000);
            mock.map_ram(0x1_0000, 0x1000); // TA load buffer
        }
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(Mutex::new(NonSecureSharedMemoryManager::new(SHM_BASE)));
        let supplicant = OpteeTeeSupplicantEmulator::new(
            mock.clone(),
            manager,
            dir.path(),
            &dir.path().join("secure-storage"),
        )
        .unwrap();
        (mock, dir, supplicant)
    }

    fn stage_command(mock: &Arc<Mutex<MockTarget>>, address: u64, arg: &OpteeMsgArg) {
        let bytes = arg.to_bytes();
        let mut mock = mock.lock().unwrap();
        mock.cpu().write_mem(address, &bytes).unwrap();
        mock.cpu().set_reg("x2", address >> 32);
        mock.cpu().set_reg("x3", address & 0xFFFF_FFFF);
    }

    #[test]
    fn test_shm_alloc_fills_param_and_writes_back() {
        let (mock, _dir, mut supplicant) = supplicant();
        let arg = OpteeMsgArg {
            cmd: OPTEE_MSG_RPC_CMD_SHM_ALLOC,
            params: vec![OpteeMsgParam::new(0, OpteeMsgParamValue::new(0, 0x180, 0))],
            ..OpteeMsgArg::default()
        };
        stage_command(&mock, SHM_BASE + 0x1_0000, &arg);

        supplicant.handle_rpc_cmd().unwrap();

        let reply =
            OpteeMsgArg::read_from_target(&(mock.clone() as TargetHandle), SHM_BASE + 0x1_0000)
                .unwrap();
        assert_eq!(reply.ret, 0);
        assert_eq!(reply.ret_origin, TEEC_ORIGIN_COMMS);
        assert_eq!(reply.params[0].attr, 0xA);
        assert_eq!(reply.params[0].value.a, SHM_BASE);
        assert_eq!(reply.params[0].value.b, 0x180);
        assert_eq!(reply.params[0].value.c, SHM_BASE);

        let mut mock = mock.lock().unwrap();
        assert_eq!(mock.cpu().reg("x1"), 0);
        assert_eq!(mock.cpu().reg("x2"), SHM_BASE + 0x1_0000);
        assert_eq!(mock.cpu().reg("x6"), 0);
    }

    #[test]
    fn test_load_ta_writes_binary_and_size() {
        let (mock, dir, mut supplicant) = supplicant();
        fs::write(
            dir.path().join("11223344-5566-7788-99aa-bbccddeeff00.ta"),
            b"HELLO",
        )
        .unwrap();

        let uuid_bytes: [u8; 16] = [
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF, 0x00,
        ];
        let a = u64::from_le_bytes(uuid_bytes[..8].try_into().unwrap());
        let b = u64::from_le_bytes(uuid_bytes[8..].try_into().unwrap());

        let arg = OpteeMsgArg {
            cmd: OPTEE_MSG_RPC_CMD_LOAD_TA,
            params: vec![
                OpteeMsgParam::new(0, OpteeMsgParamValue::new(a, b, 0)),
                OpteeMsgParam::new(0, OpteeMsgParamValue::new(0, 0x1000, 0x1_0000)),
            ],
            ..OpteeMsgArg::default()
        };
        stage_command(&mock, SHM_BASE + 0x2_0000, &arg);

        supplicant.handle_rpc_cmd().unwrap();

        let mut locked = mock.lock().unwrap();
        assert_eq!(locked.cpu().read_mem(0x1_0000, 5).unwrap(), b"HELLO");
        drop(locked);
        let reply =
            OpteeMsgArg::read_from_target(&(mock.clone() as TargetHandle), SHM_BASE + 0x2_0000)
                .unwrap();
        assert_eq!(reply.params[1].value.b, 5);
        assert_eq!(reply.ret, 0);
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        let (mock, _dir, mut supplicant) = supplicant();
        let arg = OpteeMsgArg {
            cmd: 99,
            params: vec![OpteeMsgParam::default()],
            ..OpteeMsgArg::default()
        };
        stage_command(&mock, SHM_BASE + 0x3_0000, &arg);

        assert!(matches!(
            supplicant.handle_rpc_cmd(),
            Err(CoreError::UnknownCommand { cmd: 99 })
        ));
    }
}
