// Command builders
// Ready-made TC_NS_SMC_CMD builders for driving TrustedCore's global task:
// agent registration, keystore session setup and TA command invocation.
// UUID and operation blobs are parked in shared memory through the bump
// manager and referenced by physical address.

use teehost_core::wire::WireStruct;
use teehost_core::Result;

use crate::shm::SharedMemoryManager;
use crate::structs::{TcNsSmcCmd, TcOperation, TcParam};

/// cmd_id values understood by the global task.
pub const TC_CMD_OPEN_SESSION: u32 = 0x2;
pub const TC_CMD_REGISTER_AGENT: u32 = 0x6;

/// TEEC_LOGIN_IDENTIFY, the login method TrustedCore services expect.
pub const TC_LOGIN_IDENTIFY: u32 = 0x7;

/// uid the keystore daemon runs under.
pub const KEYSTORED_UID: u32 = 1017;

/// Register a normal-world agent with the global task.
pub fn register_agent(
    manager: &mut SharedMemoryManager,
    agent_id: u32,
    event_nr: u32,
) -> Result<TcNsSmcCmd> {
    let operation = TcOperation::new(
        0x1000,
        [
            TcParam::new(0x9000_0000, 0x1000),
            TcParam::default(),
            TcParam::default(),
            TcParam::default(),
        ],
    );

    // agents register under the all-but-first-zero UUID
    let mut uuid = [0u8; 17];
    uuid[0] = 0x01;
    let uuid_phys = manager.allocate(&uuid)? as u32;
    let operation_phys = manager.allocate(&operation.to_bytes())? as u32;

    Ok(TcNsSmcCmd {
        uuid_phys,
        cmd_id: TC_CMD_REGISTER_AGENT,
        agent_id,
        operation_phys,
        login_method: TC_LOGIN_IDENTIFY,
        event_nr,
        ..TcNsSmcCmd::default()
    })
}

/// Open a session with the TA identified by the 17-byte `uuid` blob,
/// authenticating as the keystore daemon.
pub fn open_ta_session(
    manager: &mut SharedMemoryManager,
    uuid: &[u8; 17],
    event_nr: u32,
) -> Result<TcNsSmcCmd> {
    let uid_address = manager.allocate(&0x3F9u32.to_le_bytes())? as u32;
    let ta_path = b"/system/bin/keystore";
    let ta_path_address = manager.allocate(ta_path)? as u32;

    let operation = TcOperation::new(
        0x5502,
        [
            TcParam::default(),
            TcParam::default(),
            TcParam::new(uid_address, 0x4),
            TcParam::new(ta_path_address, 0x29),
        ],
    );

    let uuid_phys = manager.allocate(uuid)? as u32;
    let operation_phys = manager.allocate(&operation.to_bytes())? as u32;

    Ok(TcNsSmcCmd {
        uuid_phys,
        cmd_id: TC_CMD_OPEN_SESSION,
        operation_phys,
        login_method: TC_LOGIN_IDENTIFY,
        uid: KEYSTORED_UID,
        event_nr,
        ..TcNsSmcCmd::default()
    })
}

/// Invoke a TA command inside the session that `open_response` came back
/// with. With the UUID's first byte zero, cmd_id is interpreted by the TA.
pub fn invoke_ta_command(
    manager: &mut SharedMemoryManager,
    open_response: &TcNsSmcCmd,
    cmd_id: u32,
    event_nr: u32,
) -> Result<TcNsSmcCmd> {
    let scratch_address = manager.allocate(&0x1234u32.to_le_bytes())? as u32;
    let operation = TcOperation::new(
        0x0026,
        [
            TcParam::new(scratch_address, 0x10),
            TcParam::default(),
            TcParam::default(),
            TcParam::default(),
        ],
    );

    let mut uuid = [0x07u8; 17];
    uuid[0] = 0x00;
    let uuid_phys = manager.allocate(&uuid)? as u32;
    let operation_phys = manager.allocate(&operation.to_bytes())? as u32;

    Ok(TcNsSmcCmd {
        uuid_phys,
        cmd_id,
        context_id: open_response.context_id,
        operation_phys,
        login_method: TC_LOGIN_IDENTIFY,
        event_nr,
        ..TcNsSmcCmd::default()
    })
}
