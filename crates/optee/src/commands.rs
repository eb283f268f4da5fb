// Command builders
// Ready-made optee_msg_arg builders for the client-application side of the
// protocol, reverse engineered from OP-TEE's session handling: open/close a
// TA session and invoke the demo TA commands.

use teehost_core::wire::WireError;
use teehost_core::Result;
use uuid::Uuid;

use crate::structs::{OpteeMsgArg, OpteeMsgParam, OpteeMsgParamValue};

/// cmd values understood by OP-TEE's std entry.
pub const OPTEE_MSG_CMD_OPEN_SESSION: u32 = 0;
pub const OPTEE_MSG_CMD_INVOKE_COMMAND: u32 = 1;
pub const OPTEE_MSG_CMD_CLOSE_SESSION: u32 = 2;

// OPTEE_MSG_ATTR_META | OPTEE_MSG_ATTR_TYPE_VALUE_INPUT
const ATTR_META_VALUE_INPUT: u64 = 0x101;
// OPTEE_MSG_ATTR_TYPE_VALUE_INOUT
const ATTR_VALUE_INOUT: u64 = 0x3;
// TEEC_MEMREF_TEMP_OUTPUT
const ATTR_MEMREF_TEMP_OUTPUT: u64 = 0x6;

fn uuid_to_param_value(hex_uuid: &str) -> Result<OpteeMsgParamValue> {
    let uuid = Uuid::parse_str(hex_uuid).map_err(|e| WireError::Implausible {
        context: format!("UUID {hex_uuid:?}: {e}"),
    })?;
    let bytes = uuid.as_bytes();

    // the UUID travels as two 64-bit little-endian words
    let a = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    let b = u64::from_le_bytes(bytes[8..].try_into().expect("8 bytes"));
    Ok(OpteeMsgParamValue::new(a, b, 0))
}

/// Open a session with the TA identified by `hex_uuid` (dashed or plain).
///
/// The session id comes back in the response's `session` field.
pub fn open_ta_session(hex_uuid: &str) -> Result<OpteeMsgArg> {
    Ok(OpteeMsgArg {
        cmd: OPTEE_MSG_CMD_OPEN_SESSION,
        params: vec![
            // the first meta parameter transports the TA's UUID
            OpteeMsgParam::new(ATTR_META_VALUE_INPUT, uuid_to_param_value(hex_uuid)?),
            // the second carries clnt_id->login; TEE_LOGIN_PUBLIC here
            OpteeMsgParam::new(ATTR_META_VALUE_INPUT, OpteeMsgParamValue::default()),
        ],
        ..OpteeMsgArg::default()
    })
}

pub fn close_ta_session(session: u32) -> OpteeMsgArg {
    OpteeMsgArg {
        cmd: OPTEE_MSG_CMD_CLOSE_SESSION,
        session,
        ..OpteeMsgArg::default()
    }
}

/// Invoke the hello-world TA's increment command on `value`.
pub fn ta_invoke_increment_command(session: u32, value: u64) -> OpteeMsgArg {
    OpteeMsgArg {
        cmd: OPTEE_MSG_CMD_INVOKE_COMMAND,
        func: 0,
        session,
        ret_origin: 2,
        params: vec![OpteeMsgParam::new(
            ATTR_VALUE_INOUT,
            OpteeMsgParamValue::new(value, 0, 0),
        )],
        ..OpteeMsgArg::default()
    }
}

/// Invoke the random TA's generate command; the TA writes `number_of_bytes`
/// bytes at `offset` relative to the staged struct.
pub fn ta_invoke_generate_random_command(
    session: u32,
    offset: u64,
    number_of_bytes: u64,
) -> OpteeMsgArg {
    OpteeMsgArg {
        cmd: OPTEE_MSG_CMD_INVOKE_COMMAND,
        func: 0,
        session,
        ret_origin: 2,
        params: vec![OpteeMsgParam::new(
            ATTR_MEMREF_TEMP_OUTPUT,
            // rmem body: offset, size, shm_ref
            OpteeMsgParamValue::new(offset, number_of_bytes, 0),
        )],
        ..OpteeMsgArg::default()
    }
}
