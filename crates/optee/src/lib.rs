// TEEHOST OP-TEE flavor
// Everything specific to rehosting an OP-TEE TZOS: the optee_msg wire
// structs, the normal-world TEE driver and supplicant emulation, the call
// strategy, the cross-device SMC forwarder and the platform factories.

pub mod commands;
pub mod driver;
pub mod factory;
pub mod forwarder;
pub mod shm;
pub mod storage;
pub mod strategy;
pub mod structs;
pub mod supplicant;

pub use driver::OpteeTeeDriverEmulator;
pub use factory::{OpteeHiKey620Factory, OpteeQemuv8Factory, OpteeSession};
pub use strategy::OpteeCallIntoTzosStrategy;
pub use structs::{OpteeMsgArg, OpteeMsgParam, OpteeMsgParamValue};

// SMC function identifiers observed in x0.

/// Host -> TZOS: execute the command staged in shared memory.
pub const OPTEE_SMC_CALL_WITH_ARG: u64 = 0x3200_0004;
/// Host -> TZOS: resume after a serviced RPC.
pub const OPTEE_SMC_CALL_RETURN_FROM_RPC: u64 = 0x3200_0003;
/// Newer-driver variant of call-with-arg, seen on physical normal worlds.
pub const OPTEE_SMC_CALL_WITH_RPC_ARG: u64 = 0x3200_0012;
/// TZOS -> host: boot finished, x1 carries the eret entrypoint.
pub const OPTEE_SMC_RETURN_FROM_BOOT: u64 = 0xBE00_0000;
/// TZOS -> host: call into the normal world, x1 carries the RPC function.
pub const OPTEE_SMC_NW_CALL: u64 = 0xBE00_0005;

// RPC function identifiers observed in x1 during a normal-world call.

pub const OPTEE_SMC_RPC_FUNC_ALLOC: u64 = 0xFFFF_0000;
pub const OPTEE_SMC_RPC_FUNC_FREE: u64 = 0xFFFF_0002;
pub const OPTEE_SMC_RPC_FUNC_CMD: u64 = 0xFFFF_0005;
pub const OPTEE_SMC_RETURN_OK: u64 = 0x0;

// Supplicant command identifiers (optee_msg_arg.cmd).

pub const OPTEE_MSG_RPC_CMD_LOAD_TA: u32 = 0;
pub const OPTEE_MSG_RPC_CMD_FS: u32 = 2;
pub const OPTEE_MSG_RPC_CMD_SHM_ALLOC: u32 = 6;
pub const OPTEE_MSG_RPC_CMD_SHM_FREE: u32 = 7;

// Secure-storage sub-operations (params[0].a of an FS command).

pub const OPTEE_MRF_OPEN: u64 = 0;
pub const OPTEE_MRF_CREATE: u64 = 1;
pub const OPTEE_MRF_READ: u64 = 3;
pub const OPTEE_MRF_WRITE: u64 = 4;

/// arg.ret value reported when an opened file does not exist.
pub const TEEC_ERROR_ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
/// arg.ret_origin reported for everything the supplicant answers.
pub const TEEC_ORIGIN_COMMS: u32 = 0x2;
