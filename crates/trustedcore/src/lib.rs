// TEEHOST TrustedCore flavor
// Everything specific to rehosting Huawei's TrustedCore TZOS: the
// TC_NS_SMC_CMD wire structs, the ring-buffer call strategy, the trivial
// TEE driver emulation and the platform factory.

pub mod commands;
pub mod driver;
pub mod exception;
pub mod factory;
pub mod shm;
pub mod strategy;
pub mod structs;

pub use driver::TrustedCoreTeeDriverEmulator;
pub use factory::{TrustedCoreP9LiteFactory, TrustedCoreSession};
pub use shm::SharedMemoryManager;
pub use strategy::TrustedCoreCallIntoTzosStrategy;
pub use structs::{TcNsSmcCmd, TcOperation, TcParam};

// SMC function identifiers observed in x0.

/// Host -> TZOS: process the command queue staged in shared memory.
pub const TSP_REQUEST: u64 = 0xB200_0008;
/// TZOS -> host: boot finished, x1 carries the eret entrypoint.
pub const TC_SMC_RETURN_FROM_BOOT: u64 = 0xB200_0000;
/// TZOS -> host: call into the normal world.
pub const TC_SMC_NW_CALL: u64 = 0xB200_0009;

/// SPSR value restored before every eret into TrustedCore (AArch32 svc).
pub const TC_SMC_SPSR_VALUE: u64 = 0x2000_0113;
