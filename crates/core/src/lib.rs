// TEEHOST rehosting core
// Target abstraction, breakpoint-driven runner and secure-monitor emulation
// for driving a rehosted TrustZone TZOS inside an instrumented emulator.

use std::sync::{Arc, Mutex};

pub mod asm;
pub mod boot_patcher;
pub mod code_exec;
pub mod context;
pub mod memory_map;
pub mod mock_target;
pub mod peripherals;
pub mod progress_monitor;
pub mod runner;
pub mod secure_monitor;
pub mod target;
pub mod target_bridge;
pub mod tzos_runner;
pub mod wire;

pub use context::RehostingContext;
pub use runner::{BreakpointHandler, BreakpointHandlingRunner};
pub use secure_monitor::{SecureMonitorEmulator, TeeDriverEmulator};
pub use target::{Target, TargetState};
pub use tzos_runner::{CallIntoTzosStrategy, CommandResult, TzosCallError, TzosRunner};

/// Shared handle to a target; everything in the session holds one of these.
pub type TargetHandle = Arc<Mutex<dyn Target + Send>>;

/// Events surfaced out of the breakpoint runner by handlers.
///
/// Handlers return an event value instead of unwinding, so the runner's
/// `cont()` can hand labeled events to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// The TZOS finished booting and reported its eret entrypoint.
    Booted,
    /// The last command sent into the TZOS has completed; the result can be
    /// parsed from shared memory by the active strategy.
    CommandFinished,
    /// Control is being handed over to the peer target (cross-device
    /// forwarding only).
    WorldSwitch,
}

/// Error type shared by all core components.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("target must be stopped for {operation}, but is {state:?}")]
    TargetNotStopped {
        operation: &'static str,
        state: TargetState,
    },

    #[error("target exited")]
    TargetExited,

    #[error("breakpoint hit at {pc:#x} is not managed by any registered handler")]
    ForeignBreakpoint { pc: u64 },

    #[error("breakpoint address {address:#x} is already claimed by another handler")]
    DuplicateBreakpoint { address: u64 },

    #[error("unknown register: {name}")]
    UnknownRegister { name: String },

    #[error("memory access out of range: {address:#x} (+{size:#x})")]
    MemoryAccess { address: u64, size: usize },

    #[error("memory range {name:?} at {address:#x} overlaps an existing range")]
    OverlappingRange { name: String, address: u64 },

    #[error("TZOS eret entrypoint has already been recorded")]
    EretEntrypointAlreadySet,

    #[error("TZOS has not booted yet, eret entrypoint unknown")]
    TzosNotBooted,

    #[error("unsupported RPC function {rpc_func:#x} received: {message}")]
    UnsupportedRpc { rpc_func: u64, message: String },

    #[error("cannot handle unknown command ID {cmd:#x}")]
    UnknownCommand { cmd: u32 },

    #[error("no shared memory range allocated at {address:#x}")]
    MemoryRangeNotFound { address: u64 },

    #[error("unsupported filename received from secure world: {name:?}")]
    UnsupportedFilename { name: String },

    #[error("unknown file descriptor {fd}")]
    UnknownFileDescriptor { fd: u32 },

    #[error("unrecoverable exception handler reached at {pc:#x}")]
    FatalException { pc: u64 },

    #[error("unexpected event {event:?}")]
    UnexpectedEvent { event: RunEvent },

    #[error("assembler error: {0}")]
    Asm(#[from] asm::AsmError),

    #[error("wire struct error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Initialize env_logger once for the whole process.
///
/// Subsequent calls are no-ops, so libraries and tests can call this freely.
pub fn setup_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .is_test(cfg!(test))
    .try_init();
}
