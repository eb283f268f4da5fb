// Fatal-exception handler
// TrustedCore funnels unrecoverable exceptions into a single handler that
// spins forever. Stopping the session the moment it is reached keeps the
// emulator from grinding through the loop (and, with instruction logging
// on, from producing gigabytes of output).

use std::sync::Arc;

use teehost_core::context::RehostingContext;
use teehost_core::runner::BreakpointHandler;
use teehost_core::{CoreError, Result, RunEvent};

pub struct FatalExceptionHandler {
    context: Arc<RehostingContext>,
    handler_address: u64,
}

impl FatalExceptionHandler {
    /// `handler_address` is the image's unrecoverable-exception handler
    /// (osExceptionHandle in TrustedCore builds).
    pub fn new(context: Arc<RehostingContext>, handler_address: u64) -> Self {
        Self {
            context,
            handler_address,
        }
    }

    fn dump_registers(&self) -> Result<()> {
        let bridge = self.context.target_bridge();
        for index in 0..15 {
            let name = format!("r{index}");
            let value = bridge.read_register(&name)?;
            log::error!("  {name} = {value:#010x}");
        }
        Ok(())
    }
}

impl BreakpointHandler for FatalExceptionHandler {
    fn breakpoint_addresses(&self) -> Vec<u64> {
        vec![self.handler_address]
    }

    fn handle_breakpoint(&mut self, pc: u64) -> Result<Option<RunEvent>> {
        log::error!("unrecoverable exception handler reached, dumping registers");
        self.dump_registers()?;
        Err(CoreError::FatalException { pc })
    }
}
