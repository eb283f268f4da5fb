// Breakpoint-handling runner
// The sole scheduler of a target: continues it in a loop and dispatches
// every stop to the handler that registered the address, until a handler
// surfaces an event or an unmanaged breakpoint is reached.

use std::collections::HashMap;

use crate::code_exec::wait_until_stopped;
use crate::target::TargetState;
use crate::{CoreError, Result, RunEvent, TargetHandle};

/// A component reacting to breakpoints at a fixed set of addresses.
///
/// Handlers may read and write registers and memory, and may surface a
/// [`RunEvent`] to hand control back to the caller of the runner.
pub trait BreakpointHandler {
    fn breakpoint_addresses(&self) -> Vec<u64>;

    fn handle_breakpoint(&mut self, pc: u64) -> Result<Option<RunEvent>>;
}

/// Continues a target in a loop, multiplexing registered handler sets.
pub struct BreakpointHandlingRunner {
    target: TargetHandle,
    handlers: Vec<Box<dyn BreakpointHandler + Send>>,
    dispatch: HashMap<u64, usize>,
}

impl BreakpointHandlingRunner {
    pub fn new(target: TargetHandle) -> Self {
        Self {
            target,
            handlers: Vec::new(),
            dispatch: HashMap::new(),
        }
    }

    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    /// Register a handler and install its breakpoints.
    ///
    /// Only one callback may exist per address; a handler that needs to
    /// react to an address claimed by another must compose with it
    /// explicitly.
    pub fn register_handler(&mut self, handler: Box<dyn BreakpointHandler + Send>) -> Result<()> {
        let addresses = handler.breakpoint_addresses();
        for &address in &addresses {
            if self.dispatch.contains_key(&address) {
                return Err(CoreError::DuplicateBreakpoint { address });
            }
        }

        let index = self.handlers.len();
        for &address in &addresses {
            self.target
                .lock()
                .expect("target lock")
                .set_breakpoint(address)?;
            self.dispatch.insert(address, index);
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Continue execution until a handler surfaces an event.
    ///
    /// Register and memory writes issued by a handler are observed by the
    /// target on the next resume. A stop at an address no handler manages
    /// leaves the target where it is and returns
    /// [`CoreError::ForeignBreakpoint`].
    pub fn cont(&mut self) -> Result<RunEvent> {
        loop {
            {
                let mut target = self.target.lock().expect("target lock");
                target.cont()?;
                target.wait()?;
            }
            if self.target.lock().expect("target lock").state() == TargetState::Exited {
                return Err(CoreError::TargetExited);
            }
            wait_until_stopped(&self.target)?;

            let pc = self.target.lock().expect("target lock").read_register("pc")?;
            let Some(&handler_index) = self.dispatch.get(&pc) else {
                return Err(CoreError::ForeignBreakpoint { pc });
            };

            log::trace!("dispatching breakpoint at {pc:#x}");
            if let Some(event) = self.handlers[handler_index].handle_breakpoint(pc)? {
                log::debug!("handler at {pc:#x} surfaced {event:?}");
                return Ok(event);
            }
        }
    }
}
