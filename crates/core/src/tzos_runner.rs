// TZOS runner
// Synchronous facade over the breakpoint runner: "boot" and "execute
// command" instead of raw continue/dispatch loops. Maps the labeled events
// surfaced by the handlers to call results.

use std::fmt;

use crate::runner::BreakpointHandlingRunner;
use crate::{CoreError, Result, RunEvent};

/// Result of parsing a completed TZOS command from shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult<R> {
    /// The TZOS reported success.
    Ok(R),
    /// The TZOS returned a non-zero result; the parsed struct is attached.
    Failed(R),
}

/// TZOS-family-specific way of calling into the secure world.
///
/// `execute_tzos_command` stages the wire command in shared memory and
/// prepares registers and the return stub; `parse_return_value` recovers the
/// response once the command has finished.
pub trait CallIntoTzosStrategy {
    type Command;
    type Response: fmt::Debug;

    fn execute_tzos_command(&mut self, command: &Self::Command) -> Result<()>;

    fn parse_return_value(&mut self) -> Result<CommandResult<Self::Response>>;
}

/// Error surfaced by TZOS-level calls; carries the parsed response when the
/// TZOS itself reported the failure.
#[derive(Debug, thiserror::Error)]
pub enum TzosCallError<R: fmt::Debug> {
    #[error("TZOS command failed: {0:?}")]
    CommandFailed(R),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct TzosRunner<S: CallIntoTzosStrategy> {
    runner: BreakpointHandlingRunner,
    strategy: S,
}

impl<S: CallIntoTzosStrategy> TzosRunner<S> {
    pub fn new(runner: BreakpointHandlingRunner, strategy: S) -> Self {
        Self { runner, strategy }
    }

    pub fn runner(&mut self) -> &mut BreakpointHandlingRunner {
        &mut self.runner
    }

    pub fn strategy(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// Continue execution until the TZOS has booted (`None`) or the pending
    /// command has finished (parsed result).
    ///
    /// Usually called once to boot; afterwards, `execute_tzos_command` is
    /// the intended entry point. A breakpoint not managed by any handler
    /// surfaces as [`CoreError::ForeignBreakpoint`], after which execution
    /// may be continued with another `cont()`.
    pub fn cont(&mut self) -> Result<Option<S::Response>, TzosCallError<S::Response>> {
        match self.runner.cont()? {
            RunEvent::Booted => Ok(None),
            RunEvent::CommandFinished => match self.strategy.parse_return_value()? {
                CommandResult::Ok(response) => Ok(Some(response)),
                CommandResult::Failed(response) => {
                    Err(TzosCallError::CommandFailed(response))
                }
            },
            event @ RunEvent::WorldSwitch => {
                Err(TzosCallError::Core(CoreError::UnexpectedEvent { event }))
            }
        }
    }

    /// Execute a TZOS command, continue execution and return the parsed
    /// result.
    ///
    /// With `fail_silently`, a command the TZOS rejected is returned like a
    /// successful one instead of erroring out.
    pub fn execute_tzos_command(
        &mut self,
        command: &S::Command,
        fail_silently: bool,
    ) -> Result<S::Response, TzosCallError<S::Response>> {
        self.strategy.execute_tzos_command(command)?;

        match self.cont() {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(TzosCallError::Core(CoreError::UnexpectedEvent {
                event: RunEvent::Booted,
            })),
            Err(TzosCallError::CommandFailed(response)) if fail_silently => Ok(response),
            Err(error) => Err(error),
        }
    }
}
