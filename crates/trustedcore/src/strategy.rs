// Call-into-TZOS strategy, TrustedCore flavor
// TrustedCore consumes commands from a bounded ring inside shared memory: a
// 32-bit index prefix followed by 0x35-byte slots. Results come back in a
// separate outbound queue and are matched by event number, since the TZOS
// does not answer in submission order.

use std::sync::Arc;

use teehost_core::tzos_runner::{CallIntoTzosStrategy, CommandResult};
use teehost_core::wire::{read_fixed_struct, WireStruct};
use teehost_core::{RehostingContext, Result};

use crate::structs::TcNsSmcCmd;
use crate::TSP_REQUEST;

// 0x26 command slots fit in the queue, but TrustedCore has been observed to
// misbehave near the end, so submission wraps early at 0x24.
const RING_CAPACITY: u32 = 0x26;
const RING_WRAP_AT: u32 = 0x24;

// slots begin right after the 32-bit submission index
const INBOUND_QUEUE_OFFSET: u64 = 0x4;
// the outbound queue the TZOS answers into
const OUTBOUND_QUEUE_OFFSET: u64 = 0x4 + 0x4 + 0x7DE;

pub struct TrustedCoreCallIntoTzosStrategy {
    context: Arc<RehostingContext>,
    counter: u32,
    current_event_nr: u32,
}

impl TrustedCoreCallIntoTzosStrategy {
    pub fn new(context: Arc<RehostingContext>) -> Self {
        Self {
            context,
            counter: 0,
            current_event_nr: 0,
        }
    }

    fn read_outbound_slot(&self, index: u32) -> Result<TcNsSmcCmd> {
        let address = self.context.shared_memory_address()
            + OUTBOUND_QUEUE_OFFSET
            + u64::from(index) * TcNsSmcCmd::WIRE_SLOT_SIZE as u64;
        read_fixed_struct(self.context.target(), address, TcNsSmcCmd::SIZE)
    }
}

impl CallIntoTzosStrategy for TrustedCoreCallIntoTzosStrategy {
    type Command = TcNsSmcCmd;
    type Response = TcNsSmcCmd;

    fn execute_tzos_command(&mut self, command: &TcNsSmcCmd) -> Result<()> {
        let eret_entrypoint = self.context.require_tzos_eret_entrypoint()?;

        // remember the event number so the answer can be found later
        self.current_event_nr = command.event_nr;

        let base = self.context.shared_memory_address();
        let slot_address = base
            + INBOUND_QUEUE_OFFSET
            + u64::from(self.counter) * TcNsSmcCmd::WIRE_SLOT_SIZE as u64;
        log::debug!(
            "staging command event_nr={:#x} in slot {:#x} at {slot_address:#x}",
            command.event_nr,
            self.counter
        );

        {
            let mut target = self.context.target().lock().expect("target lock");
            // bump the submission index ahead of the payload
            target.write_word(base, 4, u64::from(self.counter) + 1)?;
            // the slot stride cuts the serialized command short
            let bytes = command.to_bytes();
            target.write_memory(slot_address, &bytes[..TcNsSmcCmd::WIRE_SLOT_SIZE])?;
        }

        self.counter += 1;
        if self.counter >= RING_WRAP_AT {
            self.counter = 0;
        }

        self.context
            .write_system_register("spsr_el3", self.context.smc_spsr_value())?;
        self.context
            .write_system_register("elr_el3", eret_entrypoint)?;

        {
            let mut target = self.context.target().lock().expect("target lock");
            target.write_register("x0", TSP_REQUEST)?;
            target.write_register("x1", base)?;
            // command flag; 0xF covers everything exercised so far
            target.write_register("x2", 0xF)?;
        }

        self.context.write_smc_return_assembly("eret")?;
        Ok(())
    }

    fn parse_return_value(&mut self) -> Result<CommandResult<TcNsSmcCmd>> {
        // the answer can be in any outbound slot, probe them in order
        let mut response = self.read_outbound_slot(0)?;
        let mut index = 0;
        while response.event_nr != self.current_event_nr {
            index += 1;
            if index > RING_CAPACITY {
                log::warn!(
                    "no outbound slot matches event_nr {:#x}, returning last probe",
                    self.current_event_nr
                );
                return Ok(CommandResult::Ok(response));
            }
            response = self.read_outbound_slot(index)?;
        }
        Ok(CommandResult::Ok(response))
    }
}
