// Boot patcher
// TZOS images probe hardware the emulator does not model (GIC system
// registers, crypto cells, ...). The patch tables describing where to poke
// which register are configuration data per image build; this handler
// applies them uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::RehostingContext;
use crate::runner::BreakpointHandler;
use crate::{Result, RunEvent};

/// What to do when a patched address is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    /// Write a fixed value into a register.
    SetRegister { register: String, value: u64 },
    /// Jump over the instruction at the patch address.
    SkipInstruction,
}

/// One per-address boot patch, loadable from JSON tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootPatch {
    pub address: u64,
    /// Free-form description of what the patched code would have done.
    #[serde(default)]
    pub note: String,
    pub action: PatchAction,
}

/// Parse a JSON boot-patch table.
pub fn parse_patch_table(json: &str) -> serde_json::Result<Vec<BootPatch>> {
    serde_json::from_str(json)
}

/// Applies configured register pokes while the TZOS boots.
pub struct BootPatcher {
    context: Arc<RehostingContext>,
    patches: HashMap<u64, BootPatch>,
}

impl BootPatcher {
    pub fn new(context: Arc<RehostingContext>, patches: Vec<BootPatch>) -> Self {
        let patches = patches.into_iter().map(|p| (p.address, p)).collect();
        Self { context, patches }
    }
}

impl BreakpointHandler for BootPatcher {
    fn breakpoint_addresses(&self) -> Vec<u64> {
        self.patches.keys().copied().collect()
    }

    fn handle_breakpoint(&mut self, pc: u64) -> Result<Option<RunEvent>> {
        let Some(patch) = self.patches.get(&pc) else {
            return Ok(None);
        };
        log::debug!("boot patch at {pc:#x}: {}", patch.note);

        let bridge = self.context.target_bridge();
        match &patch.action {
            PatchAction::SetRegister { register, value } => {
                bridge.write_register(register, *value)?;
            }
            PatchAction::SkipInstruction => {
                bridge.write_register("pc", pc + 4)?;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_exec::TemporaryCodeExecutionHelper;
    use crate::context::RehostingContextConfig;
    use crate::mock_target::MockTarget;
    use crate::peripherals::in_memory_buffer;
    use crate::target_bridge::DefaultTargetBridge;
    use crate::TargetHandle;
    use std::sync::Mutex;

    fn context() -> (Arc<Mutex<MockTarget>>, Arc<RehostingContext>) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let handle: TargetHandle = mock.clone();
        let shared = in_memory_buffer("shared_mem", 0x7000_0000, 0x1000);
        let code = in_memory_buffer("temp_code_execution", 0x7000_1000, 0x1000);
        let context = Arc::new(RehostingContext::new(
            handle.clone(),
            shared,
            TemporaryCodeExecutionHelper::new(handle.clone(), code),
            Box::new(DefaultTargetBridge::new(handle)),
            RehostingContextConfig {
                smc_entry_address: 0x400,
                smc_spsr_value: 0x600003C4,
                smc_boot_return_id: 0xBE00_0000,
                smc_nw_call_id: 0xBE00_0005,
                nsec_shared_memory_address: None,
                trusted_apps_dir: None,
            },
        ));
        (mock, context)
    }

    #[test]
    fn test_patch_table_round_trips_through_json() {
        let json = r#"[
            {"address": 236257156, "note": "indicate gic version 3",
             "action": {"set_register": {"register": "x1", "value": 3}}},
            {"address": 236257216, "note": "skip gic sysreg",
             "action": "skip_instruction"}
        ]"#;
        let patches = parse_patch_table(json).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(
            patches[0].action,
            PatchAction::SetRegister { register: "x1".into(), value: 3 }
        );
        assert_eq!(patches[1].action, PatchAction::SkipInstruction);
    }

    #[test]
    fn test_patches_apply_through_bridge() {
        let (mock, context) = context();
        let mut patcher = BootPatcher::new(
            context,
            vec![
                BootPatch {
                    address: 0xE10_FF84,
                    note: "indicate gic version 3".into(),
                    action: PatchAction::SetRegister { register: "x1".into(), value: 3 },
                },
                BootPatch {
                    address: 0xE10_FFC0,
                    note: "skip gic sysreg".into(),
                    action: PatchAction::SkipInstruction,
                },
            ],
        );

        mock.lock().unwrap().cpu().set_reg("pc", 0xE10_FF84);
        patcher.handle_breakpoint(0xE10_FF84).unwrap();
        assert_eq!(mock.lock().unwrap().cpu().reg("x1"), 3);

        mock.lock().unwrap().cpu().set_reg("pc", 0xE10_FFC0);
        patcher.handle_breakpoint(0xE10_FFC0).unwrap();
        assert_eq!(mock.lock().unwrap().cpu().reg("pc"), 0xE10_FFC4);
    }
}
