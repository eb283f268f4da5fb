// Progress monitor
// Pure observer: logs a label whenever the target passes one of a set of
// known addresses. The label tables are per-image configuration, useful to
// follow an opaque boot without a serial console.

use std::collections::HashMap;

use crate::runner::BreakpointHandler;
use crate::{Result, RunEvent};

pub struct ProgressMonitor {
    labels: HashMap<u64, String>,
}

impl ProgressMonitor {
    pub fn new(labels: HashMap<u64, String>) -> Self {
        Self { labels }
    }

    /// Load an address -> label table from JSON (addresses as strings or
    /// numbers are both accepted by serde_json's u64 handling).
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let labels: HashMap<u64, String> = serde_json::from_str(json)?;
        Ok(Self::new(labels))
    }
}

impl BreakpointHandler for ProgressMonitor {
    fn breakpoint_addresses(&self) -> Vec<u64> {
        self.labels.keys().copied().collect()
    }

    fn handle_breakpoint(&mut self, pc: u64) -> Result<Option<RunEvent>> {
        if let Some(label) = self.labels.get(&pc) {
            log::info!("pc={pc:#x}: {label}");
        }
        Ok(None)
    }
}
