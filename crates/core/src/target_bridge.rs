// Target bridges
// A bridge decouples the components from the concrete target flavor by
// patching register names, addresses and value widths on the way through.
// Needed when a TZOS built for AArch32 runs on an AArch64 core in svc32/
// usr32 mode behind a stub that only speaks 64-bit register names.

use regex::Regex;

use crate::{Result, TargetHandle};

/// Modifies requests to and replies from a target.
pub trait TargetBridge {
    fn read_register(&self, name: &str) -> Result<u64>;

    fn write_register(&self, name: &str, value: u64) -> Result<()>;

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()>;
}

/// Forwards all requests without patching them.
pub struct DefaultTargetBridge {
    target: TargetHandle,
}

impl DefaultTargetBridge {
    pub fn new(target: TargetHandle) -> Self {
        Self { target }
    }
}

impl TargetBridge for DefaultTargetBridge {
    fn read_register(&self, name: &str) -> Result<u64> {
        self.target.lock().expect("target lock").read_register(name)
    }

    fn write_register(&self, name: &str, value: u64) -> Result<()> {
        self.target
            .lock()
            .expect("target lock")
            .write_register(name, value)
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.target
            .lock()
            .expect("target lock")
            .read_memory(address, size)
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.target
            .lock()
            .expect("target lock")
            .write_memory(address, data)
    }
}

/// Patches 32-bit register names onto an AArch64 target and narrows values
/// to 32 bits in both directions.
pub struct AArch64Compat32TargetBridge {
    target: TargetHandle,
    aarch32_gp_register: Regex,
}

impl AArch64Compat32TargetBridge {
    pub fn new(target: TargetHandle) -> Self {
        Self {
            target,
            aarch32_gp_register: Regex::new(r"^r(\d+)$").expect("static regex"),
        }
    }

    fn translate_register_name(&self, name: &str) -> String {
        let name = name.to_ascii_lowercase();

        if let Some(captures) = self.aarch32_gp_register.captures(&name) {
            return format!("x{}", &captures[1]);
        }

        match name.as_str() {
            "lr" => "x14".to_string(),
            // ESR_EL1 bits [31:0] are architecturally mapped to the AArch32
            // DFSR register
            "dfsr" => "esr_el1".to_string(),
            _ => name,
        }
    }
}

impl TargetBridge for AArch64Compat32TargetBridge {
    fn read_register(&self, name: &str) -> Result<u64> {
        let translated = self.translate_register_name(name);
        let value = self
            .target
            .lock()
            .expect("target lock")
            .read_register(&translated)?;
        Ok(value & 0xFFFF_FFFF)
    }

    fn write_register(&self, name: &str, value: u64) -> Result<()> {
        let translated = self.translate_register_name(name);
        self.target
            .lock()
            .expect("target lock")
            .write_register(&translated, value & 0xFFFF_FFFF)
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.target
            .lock()
            .expect("target lock")
            .read_memory(address, size)
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.target
            .lock()
            .expect("target lock")
            .write_memory(address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_target::MockTarget;
    use std::sync::{Arc, Mutex};

    fn bridge() -> (Arc<Mutex<MockTarget>>, AArch64Compat32TargetBridge) {
        let mock = Arc::new(Mutex::new(MockTarget::new()));
        let handle: TargetHandle = mock.clone();
        (mock, AArch64Compat32TargetBridge::new(handle))
    }

    #[test]
    fn test_gp_register_names_translate() {
        let (mock, bridge) = bridge();
        bridge.write_register("r3", 0x42).unwrap();
        assert_eq!(mock.lock().unwrap().cpu().reg("x3"), 0x42);
        assert_eq!(bridge.read_register("R3").unwrap(), 0x42);
    }

    #[test]
    fn test_aliases_translate() {
        let (mock, bridge) = bridge();
        bridge.write_register("lr", 0x1000).unwrap();
        assert_eq!(mock.lock().unwrap().cpu().reg("x14"), 0x1000);

        mock.lock().unwrap().cpu().set_reg("esr_el1", 0x9600_0045);
        assert_eq!(bridge.read_register("dfsr").unwrap(), 0x9600_0045);
    }

    #[test]
    fn test_values_narrowed_to_32_bit() {
        let (mock, bridge) = bridge();
        bridge.write_register("r0", 0x1_2345_6789).unwrap();
        assert_eq!(mock.lock().unwrap().cpu().reg("x0"), 0x2345_6789);

        mock.lock().unwrap().cpu().set_reg("x1", 0xFFFF_FFFF_0000_0001);
        assert_eq!(bridge.read_register("r1").unwrap(), 0x1);
    }
}
