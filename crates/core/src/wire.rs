// Wire struct codec
// Little-endian, fixed-layout (de)serialization helpers for the command
// structs exchanged with a TZOS through shared memory. Reading through the
// target lets length-prefixed structs size themselves without the caller
// knowing how many bytes will be consumed.

use crate::{Result as CoreResult, TargetHandle};

/// Errors produced while decoding wire structs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("implausible field value: {context}")]
    Implausible { context: String },
}

/// A binary struct with a fixed little-endian layout.
pub trait WireStruct: Sized {
    /// Parse one struct from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError>;

    /// Append the serialized representation to `out`.
    fn serialize(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }
}

/// Cursor over a byte slice with little-endian accessors.
pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        if self.position + count > self.bytes.len() {
            return Err(WireError::Truncated {
                needed: self.position + count,
                got: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn u32_le(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn u64_le(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}

/// Read a struct of known serialized size directly from target memory.
pub fn read_fixed_struct<S: WireStruct>(
    target: &TargetHandle,
    address: u64,
    size: usize,
) -> CoreResult<S> {
    let bytes = target
        .lock()
        .expect("target lock")
        .read_memory(address, size)?;
    let (parsed, _) = S::parse(&bytes)?;
    Ok(parsed)
}

/// Write a struct back into target memory at `address`.
pub fn write_struct<S: WireStruct>(
    target: &TargetHandle,
    address: u64,
    value: &S,
) -> CoreResult<()> {
    let bytes = value.to_bytes();
    target
        .lock()
        .expect("target lock")
        .write_memory(address, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_consumes_in_order() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1122_3344u32.to_le_bytes());
        bytes.extend_from_slice(&0xAABB_CCDD_EEFF_0011u64.to_le_bytes());

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.u32_le().unwrap(), 0x1122_3344);
        assert_eq!(reader.u64_le().unwrap(), 0xAABB_CCDD_EEFF_0011);
        assert_eq!(reader.consumed(), 12);
        assert_eq!(
            reader.u32_le(),
            Err(WireError::Truncated { needed: 16, got: 12 })
        );
    }
}
