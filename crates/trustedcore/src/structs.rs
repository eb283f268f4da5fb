// TrustedCore wire structs
// Little-endian, fixed layouts for the TC_NS_SMC_CMD command queue protocol
// and its operation/parameter blobs.

use teehost_core::wire::{Reader, WireError, WireStruct};

/// One (a, b) parameter pair of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcParam {
    pub a: u32,
    pub b: u32,
}

impl TcParam {
    pub const SIZE: usize = 8;

    pub fn new(a: u32, b: u32) -> Self {
        Self { a, b }
    }
}

impl WireStruct for TcParam {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let param = Self {
            a: reader.u32_le()?,
            b: reader.u32_le()?,
        };
        Ok((param, reader.consumed()))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.a.to_le_bytes());
        out.extend_from_slice(&self.b.to_le_bytes());
    }
}

/// A client operation: a paramTypes word plus four parameter pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcOperation {
    pub param_types: u32,
    pub params: [TcParam; 4],
}

impl TcOperation {
    pub const SIZE: usize = 4 + 4 * TcParam::SIZE;

    pub fn new(param_types: u32, params: [TcParam; 4]) -> Self {
        Self { param_types, params }
    }
}

impl WireStruct for TcOperation {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let param_types = reader.u32_le()?;
        let mut params = [TcParam::default(); 4];
        let mut consumed = reader.consumed();
        for param in &mut params {
            let (parsed, bytes_consumed) = TcParam::parse(&bytes[consumed..])?;
            *param = parsed;
            consumed += bytes_consumed;
        }
        Ok((Self { param_types, params }, consumed))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.param_types.to_le_bytes());
        for param in &self.params {
            param.serialize(out);
        }
    }
}

/// The normal-world command block TrustedCore consumes from its queue.
///
/// Serialized, the struct is 14 32-bit words (0x38 bytes); the queue slots
/// it travels in are only 0x35 bytes apart, so the strategy truncates the
/// tail on the way in and reads across the slot boundary on the way out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcNsSmcCmd {
    pub uuid_phys: u32,
    pub cmd_id: u32,
    pub dev_file_id: u32,
    pub context_id: u32,
    pub agent_id: u32,
    pub operation_phys: u32,
    pub login_method: u32,
    pub login_data: u32,
    pub err_origin: u32,
    pub ret_val: u32,
    pub event_nr: u32,
    pub remap: u32,
    pub uid: u32,
    pub started: u32,
}

impl TcNsSmcCmd {
    /// Full serialized size.
    pub const SIZE: usize = 14 * 4;
    /// Stride of one command slot in the shared-memory queue.
    pub const WIRE_SLOT_SIZE: usize = 0x35;
}

impl WireStruct for TcNsSmcCmd {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let cmd = Self {
            uuid_phys: reader.u32_le()?,
            cmd_id: reader.u32_le()?,
            dev_file_id: reader.u32_le()?,
            context_id: reader.u32_le()?,
            agent_id: reader.u32_le()?,
            operation_phys: reader.u32_le()?,
            login_method: reader.u32_le()?,
            login_data: reader.u32_le()?,
            err_origin: reader.u32_le()?,
            ret_val: reader.u32_le()?,
            event_nr: reader.u32_le()?,
            remap: reader.u32_le()?,
            uid: reader.u32_le()?,
            started: reader.u32_le()?,
        };
        Ok((cmd, reader.consumed()))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        for word in [
            self.uuid_phys,
            self.cmd_id,
            self.dev_file_id,
            self.context_id,
            self.agent_id,
            self.operation_phys,
            self.login_method,
            self.login_data,
            self.err_origin,
            self.ret_val,
            self.event_nr,
            self.remap,
            self.uid,
            self.started,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
}
