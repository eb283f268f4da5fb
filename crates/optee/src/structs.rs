// optee_msg wire structs
// Little-endian, fixed layouts matching OP-TEE's optee_msg_arg and its
// parameter union. One arg is a 32-byte header followed by 32 bytes per
// parameter.

use teehost_core::wire::{Reader, WireError, WireStruct};
use teehost_core::{Result, TargetHandle};

/// Header size of an [`OpteeMsgArg`] and size of one serialized parameter.
pub const MSG_ARG_HEADER_SIZE: usize = 32;
pub const MSG_PARAM_SIZE: usize = 32;

// guards against reading garbage memory as a parameter list
const MAX_PARAMS: u32 = 127;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpteeMsgParamValue {
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

impl OpteeMsgParamValue {
    pub fn new(a: u64, b: u64, c: u64) -> Self {
        Self { a, b, c }
    }
}

impl WireStruct for OpteeMsgParamValue {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let value = Self {
            a: reader.u64_le()?,
            b: reader.u64_le()?,
            c: reader.u64_le()?,
        };
        Ok((value, reader.consumed()))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.a.to_le_bytes());
        out.extend_from_slice(&self.b.to_le_bytes());
        out.extend_from_slice(&self.c.to_le_bytes());
    }
}

/// Temporary memory reference parameter body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpteeMsgParamTmem {
    pub buf_ptr: u64,
    pub size: u64,
    pub shm_ref: u64,
}

impl WireStruct for OpteeMsgParamTmem {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let tmem = Self {
            buf_ptr: reader.u64_le()?,
            size: reader.u64_le()?,
            shm_ref: reader.u64_le()?,
        };
        Ok((tmem, reader.consumed()))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.buf_ptr.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.shm_ref.to_le_bytes());
    }
}

/// Registered memory reference parameter body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpteeMsgParamRmem {
    pub offset: u64,
    pub size: u64,
    pub shm_ref: u64,
}

impl WireStruct for OpteeMsgParamRmem {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let rmem = Self {
            offset: reader.u64_le()?,
            size: reader.u64_le()?,
            shm_ref: reader.u64_le()?,
        };
        Ok((rmem, reader.consumed()))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.shm_ref.to_le_bytes());
    }
}

/// One parameter: an attribute word followed by the 24-byte body.
///
/// The body is decoded as the value variant regardless of attr; a faithful
/// decoder would dispatch on attr into tmem/rmem/value. All current callers
/// only ever look at the three words, so the raw view is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpteeMsgParam {
    pub attr: u64,
    pub value: OpteeMsgParamValue,
}

impl OpteeMsgParam {
    pub fn new(attr: u64, value: OpteeMsgParamValue) -> Self {
        Self { attr, value }
    }

    /// View the body as a temporary memory reference.
    pub fn as_tmem(&self) -> OpteeMsgParamTmem {
        OpteeMsgParamTmem {
            buf_ptr: self.value.a,
            size: self.value.b,
            shm_ref: self.value.c,
        }
    }

    /// View the body as a registered memory reference.
    pub fn as_rmem(&self) -> OpteeMsgParamRmem {
        OpteeMsgParamRmem {
            offset: self.value.a,
            size: self.value.b,
            shm_ref: self.value.c,
        }
    }
}

impl WireStruct for OpteeMsgParam {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let attr = reader.u64_le()?;
        let (value, consumed) = OpteeMsgParamValue::parse(&bytes[reader.consumed()..])?;
        Ok((Self { attr, value }, reader.consumed() + consumed))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attr.to_le_bytes());
        self.value.serialize(out);
    }
}

/// The command struct passed between the worlds through shared memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpteeMsgArg {
    pub cmd: u32,
    pub func: u32,
    pub session: u32,
    pub cancel_id: u32,
    pub pad: u32,
    pub ret: u32,
    pub ret_origin: u32,
    pub params: Vec<OpteeMsgParam>,
}

impl OpteeMsgArg {
    /// Serialized size: header plus one 32-byte slot per parameter.
    pub fn byte_len(&self) -> usize {
        MSG_ARG_HEADER_SIZE + self.params.len() * MSG_PARAM_SIZE
    }

    /// Read one arg from target memory at `address`, sizing itself from the
    /// num_params header field.
    pub fn read_from_target(target: &TargetHandle, address: u64) -> Result<Self> {
        let header = target
            .lock()
            .expect("target lock")
            .read_memory(address, MSG_ARG_HEADER_SIZE)?;
        let num_params = u32::from_le_bytes(header[28..32].try_into().expect("4 bytes"));
        if num_params > MAX_PARAMS {
            return Err(WireError::Implausible {
                context: format!("num_params = {num_params}"),
            }
            .into());
        }

        let total = MSG_ARG_HEADER_SIZE + num_params as usize * MSG_PARAM_SIZE;
        let bytes = target
            .lock()
            .expect("target lock")
            .read_memory(address, total)?;
        let (arg, _) = Self::parse(&bytes)?;
        Ok(arg)
    }

    /// Serialize and write back into target memory at `address`.
    pub fn write_to_target(&self, target: &TargetHandle, address: u64) -> Result<()> {
        teehost_core::wire::write_struct(target, address, self)
    }
}

impl WireStruct for OpteeMsgArg {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let cmd = reader.u32_le()?;
        let func = reader.u32_le()?;
        let session = reader.u32_le()?;
        let cancel_id = reader.u32_le()?;
        let pad = reader.u32_le()?;
        let ret = reader.u32_le()?;
        let ret_origin = reader.u32_le()?;
        let num_params = reader.u32_le()?;
        if num_params > MAX_PARAMS {
            return Err(WireError::Implausible {
                context: format!("num_params = {num_params}"),
            });
        }

        let mut consumed = reader.consumed();
        let mut params = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            let (param, param_bytes) = OpteeMsgParam::parse(&bytes[consumed..])?;
            params.push(param);
            consumed += param_bytes;
        }

        let arg = Self {
            cmd,
            func,
            session,
            cancel_id,
            pad,
            ret,
            ret_origin,
            params,
        };
        Ok((arg, consumed))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        for word in [
            self.cmd,
            self.func,
            self.session,
            self.cancel_id,
            self.pad,
            self.ret,
            self.ret_origin,
            self.params.len() as u32,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for param in &self.params {
            param.serialize(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_arg() -> OpteeMsgArg {
        OpteeMsgArg {
            cmd: 1,
            func: 0,
            session: 7,
            cancel_id: 0,
            pad: 0,
            ret: 0,
            ret_origin: 2,
            params: vec![
                OpteeMsgParam::new(0x101, OpteeMsgParamValue::new(0x1122, 0x3344, 0)),
                OpteeMsgParam::new(0x3, OpteeMsgParamValue::new(200, 0, 0)),
            ],
        }
    }

    #[test]
    fn test_param_round_trip() {
        let param = OpteeMsgParam::new(0xA, OpteeMsgParamValue::new(1, 2, 3));
        let bytes = param.to_bytes();
        assert_eq!(bytes.len(), MSG_PARAM_SIZE);
        let (parsed, consumed) = OpteeMsgParam::parse(&bytes).unwrap();
        assert_eq!(consumed, MSG_PARAM_SIZE);
        assert_eq!(parsed, param);
    }

    #[test]
    fn test_arg_round_trip_and_size() {
        let arg = sample_arg();
        let bytes = arg.to_bytes();
        assert_eq!(bytes.len(), 32 + 32 * arg.params.len());
        assert_eq!(bytes.len(), arg.byte_len());
        let (parsed, consumed) = OpteeMsgArg::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, arg);
    }

    #[test]
    fn test_num_params_drives_parsing() {
        let mut arg = sample_arg();
        arg.params.clear();
        let bytes = arg.to_bytes();
        assert_eq!(bytes.len(), MSG_ARG_HEADER_SIZE);
        let (parsed, _) = OpteeMsgArg::parse(&bytes).unwrap();
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = sample_arg().to_bytes();
        assert!(OpteeMsgArg::parse(&bytes[..40]).is_err());
    }

    #[test]
    fn test_memref_views() {
        let param = OpteeMsgParam::new(0xA, OpteeMsgParamValue::new(0x1000, 0x80, 0x99));
        let tmem = param.as_tmem();
        assert_eq!(tmem.buf_ptr, 0x1000);
        assert_eq!(tmem.size, 0x80);
        assert_eq!(tmem.shm_ref, 0x99);
        let rmem = param.as_rmem();
        assert_eq!(rmem.offset, 0x1000);
    }
}
