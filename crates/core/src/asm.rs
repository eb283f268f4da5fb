// AArch64 little-endian assembler bridge
// Covers exactly the instruction subset the rehosting stubs emit: eret, nop,
// msr, mov/movz/movk. The sysreg table is shared with the mock target's
// decoder so JIT-written registers round-trip in tests.

use std::fmt;

/// Errors produced while assembling stub code.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("unknown mnemonic: {0}")]
    UnknownMnemonic(String),

    #[error("unknown system register: {0}")]
    UnknownSystemRegister(String),

    #[error("bad operand {operand:?} for {mnemonic}")]
    BadOperand { mnemonic: String, operand: String },

    #[error("immediate {value:#x} does not fit into 16 bits")]
    ImmediateTooLarge { value: u64 },

    #[error("shift must be one of 0/16/32/48, got {0}")]
    BadShift(u64),
}

/// System register operands for MSR (op0, op1, CRn, CRm, op2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysReg {
    pub op0: u32,
    pub op1: u32,
    pub crn: u32,
    pub crm: u32,
    pub op2: u32,
}

// name -> encoding operands; extend as further stubs need more registers
const SYSREG_TABLE: &[(&str, SysReg)] = &[
    ("spsr_el3", SysReg { op0: 3, op1: 6, crn: 4, crm: 0, op2: 0 }),
    ("elr_el3", SysReg { op0: 3, op1: 6, crn: 4, crm: 0, op2: 1 }),
    ("sctlr_el3", SysReg { op0: 3, op1: 6, crn: 1, crm: 0, op2: 0 }),
    ("scr_el3", SysReg { op0: 3, op1: 6, crn: 1, crm: 1, op2: 0 }),
    ("vbar_el3", SysReg { op0: 3, op1: 6, crn: 12, crm: 0, op2: 0 }),
    ("spsr_el1", SysReg { op0: 3, op1: 0, crn: 4, crm: 0, op2: 0 }),
    ("elr_el1", SysReg { op0: 3, op1: 0, crn: 4, crm: 0, op2: 1 }),
    ("esr_el1", SysReg { op0: 3, op1: 0, crn: 5, crm: 2, op2: 0 }),
    ("sctlr_el1", SysReg { op0: 3, op1: 0, crn: 1, crm: 0, op2: 0 }),
];

/// Look up a system register by (lower-cased) name.
pub fn sysreg_by_name(name: &str) -> Option<SysReg> {
    let lowered = name.to_ascii_lowercase();
    SYSREG_TABLE
        .iter()
        .find(|(n, _)| *n == lowered)
        .map(|(_, r)| *r)
}

/// Reverse lookup used by the mock target's decoder.
pub fn sysreg_name(reg: SysReg) -> Option<&'static str> {
    SYSREG_TABLE.iter().find(|(_, r)| *r == reg).map(|(n, _)| *n)
}

const ERET: u32 = 0xD69F_03E0;
const NOP: u32 = 0xD503_201F;

fn encode_msr(reg: SysReg, rt: u32) -> u32 {
    0xD500_0000
        | (reg.op0 << 19)
        | (reg.op1 << 16)
        | (reg.crn << 12)
        | (reg.crm << 8)
        | (reg.op2 << 5)
        | rt
}

fn encode_movz(rd: u32, imm16: u32, shift: u32) -> u32 {
    0xD280_0000 | ((shift / 16) << 21) | (imm16 << 5) | rd
}

fn encode_movk(rd: u32, imm16: u32, shift: u32) -> u32 {
    0xF280_0000 | ((shift / 16) << 21) | (imm16 << 5) | rd
}

/// One decoded instruction of the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Eret,
    Nop,
    Msr { reg: SysReg, rt: u32 },
    Movz { rd: u32, imm16: u32, shift: u32 },
    Movk { rd: u32, imm16: u32, shift: u32 },
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Eret => write!(f, "eret"),
            Insn::Nop => write!(f, "nop"),
            Insn::Msr { reg, rt } => {
                let name = sysreg_name(*reg).unwrap_or("<sysreg>");
                write!(f, "msr {name}, x{rt}")
            }
            Insn::Movz { rd, imm16, shift } => {
                write!(f, "movz x{rd}, #{imm16:#x}, lsl #{shift}")
            }
            Insn::Movk { rd, imm16, shift } => {
                write!(f, "movk x{rd}, #{imm16:#x}, lsl #{shift}")
            }
        }
    }
}

/// Decode a single 32-bit word into the supported subset, if possible.
pub fn decode(word: u32) -> Option<Insn> {
    match word {
        ERET => return Some(Insn::Eret),
        NOP => return Some(Insn::Nop),
        _ => {}
    }

    if word & 0xFFE0_0000 == 0xD500_0000 {
        let reg = SysReg {
            op0: (word >> 19) & 0x3,
            op1: (word >> 16) & 0x7,
            crn: (word >> 12) & 0xF,
            crm: (word >> 8) & 0xF,
            op2: (word >> 5) & 0x7,
        };
        return Some(Insn::Msr { reg, rt: word & 0x1F });
    }

    if word & 0xFF80_0000 == 0xD280_0000 {
        return Some(Insn::Movz {
            rd: word & 0x1F,
            imm16: (word >> 5) & 0xFFFF,
            shift: ((word >> 21) & 0x3) * 16,
        });
    }

    if word & 0xFF80_0000 == 0xF280_0000 {
        return Some(Insn::Movk {
            rd: word & 0x1F,
            imm16: (word >> 5) & 0xFFFF,
            shift: ((word >> 21) & 0x3) * 16,
        });
    }

    None
}

fn parse_gp_register(mnemonic: &str, operand: &str) -> Result<u32, AsmError> {
    let bad = || AsmError::BadOperand {
        mnemonic: mnemonic.to_string(),
        operand: operand.to_string(),
    };

    let rest = operand
        .strip_prefix('x')
        .or_else(|| operand.strip_prefix('X'))
        .ok_or_else(bad)?;
    let index: u32 = rest.parse().map_err(|_| bad())?;
    if index > 30 {
        return Err(bad());
    }
    Ok(index)
}

fn parse_immediate(mnemonic: &str, operand: &str) -> Result<u64, AsmError> {
    let bad = || AsmError::BadOperand {
        mnemonic: mnemonic.to_string(),
        operand: operand.to_string(),
    };

    let digits = operand.strip_prefix('#').unwrap_or(operand);
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| bad())
    } else {
        digits.parse().map_err(|_| bad())
    }
}

fn parse_wide_move(mnemonic: &str, operands: &[&str]) -> Result<(u32, u32, u32), AsmError> {
    if operands.len() < 2 || operands.len() > 3 {
        return Err(AsmError::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: operands.join(", "),
        });
    }

    let rd = parse_gp_register(mnemonic, operands[0])?;
    let imm = parse_immediate(mnemonic, operands[1])?;
    if imm > 0xFFFF {
        return Err(AsmError::ImmediateTooLarge { value: imm });
    }

    let mut shift = 0;
    if let Some(shift_operand) = operands.get(2) {
        let lowered = shift_operand.trim().to_ascii_lowercase();
        let amount = lowered
            .strip_prefix("lsl")
            .map(str::trim)
            .ok_or_else(|| AsmError::BadOperand {
                mnemonic: mnemonic.to_string(),
                operand: shift_operand.to_string(),
            })?;
        shift = parse_immediate(mnemonic, amount)?;
        if shift % 16 != 0 || shift > 48 {
            return Err(AsmError::BadShift(shift));
        }
    }

    Ok((rd, imm as u32, shift as u32))
}

fn assemble_line(line: &str) -> Result<Option<u32>, AsmError> {
    let line = line.split("//").next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
        Some((m, r)) => (m, r.trim()),
        None => (line, ""),
    };
    let mnemonic = mnemonic.to_ascii_lowercase();
    let operands: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };

    let word = match mnemonic.as_str() {
        "eret" => ERET,
        "nop" => NOP,
        "msr" => {
            if operands.len() != 2 {
                return Err(AsmError::BadOperand {
                    mnemonic,
                    operand: rest.to_string(),
                });
            }
            let reg = sysreg_by_name(operands[0])
                .ok_or_else(|| AsmError::UnknownSystemRegister(operands[0].to_string()))?;
            let rt = parse_gp_register(&mnemonic, operands[1])?;
            encode_msr(reg, rt)
        }
        // mov with a 16-bit immediate is the movz alias; wide values must be
        // composed with explicit movz/movk pairs
        "mov" | "movz" => {
            let (rd, imm16, shift) = parse_wide_move(&mnemonic, &operands)?;
            encode_movz(rd, imm16, shift)
        }
        "movk" => {
            let (rd, imm16, shift) = parse_wide_move(&mnemonic, &operands)?;
            encode_movk(rd, imm16, shift)
        }
        other => return Err(AsmError::UnknownMnemonic(other.to_string())),
    };

    Ok(Some(word))
}

/// Run the AArch64 little-endian assembler on the given code.
///
/// Accepts multiple newline-separated instructions; `//` comments and blank
/// lines are skipped. Every emitted instruction is 4 bytes.
pub fn aarch64_asm(code: &str) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();
    for line in code.lines() {
        if let Some(word) = assemble_line(line)? {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    Ok(out)
}

/// Emit a movz/movk sequence that materializes `value` in `xN`.
///
/// Only the 16-bit chunks that are actually set get a movk, mirroring the
/// hand-written stubs this replaces.
pub fn load_immediate(rd: u32, value: u64) -> String {
    let mut lines = vec![format!("movz x{rd}, #{:#x}", value & 0xFFFF)];
    for shift in [16u32, 32, 48] {
        let chunk = (value >> shift) & 0xFFFF;
        if chunk != 0 {
            lines.push(format!("movk x{rd}, #{chunk:#x}, lsl #{shift}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(code: &str) -> u32 {
        let bytes = aarch64_asm(code).expect("assembles");
        assert_eq!(bytes.len(), 4);
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(one("eret"), 0xD69F03E0);
        assert_eq!(one("nop"), 0xD503201F);
    }

    #[test]
    fn test_msr_encoding() {
        // msr spsr_el3, x0 / msr elr_el3, x1
        assert_eq!(one("msr spsr_el3, x0"), 0xD51E4000);
        assert_eq!(one("msr elr_el3, x1"), 0xD51E4021);
    }

    #[test]
    fn test_wide_moves() {
        assert_eq!(one("movz x0, #5"), 0xD28000A0);
        assert_eq!(one("movk x0, #0x6000, lsl #16"), 0xF2AC0000);
        assert_eq!(one("mov x1, #0x3c5"), one("movz x1, #0x3c5"));
    }

    #[test]
    fn test_multi_line_and_comments() {
        let bytes = aarch64_asm(
            "// set up return state\nmsr spsr_el3, x0\n\neret // back to the TZOS\n",
        )
        .unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_decode_round_trip() {
        for code in [
            "eret",
            "nop",
            "msr elr_el3, x7",
            "movz x3, #0xbeef, lsl #16",
            "movk x3, #0x1234",
        ] {
            let word = one(code);
            let insn = decode(word).expect("decodes");
            let reassembled = one(&insn.to_string());
            assert_eq!(word, reassembled, "{code}");
        }
    }

    #[test]
    fn test_load_immediate_materializes_value() {
        let code = load_immediate(0, 0xDEAD_BEEF);
        let bytes = aarch64_asm(&code).unwrap();
        // movz + one movk
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            aarch64_asm("msr magic_el9, x0"),
            Err(AsmError::UnknownSystemRegister(_))
        ));
        assert!(matches!(
            aarch64_asm("movz x0, #0x12345"),
            Err(AsmError::ImmediateTooLarge { .. })
        ));
        assert!(matches!(
            aarch64_asm("bl somewhere"),
            Err(AsmError::UnknownMnemonic(_))
        ));
    }
}
