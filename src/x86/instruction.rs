//! Decoded x86 instruction records.
//!
//! The obfuscator's embedded key-derivation helpers only ever use a handful of
//! register-to-register arithmetic instructions; the record types here model exactly that
//! subset. Instances are produced once by a decoder and consumed once by the emulator.

use std::fmt;
use strum::{Display, EnumCount, FromRepr};

/// Operations appearing in the supported helper-function subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumCount)]
pub enum X86OpCode {
    /// Register or immediate move.
    Mov,
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping signed multiplication.
    IMul,
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    Not,
    /// Bitwise exclusive-or.
    Xor,
    /// Pop from the argument stack into a register.
    Pop,
}

/// The eight general-purpose 32-bit registers, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum X86Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl X86Register {
    /// Maps a 3-bit register field to a register; values above 7 yield `None`.
    #[must_use]
    pub fn from_encoding(bits: u8) -> Option<Self> {
        X86Register::from_repr(bits)
    }

    /// The register's index into the register file.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// An instruction operand: a register or a 32-bit immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Operand {
    /// Register operand.
    Register(X86Register),
    /// 32-bit immediate operand.
    Immediate(i32),
}

impl fmt::Display for X86Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            X86Operand::Register(r) => write!(f, "{r}"),
            X86Operand::Immediate(v) => write!(f, "{v:#x}"),
        }
    }
}

/// One decoded instruction: opcode plus up to two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Instruction {
    /// The operation.
    pub opcode: X86OpCode,
    /// Destination operand, when present.
    pub op1: Option<X86Operand>,
    /// Source operand, when present.
    pub op2: Option<X86Operand>,
}

impl X86Instruction {
    /// Creates an instruction with a single operand.
    #[must_use]
    pub fn unary(opcode: X86OpCode, op1: X86Operand) -> Self {
        X86Instruction {
            opcode,
            op1: Some(op1),
            op2: None,
        }
    }

    /// Creates an instruction with two operands.
    #[must_use]
    pub fn binary(opcode: X86OpCode, op1: X86Operand, op2: X86Operand) -> Self {
        X86Instruction {
            opcode,
            op1: Some(op1),
            op2: Some(op2),
        }
    }
}

impl fmt::Display for X86Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(op1) = &self.op1 {
            write!(f, " {op1}")?;
        }
        if let Some(op2) = &self.op2 {
            write!(f, ", {op2}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_encoding_round_trip() {
        assert_eq!(X86Register::from_encoding(0), Some(X86Register::Eax));
        assert_eq!(X86Register::from_encoding(7), Some(X86Register::Edi));
        assert_eq!(X86Register::from_encoding(8), None);
        assert_eq!(X86Register::COUNT, 8);
        assert_eq!(X86Register::Esi.index(), 6);
    }

    #[test]
    fn display_formats() {
        let instr = X86Instruction::binary(
            X86OpCode::Mov,
            X86Operand::Register(X86Register::Eax),
            X86Operand::Immediate(5),
        );
        assert_eq!(instr.to_string(), "Mov Eax, 0x5");
    }
}
