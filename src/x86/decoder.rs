//! Machine-code decoding for the supported x86 subset.
//!
//! [`ByteDecoder`] is a pure decoder over raw bytes; it understands only the
//! register-direct instruction forms the obfuscator's helper functions are compiled from.
//! The [`InstructionDecoder`] trait is the seam for slotting a full external disassembly
//! engine behind the same contract; both paths must produce identical execution results.

use crate::parser::Parser;
use crate::x86::instruction::{X86Instruction, X86OpCode, X86Operand, X86Register};
use crate::{Error, Result};

/// Capability of turning a byte stream position into one decoded instruction.
pub trait InstructionDecoder {
    /// Decodes the instruction under the cursor, advancing past it.
    ///
    /// Returns `Ok(None)` at a `ret` terminator (0xC3).
    ///
    /// # Errors
    /// [`Error::UnsupportedOpcode`] for bytes outside the supported subset,
    /// [`Error::MemoryOperand`] for a ModRM byte with `mod != 3`, and
    /// [`Error::OutOfBounds`] for a truncated instruction.
    fn decode(&self, parser: &mut Parser<'_>) -> Result<Option<X86Instruction>>;

    /// Decodes instructions until the `ret` terminator.
    ///
    /// # Errors
    /// Fails as [`InstructionDecoder::decode`] does; a stream that ends without a
    /// terminator fails with [`Error::OutOfBounds`].
    fn decode_until_ret(&self, parser: &mut Parser<'_>) -> Result<Vec<X86Instruction>> {
        let mut instructions = Vec::new();
        loop {
            match self.decode(parser)? {
                Some(instruction) => instructions.push(instruction),
                None => return Ok(instructions),
            }
        }
    }
}

/// A decoded ModRM byte, restricted to register-direct form.
struct ModRm {
    reg: X86Register,
    rm: X86Register,
    reg_bits: u8,
}

/// Pure byte decoder for the helper-function instruction subset.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteDecoder;

impl ByteDecoder {
    /// Creates a decoder.
    #[must_use]
    pub fn new() -> Self {
        ByteDecoder
    }

    /// Reads and validates a ModRM byte. `offset` is the instruction start, for errors.
    fn read_modrm(parser: &mut Parser<'_>, offset: usize) -> Result<ModRm> {
        let byte = parser.read_u8()?;
        if (byte >> 6) & 0b11 != 0b11 {
            return Err(Error::MemoryOperand { offset });
        }
        let reg_bits = (byte >> 3) & 0b111;
        // Both fields are 3 bits wide, so the lookups cannot fail
        let reg = X86Register::from_encoding(reg_bits).ok_or(Error::OutOfBounds)?;
        let rm = X86Register::from_encoding(byte & 0b111).ok_or(Error::OutOfBounds)?;
        Ok(ModRm { reg, rm, reg_bits })
    }
}

impl InstructionDecoder for ByteDecoder {
    fn decode(&self, parser: &mut Parser<'_>) -> Result<Option<X86Instruction>> {
        let offset = parser.pos();
        let opcode = parser.read_u8()?;
        let instruction = match opcode {
            // ret terminates the stream
            0xC3 => return Ok(None),
            // add r/m32, r32
            0x01 => {
                let modrm = Self::read_modrm(parser, offset)?;
                X86Instruction::binary(
                    X86OpCode::Add,
                    X86Operand::Register(modrm.rm),
                    X86Operand::Register(modrm.reg),
                )
            }
            // imul r32, r/m32 (0F AF /r)
            0x0F => {
                let second = parser.read_u8()?;
                if second != 0xAF {
                    return Err(Error::UnsupportedOpcode { opcode: second, offset });
                }
                let modrm = Self::read_modrm(parser, offset)?;
                X86Instruction::binary(
                    X86OpCode::IMul,
                    X86Operand::Register(modrm.reg),
                    X86Operand::Register(modrm.rm),
                )
            }
            // sub r/m32, r32
            0x29 => {
                let modrm = Self::read_modrm(parser, offset)?;
                X86Instruction::binary(
                    X86OpCode::Sub,
                    X86Operand::Register(modrm.rm),
                    X86Operand::Register(modrm.reg),
                )
            }
            // xor r/m32, r32
            0x31 => {
                let modrm = Self::read_modrm(parser, offset)?;
                X86Instruction::binary(
                    X86OpCode::Xor,
                    X86Operand::Register(modrm.rm),
                    X86Operand::Register(modrm.reg),
                )
            }
            // pop r32, short form
            0x58..=0x5F => {
                let register =
                    X86Register::from_encoding(opcode - 0x58).ok_or(Error::OutOfBounds)?;
                X86Instruction::unary(X86OpCode::Pop, X86Operand::Register(register))
            }
            // imul r32, r/m32, imm32
            0x69 => {
                let modrm = Self::read_modrm(parser, offset)?;
                let immediate = parser.read_i32()?;
                X86Instruction::binary(
                    X86OpCode::IMul,
                    X86Operand::Register(modrm.reg),
                    X86Operand::Immediate(immediate),
                )
            }
            // group 1: add/sub/xor r/m32, imm32, selected by the reg field
            0x81 => {
                let modrm = Self::read_modrm(parser, offset)?;
                let selected = match modrm.reg_bits {
                    0 => X86OpCode::Add,
                    5 => X86OpCode::Sub,
                    6 => X86OpCode::Xor,
                    _ => return Err(Error::UnsupportedOpcode { opcode, offset }),
                };
                let immediate = parser.read_i32()?;
                X86Instruction::binary(
                    selected,
                    X86Operand::Register(modrm.rm),
                    X86Operand::Immediate(immediate),
                )
            }
            // mov r/m32, r32
            0x89 => {
                let modrm = Self::read_modrm(parser, offset)?;
                X86Instruction::binary(
                    X86OpCode::Mov,
                    X86Operand::Register(modrm.rm),
                    X86Operand::Register(modrm.reg),
                )
            }
            // mov r32, imm32, short form
            0xB8..=0xBF => {
                let register =
                    X86Register::from_encoding(opcode - 0xB8).ok_or(Error::OutOfBounds)?;
                let immediate = parser.read_i32()?;
                X86Instruction::binary(
                    X86OpCode::Mov,
                    X86Operand::Register(register),
                    X86Operand::Immediate(immediate),
                )
            }
            // group 3: not/neg r/m32, selected by the reg field
            0xF7 => {
                let modrm = Self::read_modrm(parser, offset)?;
                let selected = match modrm.reg_bits {
                    2 => X86OpCode::Not,
                    3 => X86OpCode::Neg,
                    _ => return Err(Error::UnsupportedOpcode { opcode, offset }),
                };
                X86Instruction::unary(selected, X86Operand::Register(modrm.rm))
            }
            _ => return Err(Error::UnsupportedOpcode { opcode, offset }),
        };
        Ok(Some(instruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<Option<X86Instruction>> {
        ByteDecoder::new().decode(&mut Parser::new(bytes))
    }

    #[test]
    fn mov_short_form() -> crate::Result<()> {
        let instr = decode_one(&[0xB8, 0x05, 0x00, 0x00, 0x00])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::binary(
                X86OpCode::Mov,
                X86Operand::Register(X86Register::Eax),
                X86Operand::Immediate(5),
            )
        );
        Ok(())
    }

    #[test]
    fn add_register_register() -> crate::Result<()> {
        // add ecx, eax: 01 C1 (mod=3, reg=eax, rm=ecx)
        let instr = decode_one(&[0x01, 0xC1])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::binary(
                X86OpCode::Add,
                X86Operand::Register(X86Register::Ecx),
                X86Operand::Register(X86Register::Eax),
            )
        );
        Ok(())
    }

    #[test]
    fn imul_two_byte_form() -> crate::Result<()> {
        // imul edx, ebx: 0F AF D3
        let instr = decode_one(&[0x0F, 0xAF, 0xD3])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::binary(
                X86OpCode::IMul,
                X86Operand::Register(X86Register::Edx),
                X86Operand::Register(X86Register::Ebx),
            )
        );
        Ok(())
    }

    #[test]
    fn group1_selectors() -> crate::Result<()> {
        // xor eax, 0x1234: 81 F0 34 12 00 00 (reg field 6)
        let instr = decode_one(&[0x81, 0xF0, 0x34, 0x12, 0x00, 0x00])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::binary(
                X86OpCode::Xor,
                X86Operand::Register(X86Register::Eax),
                X86Operand::Immediate(0x1234),
            )
        );
        // reg field 1 (or) is outside the subset
        assert!(matches!(
            decode_one(&[0x81, 0xC8, 0x00, 0x00, 0x00, 0x00]),
            Err(Error::UnsupportedOpcode { opcode: 0x81, .. })
        ));
        Ok(())
    }

    #[test]
    fn group3_selectors() -> crate::Result<()> {
        // neg esi: F7 DE (reg field 3)
        let instr = decode_one(&[0xF7, 0xDE])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::unary(X86OpCode::Neg, X86Operand::Register(X86Register::Esi))
        );
        // not edi: F7 D7 (reg field 2)
        let instr = decode_one(&[0xF7, 0xD7])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::unary(X86OpCode::Not, X86Operand::Register(X86Register::Edi))
        );
        Ok(())
    }

    #[test]
    fn pop_short_forms() -> crate::Result<()> {
        let instr = decode_one(&[0x5B])?.ok_or(Error::OutOfBounds)?;
        assert_eq!(
            instr,
            X86Instruction::unary(X86OpCode::Pop, X86Operand::Register(X86Register::Ebx))
        );
        Ok(())
    }

    #[test]
    fn memory_operand_is_fatal() {
        // add [ecx], eax: 01 01 (mod=0)
        assert!(matches!(
            decode_one(&[0x01, 0x01]),
            Err(Error::MemoryOperand { offset: 0 })
        ));
        // mov [ebp-4], eax: 89 45 FC (mod=1)
        assert!(matches!(
            decode_one(&[0x89, 0x45, 0xFC]),
            Err(Error::MemoryOperand { offset: 0 })
        ));
    }

    #[test]
    fn unsupported_opcode_is_fatal() {
        assert!(matches!(
            decode_one(&[0x90]),
            Err(Error::UnsupportedOpcode { opcode: 0x90, offset: 0 })
        ));
    }

    #[test]
    fn ret_terminates() -> crate::Result<()> {
        assert_eq!(decode_one(&[0xC3])?, None);
        let mut parser = Parser::new(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0x58, 0xC3]);
        let stream = ByteDecoder::new().decode_until_ret(&mut parser)?;
        assert_eq!(stream.len(), 2);
        Ok(())
    }

    #[test]
    fn truncated_stream_fails() {
        let mut parser = Parser::new(&[0xB8, 0x01]);
        assert!(ByteDecoder::new().decode_until_ret(&mut parser).is_err());
    }
}
