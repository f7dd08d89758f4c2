//! Register-file executor for decoded x86 instructions.

use crate::x86::instruction::{X86Instruction, X86OpCode, X86Operand, X86Register};
use crate::{Error, Result};
use strum::EnumCount as _;

/// Executes decoded instructions over eight 32-bit registers and an argument stack.
///
/// One emulator is built per execution; the argument stack is pre-loaded so that the first
/// `pop` retrieves the first caller argument. All arithmetic wraps in two's complement.
#[derive(Debug)]
pub struct X86Emulator {
    regs: [i32; X86Register::COUNT],
    local_stack: Vec<i32>,
}

impl X86Emulator {
    /// Creates an emulator with zeroed registers and the given call arguments.
    #[must_use]
    pub fn new(args: &[i32]) -> Self {
        // Reversed so pops retrieve arguments in call order
        let local_stack = args.iter().rev().copied().collect();
        X86Emulator {
            regs: [0; X86Register::COUNT],
            local_stack,
        }
    }

    /// Reads a register.
    #[must_use]
    pub fn reg(&self, register: X86Register) -> i32 {
        self.regs[register.index()]
    }

    /// Writes a register.
    pub fn set_reg(&mut self, register: X86Register, value: i32) {
        self.regs[register.index()] = value;
    }

    fn operand_value(&self, operand: &X86Operand) -> i32 {
        match operand {
            X86Operand::Register(r) => self.reg(*r),
            X86Operand::Immediate(v) => *v,
        }
    }

    /// Executes a single instruction.
    ///
    /// # Errors
    /// [`Error::StackUnderflow`] when a `pop` finds the argument stack empty;
    /// [`Error::MalformedPattern`] when the instruction's operand shape is invalid for
    /// its opcode (a decoder never produces such records).
    pub fn execute_instruction(&mut self, instruction: &X86Instruction) -> Result<()> {
        let dst = match instruction.op1 {
            Some(X86Operand::Register(r)) => r,
            _ => {
                return Err(Error::MalformedPattern(format!(
                    "instruction without register destination: {instruction}"
                )))
            }
        };
        match instruction.opcode {
            X86OpCode::Pop => {
                let value = self.local_stack.pop().ok_or(Error::StackUnderflow)?;
                self.set_reg(dst, value);
            }
            X86OpCode::Neg => self.set_reg(dst, self.reg(dst).wrapping_neg()),
            X86OpCode::Not => self.set_reg(dst, !self.reg(dst)),
            X86OpCode::Mov | X86OpCode::Add | X86OpCode::Sub | X86OpCode::IMul | X86OpCode::Xor => {
                let src = match &instruction.op2 {
                    Some(operand) => self.operand_value(operand),
                    None => {
                        return Err(Error::MalformedPattern(format!(
                            "missing source operand: {instruction}"
                        )))
                    }
                };
                let result = match instruction.opcode {
                    X86OpCode::Mov => src,
                    X86OpCode::Add => self.reg(dst).wrapping_add(src),
                    X86OpCode::Sub => self.reg(dst).wrapping_sub(src),
                    X86OpCode::IMul => self.reg(dst).wrapping_mul(src),
                    _ => self.reg(dst) ^ src,
                };
                self.set_reg(dst, result);
            }
        }
        Ok(())
    }

    /// Executes an instruction sequence and returns the accumulator (EAX).
    ///
    /// # Errors
    /// Propagates per-instruction failures; see [`X86Emulator::execute_instruction`].
    pub fn execute(&mut self, instructions: &[X86Instruction]) -> Result<i32> {
        for instruction in instructions {
            self.execute_instruction(instruction)?;
        }
        Ok(self.reg(X86Register::Eax))
    }
}
