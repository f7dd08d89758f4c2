//! Virtual evaluation-stack emulator for CIL instruction ranges.
//!
//! [`InstructionEmulator`] replays instructions against an abstract stack plus local and
//! argument slots, using the value domain from [`crate::cil::value`]. Callers seed state
//! with [`InstructionEmulator::push`] / [`InstructionEmulator::set_arg`], replay a range,
//! then read the result back with [`InstructionEmulator::pop`] or
//! [`InstructionEmulator::peek`]. A `peek` that yields [`EmValue::Unknown`] is the standard
//! signal that the construct under analysis does not reduce to a compile-time value.

use crate::cil::instruction::{Instruction, Op};
use crate::cil::value::EmValue;
use crate::{Error, Result};

/// Slot counts of the method whose instructions are being replayed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodContext {
    /// Number of local variable slots.
    pub locals: usize,
    /// Number of argument slots (including `this` for instance methods).
    pub args: usize,
}

impl MethodContext {
    /// Creates a context with the given slot counts.
    #[must_use]
    pub fn new(locals: usize, args: usize) -> Self {
        MethodContext { locals, args }
    }
}

/// Replays CIL instructions against an abstract evaluation stack.
///
/// One instance is reused across many methods; [`InstructionEmulator::initialize`] wipes
/// every piece of state, so nothing leaks between logical sessions.
#[derive(Debug, Default)]
pub struct InstructionEmulator {
    stack: Vec<EmValue>,
    locals: Vec<EmValue>,
    args: Vec<EmValue>,
    track_locals: bool,
}

impl InstructionEmulator {
    /// Creates an uninitialized emulator.
    #[must_use]
    pub fn new() -> Self {
        InstructionEmulator::default()
    }

    /// Resets all state for a new method.
    ///
    /// Local and argument slots start as [`EmValue::Unknown`]; when `track_locals` is
    /// `false`, local loads always produce `Unknown` and local stores are dropped, which
    /// keeps replay sound across ranges that skip intermediate stores.
    pub fn initialize(&mut self, ctx: &MethodContext, track_locals: bool) {
        self.stack.clear();
        self.locals.clear();
        self.locals.resize(ctx.locals, EmValue::Unknown);
        self.args.clear();
        self.args.resize(ctx.args, EmValue::Unknown);
        self.track_locals = track_locals;
    }

    /// Pushes a value onto the evaluation stack.
    pub fn push(&mut self, value: EmValue) {
        self.stack.push(value);
    }

    /// Pops the top of stack; an empty stack yields [`EmValue::Unknown`].
    ///
    /// Emulated ranges frequently start mid-method with values produced before the range;
    /// treating the missing producer as an unknown input is the sound interpretation.
    pub fn pop(&mut self) -> EmValue {
        self.stack.pop().unwrap_or(EmValue::Unknown)
    }

    /// Returns the top of stack without removing it; `Unknown` when empty.
    #[must_use]
    pub fn peek(&self) -> EmValue {
        self.stack.last().copied().unwrap_or(EmValue::Unknown)
    }

    /// Current evaluation stack depth.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Stores a value into a local slot.
    pub fn set_local(&mut self, index: usize, value: EmValue) {
        if self.track_locals {
            if let Some(slot) = self.locals.get_mut(index) {
                *slot = value;
            }
        }
    }

    /// Reads a local slot; untracked or out-of-range slots read as `Unknown`.
    #[must_use]
    pub fn get_local(&self, index: usize) -> EmValue {
        if self.track_locals {
            self.locals.get(index).copied().unwrap_or(EmValue::Unknown)
        } else {
            EmValue::Unknown
        }
    }

    /// Stores a value into an argument slot.
    pub fn set_arg(&mut self, index: usize, value: EmValue) {
        if let Some(slot) = self.args.get_mut(index) {
            *slot = value;
        }
    }

    /// Reads an argument slot; out-of-range slots read as `Unknown`.
    #[must_use]
    pub fn get_arg(&self, index: usize) -> EmValue {
        self.args.get(index).copied().unwrap_or(EmValue::Unknown)
    }

    /// Replays `instructions[start..end]` in order.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] when the range does not lie within the slice.
    pub fn emulate(&mut self, instructions: &[Instruction], start: usize, end: usize) -> Result<()> {
        let range = instructions.get(start..end).ok_or(Error::OutOfBounds)?;
        for instr in range {
            self.emulate_instruction(instr);
        }
        Ok(())
    }

    /// Pops right then left, pushes `op(left, right)`.
    fn binary(&mut self, op: fn(&EmValue, &EmValue) -> EmValue) {
        let right = self.pop();
        let left = self.pop();
        self.push(op(&left, &right));
    }

    /// Replays a single instruction.
    pub fn emulate_instruction(&mut self, instr: &Instruction) {
        match instr.op {
            Op::Nop | Op::Br | Op::Ret => {}
            Op::LdcI4 => {
                let value = match instr.ldc_i4_value() {
                    Some(v) => EmValue::known(v),
                    None => EmValue::Unknown,
                };
                self.push(value);
            }
            Op::Dup => {
                let top = self.peek();
                self.push(top);
            }
            Op::Pop | Op::Brtrue | Op::Brfalse | Op::Switch | Op::Stsfld => {
                self.pop();
            }
            Op::Ldloc => {
                let value = match instr.local_index() {
                    Some(i) => self.get_local(usize::from(i)),
                    None => EmValue::Unknown,
                };
                self.push(value);
            }
            Op::Stloc => {
                let value = self.pop();
                if let Some(i) = instr.local_index() {
                    self.set_local(usize::from(i), value);
                }
            }
            Op::Ldarg => {
                let value = match instr.arg_index() {
                    Some(i) => self.get_arg(usize::from(i)),
                    None => EmValue::Unknown,
                };
                self.push(value);
            }
            Op::Starg => {
                let value = self.pop();
                if let Some(i) = instr.arg_index() {
                    self.set_arg(usize::from(i), value);
                }
            }
            // 32-bit domain: conversions to int32/uint32 keep the value bits
            Op::ConvI4 | Op::ConvU4 => {}
            Op::Add => self.binary(EmValue::add),
            Op::Sub => self.binary(EmValue::sub),
            Op::Mul => self.binary(EmValue::mul),
            Op::DivUn => self.binary(EmValue::div_un),
            Op::RemUn => self.binary(EmValue::rem_un),
            Op::Xor => self.binary(EmValue::xor),
            Op::And => self.binary(EmValue::and),
            Op::Or => self.binary(EmValue::or),
            Op::Shl => self.binary(EmValue::shl),
            Op::Shr => self.binary(EmValue::shr),
            Op::ShrUn => self.binary(EmValue::shr_un),
            Op::Neg => {
                let value = self.pop().neg();
                self.push(value);
            }
            Op::Not => {
                let value = self.pop().not();
                self.push(value);
            }
            Op::Call | Op::Callvirt | Op::Newobj => {
                if let Some(target) = instr.call_target() {
                    let pops = if instr.op == Op::Newobj {
                        target.params
                    } else {
                        target.pop_count()
                    };
                    for _ in 0..pops {
                        self.pop();
                    }
                    if target.returns || instr.op == Op::Newobj {
                        self.push(EmValue::Unknown);
                    }
                } else {
                    // No target info: wipe the stack rather than guess arity
                    self.stack.clear();
                }
            }
            Op::Ldlen | Op::LdelemU1 => {
                // ldlen pops the array; ldelem pops array + index
                self.pop();
                if instr.op == Op::LdelemU1 {
                    self.pop();
                }
                self.push(EmValue::Unknown);
            }
            Op::Ldstr | Op::Ldsfld | Op::Ldtoken | Op::Newarr => {
                if matches!(instr.op, Op::Newarr) {
                    self.pop();
                }
                self.push(EmValue::Unknown);
            }
            Op::Other => {
                // Unmodeled instruction: its stack effect is unknown, so drop precision
                self.stack.clear();
            }
        }
    }
}
