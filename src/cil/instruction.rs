//! Compact CIL instruction model.
//!
//! The locators and the stack emulator only need a small view of a method body: opcode
//! identity, integer operands, slot indices and enough information about call targets to
//! match signatures and pop the right number of arguments. This module provides that view
//! together with the shape-test helpers the pattern matchers are built from.

use crate::token::Token;
use strum::{Display, EnumCount};

/// CIL operations the emulator and locators understand.
///
/// Anything a real method body contains beyond this set is represented as [`Op::Other`];
/// the locators treat such instructions as shape-breaking and the emulator refuses ranges
/// containing them by pushing [`crate::cil::EmValue::Unknown`] conservatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount)]
pub enum Op {
    /// No operation.
    Nop,
    /// Duplicate the top of stack.
    Dup,
    /// Discard the top of stack.
    Pop,
    /// Load a 32-bit integer constant.
    LdcI4,
    /// Load a string literal.
    Ldstr,
    /// Load a local variable.
    Ldloc,
    /// Store to a local variable.
    Stloc,
    /// Load an argument.
    Ldarg,
    /// Store to an argument.
    Starg,
    /// Load a static field value.
    Ldsfld,
    /// Store a static field value.
    Stsfld,
    /// Load a runtime handle for a metadata token.
    Ldtoken,
    /// Load the length of an array.
    Ldlen,
    /// Load an array element as a 32-bit integer.
    LdelemU1,
    /// Truncate/extend to a 32-bit integer.
    ConvI4,
    /// Truncate/extend to an unsigned 32-bit integer.
    ConvU4,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Unsigned division.
    DivUn,
    /// Unsigned remainder.
    RemUn,
    /// Bitwise exclusive-or.
    Xor,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Shift left.
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// Logical shift right.
    ShrUn,
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    Not,
    /// Static or direct call.
    Call,
    /// Virtual call.
    Callvirt,
    /// Object construction call.
    Newobj,
    /// Array allocation.
    Newarr,
    /// Unconditional branch.
    Br,
    /// Branch if non-zero.
    Brtrue,
    /// Branch if zero.
    Brfalse,
    /// Multi-way branch; targets live on the enclosing block.
    Switch,
    /// Return from the method.
    Ret,
    /// Any instruction outside the modeled subset.
    Other,
}

/// Reference to a called method, carrying what the locators match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    /// Metadata token of the target.
    pub token: Token,
    /// Simple name of the target.
    pub name: String,
    /// Full signature string, e.g. `"System.Int32 (System.UInt32)"`.
    pub signature: String,
    /// `true` for static targets (no implicit `this` argument).
    pub is_static: bool,
    /// `true` when the target body is native machine code rather than CIL.
    pub is_native: bool,
    /// Number of declared parameters.
    pub params: usize,
    /// `true` when the target returns a value.
    pub returns: bool,
}

impl MethodRef {
    /// Number of stack slots a call to this method pops (parameters plus `this`).
    #[must_use]
    pub fn pop_count(&self) -> usize {
        self.params + usize::from(!self.is_static)
    }
}

/// Reference to a field, carrying its token, name and any RVA-backed initial data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    /// Metadata token of the field.
    pub token: Token,
    /// Field name; proxy delegates encode data in these characters.
    pub name: String,
    /// Raw initial value bytes for fields with an RVA (array initializers).
    pub initial_value: Option<Vec<u8>>,
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// No operand.
    None,
    /// 32-bit integer immediate.
    Int32(i32),
    /// String literal, or a type name for `newarr`.
    Str(String),
    /// Local variable slot index.
    Local(u16),
    /// Argument slot index.
    Arg(u16),
    /// A raw metadata token (`ldtoken` on a type, etc.).
    Token(Token),
    /// A method reference.
    Method(MethodRef),
    /// A field reference.
    Field(FieldRef),
}

/// A method body in the compact model: its token, instructions and slot counts.
///
/// Hosts materialize these for the candidate methods a locator should inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Metadata token of the method.
    pub token: Token,
    /// The instruction list, macros already expanded.
    pub instructions: Vec<Instruction>,
    /// Number of local variable slots.
    pub locals: usize,
    /// Number of argument slots.
    pub args: usize,
}

/// One CIL instruction: operation plus operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The operation.
    pub op: Op,
    /// The operand, or [`Operand::None`].
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with no operand.
    #[must_use]
    pub fn new(op: Op) -> Self {
        Instruction {
            op,
            operand: Operand::None,
        }
    }

    /// Creates an instruction with an operand.
    #[must_use]
    pub fn with_operand(op: Op, operand: Operand) -> Self {
        Instruction { op, operand }
    }

    /// Creates a `ldc.i4` loading `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        Instruction::with_operand(Op::LdcI4, Operand::Int32(value))
    }

    /// Creates a `ldloc` for slot `index`.
    #[must_use]
    pub fn ldloc(index: u16) -> Self {
        Instruction::with_operand(Op::Ldloc, Operand::Local(index))
    }

    /// Creates a `stloc` for slot `index`.
    #[must_use]
    pub fn stloc(index: u16) -> Self {
        Instruction::with_operand(Op::Stloc, Operand::Local(index))
    }

    /// Creates a `ldarg` for slot `index`.
    #[must_use]
    pub fn ldarg(index: u16) -> Self {
        Instruction::with_operand(Op::Ldarg, Operand::Arg(index))
    }

    /// Creates a `starg` for slot `index`.
    #[must_use]
    pub fn starg(index: u16) -> Self {
        Instruction::with_operand(Op::Starg, Operand::Arg(index))
    }

    /// Creates a `call` to `method`.
    #[must_use]
    pub fn call(method: MethodRef) -> Self {
        Instruction::with_operand(Op::Call, Operand::Method(method))
    }

    /// Returns `true` for `ldc.i4`.
    #[must_use]
    pub fn is_ldc_i4(&self) -> bool {
        self.op == Op::LdcI4
    }

    /// Returns the `ldc.i4` immediate, if this is one.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        match (self.op, &self.operand) {
            (Op::LdcI4, Operand::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns `true` for `ldloc`.
    #[must_use]
    pub fn is_ldloc(&self) -> bool {
        self.op == Op::Ldloc
    }

    /// Returns `true` for `stloc`.
    #[must_use]
    pub fn is_stloc(&self) -> bool {
        self.op == Op::Stloc
    }

    /// Returns `true` for `ldarg`.
    #[must_use]
    pub fn is_ldarg(&self) -> bool {
        self.op == Op::Ldarg
    }

    /// Returns `true` for `starg`.
    #[must_use]
    pub fn is_starg(&self) -> bool {
        self.op == Op::Starg
    }

    /// Returns the local slot index for `ldloc`/`stloc`.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match (self.op, &self.operand) {
            (Op::Ldloc | Op::Stloc, Operand::Local(i)) => Some(*i),
            _ => None,
        }
    }

    /// Returns the argument slot index for `ldarg`/`starg`.
    #[must_use]
    pub fn arg_index(&self) -> Option<u16> {
        match (self.op, &self.operand) {
            (Op::Ldarg | Op::Starg, Operand::Arg(i)) => Some(*i),
            _ => None,
        }
    }

    /// Returns the called method for `call`/`callvirt`/`newobj`.
    #[must_use]
    pub fn call_target(&self) -> Option<&MethodRef> {
        match (self.op, &self.operand) {
            (Op::Call | Op::Callvirt | Op::Newobj, Operand::Method(m)) => Some(m),
            _ => None,
        }
    }

    /// Returns the referenced field for field-operand instructions.
    #[must_use]
    pub fn field(&self) -> Option<&FieldRef> {
        match &self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    /// Returns `true` for the arithmetic/bitwise operator set the emulator models.
    #[must_use]
    pub fn is_arithmetical(&self) -> bool {
        matches!(
            self.op,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::DivUn
                | Op::RemUn
                | Op::Xor
                | Op::And
                | Op::Or
                | Op::Shl
                | Op::Shr
                | Op::ShrUn
                | Op::Neg
                | Op::Not
        )
    }

    /// Returns `true` for instructions allowed inside a key-mixing body.
    ///
    /// Dispatcher bodies between the key load and the final `switch` consist solely of
    /// constant loads, arithmetic, local traffic, stack shuffling and integer
    /// conversions.
    #[must_use]
    pub fn is_valid_instr(&self) -> bool {
        self.is_arithmetical()
            || self.is_ldc_i4()
            || matches!(
                self.op,
                Op::Dup | Op::ConvI4 | Op::ConvU4 | Op::Ldloc | Op::Stloc
            )
    }

    /// Returns `true` for unconditional or conditional branches (not `switch`).
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self.op, Op::Br | Op::Brtrue | Op::Brfalse)
    }
}
