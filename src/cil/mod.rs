//! CIL program model and abstract stack emulation.
//!
//! Three layers, leaf first: [`value`] is the abstract value domain (known 32-bit
//! integers with per-bit validity, or `Unknown`), [`instruction`] is the compact
//! opcode/operand model the locators pattern-match over, and [`emulator`] replays
//! instruction ranges against a virtual evaluation stack to prove values statically
//! known before a transformation commits to them.

pub mod emulator;
pub mod instruction;
pub mod value;

pub use emulator::{InstructionEmulator, MethodContext};
pub use instruction::{FieldRef, Instruction, MethodBody, MethodRef, Op, Operand};
pub use value::{EmValue, Int32Value};
