//! Minimal x86 emulation of embedded native helper functions.
//!
//! The obfuscator compiles tiny key-derivation helpers to native machine code and calls
//! them from CIL as opaque oracles of type `int32 (int32)`. Each helper is a fixed
//! compiler prologue, a short run of register arithmetic fed by `pop`s from the argument
//! area, and a register-restore epilogue ending in `ret`. [`X86Method`] packages the
//! whole pipeline: prologue validation, decoding via an [`InstructionDecoder`], epilogue
//! trimming, and execution against a fresh [`X86Emulator`] per call.
//!
//! # Example
//!
//! ```rust
//! use unfuser::x86::X86Method;
//!
//! // pop eax; add eax, 5 wrapped in the known prologue/epilogue
//! let mut code = X86Method::PROLOGUE.to_vec();
//! code.extend_from_slice(&[0x58, 0x81, 0xC0, 0x05, 0x00, 0x00, 0x00]);
//! code.extend_from_slice(&X86Method::EPILOGUE);
//!
//! let method = X86Method::parse(&code)?;
//! assert_eq!(method.execute(&[10])?, 15);
//! # Ok::<(), unfuser::Error>(())
//! ```

pub mod decoder;
pub mod emulator;
pub mod instruction;

pub use decoder::{ByteDecoder, InstructionDecoder};
pub use emulator::X86Emulator;
pub use instruction::{X86Instruction, X86OpCode, X86Operand, X86Register};

use crate::parser::Parser;
use crate::{Error, Result};

/// A parsed native helper function, ready for repeated execution.
#[derive(Debug, Clone)]
pub struct X86Method {
    instructions: Vec<X86Instruction>,
}

impl X86Method {
    /// Entry bytes every supported helper starts with.
    ///
    /// Saves the callee-saved registers and normalizes the argument pointer; detected by
    /// content rather than skipped by a fixed offset so that an unexpected compiler
    /// product is rejected instead of executed as garbage.
    pub const PROLOGUE: [u8; 20] = [
        0x89, 0xE0, 0x53, 0x57, 0x56, 0x29, 0xE0, 0x83, 0xF8, 0x18, 0x74, 0x07, 0x8B, 0x44,
        0x24, 0x10, 0x50, 0xEB, 0x01, 0x51,
    ];

    /// Register-restore tail every supported helper ends with.
    pub const EPILOGUE: [u8; 4] = [0x5E, 0x5F, 0x5B, 0xC3];

    /// Parses a helper from its raw machine code using the built-in byte decoder.
    ///
    /// # Errors
    /// [`Error::UnsupportedPrologue`] when the entry bytes are not the known prologue;
    /// decode errors as documented on [`ByteDecoder`].
    pub fn parse(code: &[u8]) -> Result<Self> {
        Self::parse_with(code, &ByteDecoder::new())
    }

    /// Parses a helper using a caller-supplied decoding engine.
    ///
    /// # Errors
    /// As [`X86Method::parse`].
    pub fn parse_with(code: &[u8], decoder: &dyn InstructionDecoder) -> Result<Self> {
        let mut parser = Parser::new(code);
        if !parser.starts_with(&Self::PROLOGUE) {
            return Err(Error::UnsupportedPrologue);
        }
        parser.advance_by(Self::PROLOGUE.len())?;
        let mut instructions = decoder.decode_until_ret(&mut parser)?;
        // The epilogue's register restores decode as pops; they are not part of the
        // computation and would drain the argument stack
        while matches!(
            instructions.last(),
            Some(X86Instruction { opcode: X86OpCode::Pop, .. })
        ) {
            instructions.pop();
        }
        Ok(X86Method { instructions })
    }

    /// The decoded computation body.
    #[must_use]
    pub fn instructions(&self) -> &[X86Instruction] {
        &self.instructions
    }

    /// Executes the helper with the given arguments, returning its 32-bit result.
    ///
    /// A fresh register file is used per call; no state carries over between calls.
    ///
    /// # Errors
    /// [`Error::StackUnderflow`] when the body pops more values than `args` supplies.
    pub fn execute(&self, args: &[i32]) -> Result<i32> {
        X86Emulator::new(args).execute(&self.instructions)
    }
}
