// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # unfuser
//!
//! Static deobfuscation core for ConfuserEx-protected .NET assemblies, built in pure Rust.
//! `unfuser` recovers what the obfuscator hid - flattened control flow, encrypted constant
//! pools, delegate-proxied call sites - by replaying the obfuscator's own runtime
//! computations at analysis time: a CIL evaluation-stack emulator proves dispatch keys and
//! member tokens statically known, and a micro-emulator executes the embedded native x86
//! key-mixing helpers without ever running the target.
//!
//! The crate is deliberately host-agnostic: it never parses PE files or metadata tables
//! itself. The embedding tool materializes method bodies in the compact [`cil`] model,
//! answers metadata lookups through the seam traits in [`passes`], and applies the
//! rewrites the locators produce.
//!
//! ## Architecture
//!
//! - [`cil`] - compact instruction model, abstract 32-bit value domain with per-bit
//!   validity, and the evaluation-stack emulator
//! - [`x86`] - decoder and emulator for the native key-mixing helpers the obfuscator
//!   compiles into the module
//! - [`blocks`] - the basic-block view the control-flow pass rewrites
//! - [`passes`] - the three locator passes (switches, constants, proxies) plus their
//!   shared host seams and event log
//!
//! ## Quick Start
//!
//! Executing a native key-mixing helper from its raw bytes:
//!
//! ```rust
//! use unfuser::x86::X86Method;
//!
//! // pop eax; add eax, 5 - wrapped in the fixed helper prologue/epilogue
//! let mut code = X86Method::PROLOGUE.to_vec();
//! code.extend_from_slice(&[0x58, 0x81, 0xC0, 0x05, 0x00, 0x00, 0x00]);
//! code.extend_from_slice(&X86Method::EPILOGUE);
//!
//! let method = X86Method::parse(&code)?;
//! assert_eq!(method.execute(&[10])?, 15);
//! # Ok::<(), unfuser::Error>(())
//! ```
//!
//! Proving a dispatch key statically known with the CIL emulator:
//!
//! ```rust
//! use unfuser::cil::{Instruction, InstructionEmulator, MethodContext, Op};
//!
//! let instrs = [
//!     Instruction::ldc_i4(100),
//!     Instruction::ldc_i4(0x1234),
//!     Instruction::new(Op::Xor),
//! ];
//! let mut emulator = InstructionEmulator::new();
//! emulator.initialize(&MethodContext::new(0, 0), true);
//! emulator.emulate(&instrs, 0, instrs.len())?;
//! assert_eq!(emulator.pop().as_known_i32(), Some(100 ^ 0x1234));
//! # Ok::<(), unfuser::Error>(())
//! ```

mod error;
mod parser;
mod token;

/// Basic-block program view for the control-flow pass.
///
/// The host lowers each method into a [`blocks::MethodBlocks`] graph; the switch pass
/// rewrites dispatcher and case blocks in place. Key types:
///
/// - [`blocks::Block`] - instructions plus fallthrough/target edges
/// - [`blocks::SwitchData`] - per-block dispatch state (kind, key, hardcoded flag)
/// - [`blocks::SwitchKind`] - native-helper or arithmetic key derivation
pub mod blocks;

/// CIL instruction model, value domain and evaluation-stack emulator.
///
/// # Key Types
///
/// - [`cil::Instruction`] / [`cil::Op`] - the compact opcode/operand model
/// - [`cil::MethodBody`] - a host-materialized candidate method
/// - [`cil::EmValue`] / [`cil::Int32Value`] - known-bits abstract values
/// - [`cil::InstructionEmulator`] - replays instruction ranges
pub mod cil;

/// Locator passes and their host seams.
///
/// # Key Types
///
/// - [`passes::switches::ControlFlowFixer`] - unflattens switch-dispatched control flow
/// - [`passes::constants::ConstantsDecrypter`] - recovers the encrypted constant pool
/// - [`passes::proxies::ProxyCallFixer`] - resolves delegate-proxied call sites
/// - [`passes::NativeOracle`] / [`passes::Decompressor`] - capabilities the host provides
/// - [`passes::EventLog`] - audit trail of everything resolved or skipped
pub mod passes;

/// Decoder and emulator for embedded native x86 key-mixing helpers.
///
/// The obfuscator compiles small `int32 (int32)` mixing functions to machine code with a
/// fixed prologue and epilogue. [`x86::X86Method`] validates the frame, decodes the body
/// into [`x86::X86Instruction`] values and executes them over eight 32-bit registers and
/// a private stack.
///
/// # Example
///
/// ```rust
/// use unfuser::x86::X86Method;
///
/// let mut code = X86Method::PROLOGUE.to_vec();
/// code.extend_from_slice(&[0x58, 0xF7, 0xD8]); // pop eax; neg eax
/// code.extend_from_slice(&X86Method::EPILOGUE);
/// assert_eq!(X86Method::parse(&code)?.execute(&[7])?, -7);
/// # Ok::<(), unfuser::Error>(())
/// ```
pub mod x86;

/// `unfuser` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. Used consistently throughout the crate for all fallible operations.
///
/// # Examples
///
/// ```rust
/// use unfuser::{Parser, Result};
///
/// fn first_word(data: &[u8]) -> Result<u32> {
///     Parser::new(data).read_u32()
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `unfuser` Error type
///
/// The main error type for all operations in this crate: decode failures, malformed
/// obfuscation patterns, emulation dead ends and out-of-range reads.
///
/// # Examples
///
/// ```rust
/// use unfuser::{Error, Parser};
///
/// match Parser::new(&[0x01]).read_u32() {
///     Ok(value) => println!("read {value}"),
///     Err(Error::OutOfBounds) => println!("truncated input"),
///     Err(e) => println!("error: {e}"),
/// }
/// ```
pub use error::Error;

/// Bounds-checked little-endian byte reader.
///
/// Used for walking native helper bodies and the binary blobs the passes decode.
///
/// # Example
///
/// ```rust
/// use unfuser::Parser;
///
/// let mut parser = Parser::new(&[0x2A, 0x00, 0x00, 0x00]);
/// assert_eq!(parser.read_u32()?, 42);
/// # Ok::<(), unfuser::Error>(())
/// ```
pub use parser::Parser;

/// A .NET metadata token: table id in the high byte, row id in the low 24 bits.
///
/// The core never resolves tokens itself; descriptors carry [`Token`] values so the host
/// can resolve fields, methods and member references after emulation has recovered the
/// raw numbers.
pub use token::Token;
