use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every variant is fatal to the *single construct* being processed: a failed decode or an
/// unresolvable value aborts the current method's transformation, while sibling methods are
/// unaffected and the enclosing pass continues with the next candidate. Nothing here is
/// retryable.
///
/// # Error Categories
///
/// ## Native decode errors
/// - [`Error::UnsupportedOpcode`] - Opcode byte outside the supported helper-function subset
/// - [`Error::MemoryOperand`] - ModRM byte encodes a memory operand (`mod != 3`)
/// - [`Error::UnsupportedPrologue`] - Native method does not start with a recognized prologue
///
/// ## Emulation errors
/// - [`Error::UnknownValue`] - A value needed for a decision did not reduce to a concrete integer
/// - [`Error::StackUnderflow`] - The native argument stack was exhausted by a POP
/// - [`Error::CaseOutOfRange`] - A computed switch case index exceeds the known branch targets
///
/// ## Pattern / data errors
/// - [`Error::MalformedPattern`] - A locator-detected shape turned out to be inconsistent
/// - [`Error::OutOfBounds`] - A read past the end of machine code or a decrypted blob
/// - [`Error::Decompression`] - The external payload decompressor reported a failure
#[derive(Error, Debug)]
pub enum Error {
    /// Encountered an opcode byte outside the supported instruction subset.
    ///
    /// The obfuscator's embedded helper functions are known to use only a small set of
    /// arithmetic and move instructions. Anything else means the bytes under the cursor are
    /// not such a helper, and the whole emulation is aborted - there is no partial decode.
    #[error("Unsupported opcode {opcode:#04x} at offset {offset:#x}")]
    UnsupportedOpcode {
        /// The offending opcode byte
        opcode: u8,
        /// Byte offset of the instruction within the decoded stream
        offset: usize,
    },

    /// A ModRM byte encodes a memory operand.
    ///
    /// The helper functions operate purely on registers (`mod == 3`); a memory-operand
    /// encoding indicates a mis-detected method and aborts the decode.
    #[error("Memory operand (mod != 3) at offset {offset:#x}")]
    MemoryOperand {
        /// Byte offset of the ModRM byte within the decoded stream
        offset: usize,
    },

    /// The native method's entry bytes do not match a known compiler prologue.
    ///
    /// Rather than skipping a fixed number of bytes and executing garbage, an unrecognized
    /// prologue is reported so the caller can skip the construct.
    #[error("Native method does not start with a recognized prologue")]
    UnsupportedPrologue,

    /// A stack value needed for a decision could not be reduced to a concrete integer.
    ///
    /// This is the standard outcome when an obfuscated construct does not evaluate to a
    /// compile-time-known value; the enclosing transformation must leave it untouched.
    #[error("Emulated value did not reduce to a known 32-bit integer")]
    UnknownValue,

    /// More POP instructions executed than arguments supplied.
    ///
    /// Indicates a locator mis-detected a shape and handed the emulator the wrong method or
    /// the wrong argument count.
    #[error("Native argument stack underflow")]
    StackUnderflow,

    /// A computed switch case index is out of bounds of the known branch targets.
    ///
    /// Signals a corrupted or mis-detected switch dispatcher.
    #[error("Switch case index {index} out of range ({targets} targets)")]
    CaseOutOfRange {
        /// The resolved case index
        index: u32,
        /// Number of branch targets the dispatcher actually has
        targets: usize,
    },

    /// A previously detected instruction shape turned out to be inconsistent when applied.
    #[error("Malformed pattern - {0}")]
    MalformedPattern(String),

    /// An out of bound access was attempted while reading machine code or blob data.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// The external payload decompressor reported a failure.
    #[error("Decompression failed - {0}")]
    Decompression(String),
}
