//! Abstract value domain for CIL stack emulation.
//!
//! Values on the virtual evaluation stack are either [`EmValue::Unknown`] or a 32-bit integer
//! carrying a per-bit validity mask ([`Int32Value`]). The mask allows bitwise masking
//! operations to produce partially-known values (a bit ANDed with a known zero is known
//! regardless of the other operand); everything else requires fully-valid operands and
//! poisons the result to `Unknown` otherwise.
//!
//! Arithmetic uses standard two's-complement 32-bit wraparound semantics throughout.

use std::fmt;

/// A 32-bit integer with a per-bit validity mask.
///
/// A bit of `bits` is meaningful only where the corresponding bit of `valid_mask` is set.
/// Fully-valid values (`valid_mask == u32::MAX`) behave like ordinary `i32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int32Value {
    /// The value bits; garbage wherever `valid_mask` is clear.
    pub bits: u32,
    /// Set bits mark which bits of `bits` are known.
    pub valid_mask: u32,
}

impl Int32Value {
    /// Creates a fully-valid 32-bit value.
    #[must_use]
    pub fn new(value: i32) -> Self {
        Int32Value {
            bits: value as u32,
            valid_mask: u32::MAX,
        }
    }

    /// Creates a partially-valid value. Bits outside `valid_mask` are cleared.
    #[must_use]
    pub fn partial(bits: u32, valid_mask: u32) -> Self {
        Int32Value {
            bits: bits & valid_mask,
            valid_mask,
        }
    }

    /// Returns `true` when every bit of the value is known.
    #[must_use]
    pub fn all_bits_valid(&self) -> bool {
        self.valid_mask == u32::MAX
    }

    /// Returns the concrete value, if fully valid.
    #[must_use]
    pub fn value(&self) -> Option<i32> {
        if self.all_bits_valid() {
            Some(self.bits as i32)
        } else {
            None
        }
    }

    /// Bits known to be zero.
    fn known_zero(&self) -> u32 {
        self.valid_mask & !self.bits
    }

    /// Bits known to be one.
    fn known_one(&self) -> u32 {
        self.valid_mask & self.bits
    }
}

impl fmt::Display for Int32Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all_bits_valid() {
            write!(f, "{:#x}", self.bits)
        } else {
            write!(f, "{:#x}/{:#x}", self.bits, self.valid_mask)
        }
    }
}

/// A value on the virtual evaluation stack.
///
/// Anything the emulator cannot model precisely (object references, 64-bit arithmetic
/// results, call return values) collapses to [`EmValue::Unknown`]; the obfuscated constructs
/// this crate targets only ever decide on fully-known 32-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmValue {
    /// The value could not be determined statically.
    Unknown,
    /// A (possibly partially) known 32-bit integer.
    Int32(Int32Value),
}

/// Requires both operands fully valid, then applies `f` with wrapping semantics.
fn binary_full(lhs: &EmValue, rhs: &EmValue, f: impl Fn(i32, i32) -> i32) -> EmValue {
    match (lhs, rhs) {
        (EmValue::Int32(a), EmValue::Int32(b)) if a.all_bits_valid() && b.all_bits_valid() => {
            EmValue::known(f(a.bits as i32, b.bits as i32))
        }
        _ => EmValue::Unknown,
    }
}

impl EmValue {
    /// Creates a fully-valid 32-bit value.
    #[must_use]
    pub fn known(value: i32) -> Self {
        EmValue::Int32(Int32Value::new(value))
    }

    /// Returns `true` if this value is [`EmValue::Unknown`].
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, EmValue::Unknown)
    }

    /// Returns `true` if this value is a (possibly partial) 32-bit integer.
    #[must_use]
    pub fn is_int32(&self) -> bool {
        matches!(self, EmValue::Int32(_))
    }

    /// Returns the concrete integer, if this is a fully-valid `Int32`.
    #[must_use]
    pub fn as_known_i32(&self) -> Option<i32> {
        match self {
            EmValue::Int32(v) => v.value(),
            EmValue::Unknown => None,
        }
    }

    /// Wrapping addition.
    #[must_use]
    pub fn add(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, i32::wrapping_add)
    }

    /// Wrapping subtraction.
    #[must_use]
    pub fn sub(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, i32::wrapping_sub)
    }

    /// Wrapping multiplication.
    #[must_use]
    pub fn mul(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, i32::wrapping_mul)
    }

    /// Unsigned division; division by zero yields `Unknown`.
    #[must_use]
    pub fn div_un(&self, other: &EmValue) -> EmValue {
        match (self.as_known_i32(), other.as_known_i32()) {
            (Some(a), Some(b)) if b != 0 => EmValue::known(((a as u32) / (b as u32)) as i32),
            _ => EmValue::Unknown,
        }
    }

    /// Unsigned remainder; division by zero yields `Unknown`.
    #[must_use]
    pub fn rem_un(&self, other: &EmValue) -> EmValue {
        match (self.as_known_i32(), other.as_known_i32()) {
            (Some(a), Some(b)) if b != 0 => EmValue::known(((a as u32) % (b as u32)) as i32),
            _ => EmValue::Unknown,
        }
    }

    /// Bitwise exclusive-or.
    #[must_use]
    pub fn xor(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, |a, b| a ^ b)
    }

    /// Bitwise and. A bit is known if both operands know it, or either operand knows it
    /// to be zero.
    #[must_use]
    pub fn and(&self, other: &EmValue) -> EmValue {
        match (self, other) {
            (EmValue::Int32(a), EmValue::Int32(b)) => {
                let valid = (a.valid_mask & b.valid_mask) | a.known_zero() | b.known_zero();
                if valid == 0 {
                    EmValue::Unknown
                } else {
                    EmValue::Int32(Int32Value::partial(a.bits & b.bits, valid))
                }
            }
            _ => EmValue::Unknown,
        }
    }

    /// Bitwise or. A bit is known if both operands know it, or either operand knows it
    /// to be one.
    #[must_use]
    pub fn or(&self, other: &EmValue) -> EmValue {
        match (self, other) {
            (EmValue::Int32(a), EmValue::Int32(b)) => {
                let valid = (a.valid_mask & b.valid_mask) | a.known_one() | b.known_one();
                if valid == 0 {
                    EmValue::Unknown
                } else {
                    EmValue::Int32(Int32Value::partial(a.bits | b.bits, valid))
                }
            }
            _ => EmValue::Unknown,
        }
    }

    /// Shift left; shift count is masked to 5 bits as the runtime does.
    #[must_use]
    pub fn shl(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, |a, b| a.wrapping_shl(b as u32 & 0x1F))
    }

    /// Arithmetic shift right.
    #[must_use]
    pub fn shr(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, |a, b| a.wrapping_shr(b as u32 & 0x1F))
    }

    /// Logical shift right.
    #[must_use]
    pub fn shr_un(&self, other: &EmValue) -> EmValue {
        binary_full(self, other, |a, b| {
            ((a as u32).wrapping_shr(b as u32 & 0x1F)) as i32
        })
    }

    /// Arithmetic negation.
    #[must_use]
    pub fn neg(&self) -> EmValue {
        match self.as_known_i32() {
            Some(a) => EmValue::known(a.wrapping_neg()),
            None => EmValue::Unknown,
        }
    }

    /// Bitwise complement. Inverts the known bits, keeping the validity mask.
    #[must_use]
    pub fn not(&self) -> EmValue {
        match self {
            EmValue::Int32(a) => EmValue::Int32(Int32Value::partial(!a.bits, a.valid_mask)),
            EmValue::Unknown => EmValue::Unknown,
        }
    }
}

impl fmt::Display for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::Unknown => write!(f, "<unknown>"),
            EmValue::Int32(v) => write!(f, "{v}"),
        }
    }
}
