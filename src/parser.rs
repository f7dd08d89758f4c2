//! Low-level byte stream cursor for native machine-code decoding.
//!
//! This module provides the [`crate::parser::Parser`] type, a cursor-based binary reader used
//! by the x86 byte decoder. It offers bounds-checked sequential access to a byte slice with
//! little-endian primitive reads; every operation validates data availability before touching
//! the underlying buffer.
//!
//! # Example
//!
//! ```rust
//! use unfuser::Parser;
//!
//! let code = [0xB8, 0x05, 0x00, 0x00, 0x00]; // mov eax, 5
//! let mut parser = Parser::new(&code);
//! assert_eq!(parser.read_u8()?, 0xB8);
//! assert_eq!(parser.read_i32()?, 5);
//! assert!(!parser.has_more_data());
//! # Ok::<(), unfuser::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// A bounds-checked cursor over a byte slice.
///
/// The parser maintains a position within the borrowed data; reads advance the position and
/// fail with [`crate::Error::OutOfBounds`] instead of reading past the end.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Creates a new parser over the provided data, positioned at offset 0.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if at least one more byte can be read.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the current read position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Moves the cursor to an absolute position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }
        self.position = pos;
        Ok(())
    }

    /// Advances the cursor by `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the new position is past the end of the data.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let new_pos = self.position.checked_add(step).ok_or(OutOfBounds)?;
        self.seek(new_pos)
    }

    /// Returns the byte at the current position without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no byte is available.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data.get(self.position).copied().ok_or(OutOfBounds)
    }

    /// Returns `true` if the bytes at the current position equal `needle`.
    ///
    /// Does not advance the cursor; a truncated tail compares unequal.
    #[must_use]
    pub fn starts_with(&self, needle: &[u8]) -> bool {
        self.data[self.position..].starts_with(needle)
    }

    /// Reads one byte and advances.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no byte is available.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.peek_byte()?;
        self.position += 1;
        Ok(value)
    }

    /// Reads a little-endian `i32` and advances.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 4 bytes remain.
    pub fn read_i32(&mut self) -> Result<i32> {
        let end = self.position.checked_add(4).ok_or(OutOfBounds)?;
        let bytes = self.data.get(self.position..end).ok_or(OutOfBounds)?;
        let bytes: [u8; 4] = bytes.try_into().map_err(|_| OutOfBounds)?;
        self.position = end;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Reads a little-endian `u32` and advances.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 4 bytes remain.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_i32()? as u32)
    }

    /// Returns the number of bytes remaining after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}
