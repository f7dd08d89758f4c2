//! Locator passes and their shared plumbing.
//!
//! Each pass recognizes one obfuscated construct family and drives the emulators to
//! resolve it: [`switches`] rewrites flattened control flow, [`constants`] recovers the
//! encrypted constant pool, [`proxies`] resolves delegate-proxied call sites. This module
//! holds what they share: the [`EventLog`] passes report through, the [`NativeOracle`] and
//! [`Decompressor`] seams to the host, and the versioned [`ConstantsProfile`]
//! configuration.

pub mod constants;
pub mod proxies;
pub mod switches;

use std::collections::HashMap;

use crate::cil::MethodRef;
use crate::token::Token;
use crate::x86::X86Method;
use crate::{Error, Result};

/// A single recorded pass outcome.
///
/// Passes are fail-safe: a construct that cannot be resolved is skipped and recorded, so
/// the log is also the audit trail of what was left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A dispatcher block was rewritten into a direct branch.
    SwitchResolved {
        /// The rewritten case block.
        block: usize,
        /// The resolved branch target.
        target: usize,
        /// The concrete dispatch key.
        key: i32,
    },
    /// A single-case dispatcher collapsed to its only target.
    HardcodedSwitchResolved {
        /// The dispatcher block.
        block: usize,
        /// The resolved branch target.
        target: usize,
    },
    /// A case block could not be resolved and was left untouched.
    SwitchSkipped {
        /// The skipped block.
        block: usize,
    },
    /// A native key-derivation helper was discovered.
    NativeHelperFound {
        /// Token of the native method.
        method: Token,
    },
    /// The constant-pool initializer was located and its blob decrypted.
    ConstantPoolRecovered {
        /// Token of the RVA-backed array field.
        array_field: Token,
        /// Decrypted pool size in bytes.
        size: usize,
    },
    /// A constant-decrypter stub was matched.
    DecrypterFound {
        /// Token of the generic stub method.
        method: Token,
        /// `true` when the stub mixes through a native helper.
        native: bool,
    },
    /// A proxied call site was resolved to its real target.
    ProxyResolved {
        /// Token of the delegate field.
        field: Token,
        /// Token of the real callee.
        target: Token,
    },
    /// A proxied call site could not be resolved.
    ProxySkipped {
        /// Token of the delegate field.
        field: Token,
    },
}

/// Accumulated pass outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<EventKind>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        EventLog::default()
    }

    /// Appends one event.
    pub fn record(&mut self, event: EventKind) {
        self.events.push(event);
    }

    /// Moves all events of `other` into this log.
    pub fn merge(&mut self, other: EventLog) {
        self.events.extend(other.events);
    }

    /// Iterates the recorded events in order.
    pub fn iter(&self) -> impl Iterator<Item = &EventKind> {
        self.events.iter()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Executes an embedded native `int32 (int32)` helper on behalf of a pass.
///
/// Resolving a method token to its machine-code bytes is the host's job; the passes only
/// see this capability.
pub trait NativeOracle {
    /// Runs the helper identified by `method` with `arg`.
    ///
    /// # Errors
    /// Fails when the helper is unknown or its body cannot be decoded or executed.
    fn execute(&self, method: &MethodRef, arg: i32) -> Result<i32>;
}

/// A [`NativeOracle`] backed by parsed machine code, keyed by method token.
#[derive(Debug, Default)]
pub struct NativeMethodTable {
    methods: HashMap<Token, X86Method>,
}

impl NativeMethodTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        NativeMethodTable::default()
    }

    /// Parses `code` and registers it under `token`.
    ///
    /// # Errors
    /// Fails when the code is not a supported helper; see [`X86Method::parse`].
    pub fn insert_code(&mut self, token: Token, code: &[u8]) -> Result<()> {
        let method = X86Method::parse(code)?;
        self.methods.insert(token, method);
        Ok(())
    }

    /// Number of registered helpers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` when no helper is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl NativeOracle for NativeMethodTable {
    fn execute(&self, method: &MethodRef, arg: i32) -> Result<i32> {
        let parsed = self.methods.get(&method.token).ok_or_else(|| {
            Error::MalformedPattern(format!("no native body registered for {}", method.token))
        })?;
        parsed.execute(&[arg])
    }
}

/// Decompresses an embedded payload blob.
///
/// The pool format is LZMA in every observed build; the algorithm lives with the host,
/// not here.
pub trait Decompressor {
    /// Decompresses `data`.
    ///
    /// # Errors
    /// [`Error::Decompression`] with the underlying reason.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

impl<F> Decompressor for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>>,
{
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        self(data)
    }
}

/// Versioned constants for the pool's XOR-keystream scrambling.
///
/// Two generations exist side by side in the wild: the current layout keyed by a 16-word
/// state and a 12/25/27 xorshift, and an older 8-word layout with a 13/7/17 xorshift.
/// Which one applies is decided by [`ConstantsProfile::detect`], never assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantsProfile {
    /// Words per keystream block; the first block of the scrambled array is the key state.
    pub block_words: usize,
    /// Xorshift triple advancing each state word.
    pub shifts: (u32, u32, u32),
}

impl ConstantsProfile {
    /// Current-generation layout: 16-word blocks, 12/25/27 xorshift.
    #[must_use]
    pub fn current() -> Self {
        ConstantsProfile {
            block_words: 16,
            shifts: (12, 25, 27),
        }
    }

    /// Legacy layout: 8-word blocks, 13/7/17 xorshift.
    #[must_use]
    pub fn legacy() -> Self {
        ConstantsProfile {
            block_words: 8,
            shifts: (13, 7, 17),
        }
    }

    /// Picks the generation matching a scrambled word array, if any.
    ///
    /// The array must hold the key block plus at least one data block, sized in whole
    /// blocks. The wider current-generation layout wins when both divide evenly.
    #[must_use]
    pub fn detect(words: &[u32]) -> Option<ConstantsProfile> {
        for profile in [ConstantsProfile::current(), ConstantsProfile::legacy()] {
            if words.len() >= profile.block_words * 2 && words.len() % profile.block_words == 0 {
                return Some(profile);
            }
        }
        None
    }

    fn advance(&self, mut word: u32) -> u32 {
        let (s0, s1, s2) = self.shifts;
        word ^= word << s0;
        word ^= word >> s1;
        word ^= word << s2;
        word
    }

    /// Removes the keystream from a scrambled word array.
    ///
    /// The leading block seeds the key state; every following block is XORed against the
    /// state, which then advances per word. Returns the descrambled data words (the key
    /// block is consumed, not returned).
    ///
    /// # Errors
    /// [`Error::MalformedPattern`] when the array is not sized in whole blocks or lacks
    /// a data block.
    pub fn unscramble(&self, words: &[u32]) -> Result<Vec<u32>> {
        if words.len() < self.block_words * 2 || words.len() % self.block_words != 0 {
            return Err(Error::MalformedPattern(format!(
                "scrambled pool of {} words does not fit {}-word blocks",
                words.len(),
                self.block_words
            )));
        }
        let mut state = words[..self.block_words].to_vec();
        let mut output = Vec::with_capacity(words.len() - self.block_words);
        for block in words[self.block_words..].chunks_exact(self.block_words) {
            for (j, &word) in block.iter().enumerate() {
                output.push(word ^ state[j]);
                state[j] = self.advance(state[j]);
            }
        }
        Ok(output)
    }
}
