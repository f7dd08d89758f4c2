//! Constant-pool recovery and decrypter-stub resolution.
//!
//! The obfuscator moves every string/number/array constant into one LZMA-compressed,
//! keystream-scrambled byte pool, initialized by a module-cctor helper and read back
//! through small generic stub methods. This pass matches the initializer shape to
//! recover the pool, matches the two stub generations (plain linear-congruential mixing
//! or a native-helper post-step) and exposes typed decrypt accessors over the pool.
//!
//! Stub bodies compute a blob offset as `magic = derive(index) & 0x3FFF_FFFF << 2`; the
//! derivation is the only part that differs between the shapes.

use crate::cil::{FieldRef, Instruction, MethodBody, MethodRef, Op, Operand};
use crate::passes::{ConstantsProfile, Decompressor, EventKind, EventLog, NativeOracle};
use crate::token::Token;
use crate::{Error, Result};

/// BCL members every decrypter stub calls; used to reject look-alike generic methods.
const STUB_CALLED_NAMES: [&str; 7] = [
    "get_UTF8",
    "GetString",
    "CreateInstance",
    "Intern",
    "BlockCopy",
    "GetTypeFromHandle",
    "GetElementType",
];

/// How a stub derives the pool offset from its index argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// Mixed through an embedded native `int32 (int32)` helper.
    Native(MethodRef),
    /// `index * num1 ^ num2`.
    Linear {
        /// Multiplicative constant.
        num1: u32,
        /// XOR constant.
        num2: u32,
    },
}

/// One matched decrypter stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecrypterInfo {
    /// Token of the generic stub method.
    pub method: Token,
    /// Offset derivation recovered from the stub body.
    pub derivation: Derivation,
}

/// Locates the constant pool and its decrypter stubs, then serves decrypt requests.
pub struct ConstantsDecrypter<'a> {
    lzma_method: Token,
    oracle: &'a dyn NativeOracle,
    decrypted: Option<Vec<u8>>,
    init_method: Option<Token>,
    array_field: Option<Token>,
    decrypted_field: Option<Token>,
    decrypters: Vec<DecrypterInfo>,
    events: EventLog,
}

impl<'a> ConstantsDecrypter<'a> {
    /// Creates a decrypter.
    ///
    /// `lzma_method` is the token of the module's embedded LZMA routine, located by the
    /// host; the initializer shape is anchored on a call to it.
    #[must_use]
    pub fn new(lzma_method: Token, oracle: &'a dyn NativeOracle) -> Self {
        ConstantsDecrypter {
            lzma_method,
            oracle,
            decrypted: None,
            init_method: None,
            array_field: None,
            decrypted_field: None,
            decrypters: Vec::new(),
            events: EventLog::new(),
        }
    }

    /// `true` once the initializer, the pool and at least one stub are known.
    #[must_use]
    pub fn detected(&self) -> bool {
        self.decrypted.is_some() && !self.decrypters.is_empty()
    }

    /// Token of the matched initializer method.
    #[must_use]
    pub fn init_method(&self) -> Option<Token> {
        self.init_method
    }

    /// Tokens of the RVA array field and the pool field, for host-side removal.
    #[must_use]
    pub fn fields(&self) -> (Option<Token>, Option<Token>) {
        (self.array_field, self.decrypted_field)
    }

    /// The matched stubs.
    #[must_use]
    pub fn decrypters(&self) -> &[DecrypterInfo] {
        &self.decrypters
    }

    /// Outcomes recorded so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Scans module-cctor helper candidates for the initializer and recovers the pool.
    ///
    /// The first candidate matching the initializer shape wins; its scrambled word
    /// array is descrambled with the detected [`ConstantsProfile`] generation, then
    /// handed to `decompressor`.
    pub fn find(&mut self, candidates: &[MethodBody], decompressor: &dyn Decompressor) {
        for body in candidates {
            let Some((array_field, pool_field)) = self.match_initializer(body) else {
                continue;
            };
            let Some(initial) = array_field.initial_value.as_deref() else {
                continue;
            };
            match self.recover_pool(initial, decompressor) {
                Ok(pool) => {
                    self.events.record(EventKind::ConstantPoolRecovered {
                        array_field: array_field.token,
                        size: pool.len(),
                    });
                    self.decrypted = Some(pool);
                    self.init_method = Some(body.token);
                    self.array_field = Some(array_field.token);
                    self.decrypted_field = Some(pool_field);
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// The initializer: build a `uint[]` from an RVA field, run it through the
    /// unscrambler, LZMA-decompress and store into a static pool field.
    fn match_initializer(&self, body: &MethodBody) -> Option<(FieldRef, Token)> {
        let instrs = &body.instructions;
        if instrs.len() < 15 {
            return None;
        }

        let count = instrs[0].ldc_i4_value()?;
        if !instrs[1].is_stloc() {
            return None;
        }
        if instrs[2].ldc_i4_value() != Some(count) {
            return None;
        }
        if instrs[3].op != Op::Newarr
            || !matches!(&instrs[3].operand, Operand::Str(name) if name == "System.UInt32")
        {
            return None;
        }
        if instrs[4].op != Op::Dup || instrs[5].op != Op::Ldtoken {
            return None;
        }
        let array_field = instrs[5].field()?.clone();
        array_field.initial_value.as_ref()?;
        if instrs[6].call_target().map(|m| m.name.as_str()) != Some("InitializeArray") {
            return None;
        }
        if !instrs[7].is_stloc() {
            return None;
        }

        let l = instrs.len();
        if !instrs[l - 4].is_ldloc() {
            return None;
        }
        if instrs[l - 3].call_target().map(|m| m.token) != Some(self.lzma_method) {
            return None;
        }
        if instrs[l - 2].op != Op::Stsfld {
            return None;
        }
        let pool_field = instrs[l - 2].field()?.token;
        Some((array_field, pool_field))
    }

    fn recover_pool(&self, initial: &[u8], decompressor: &dyn Decompressor) -> Result<Vec<u8>> {
        if initial.len() % 4 != 0 {
            return Err(Error::MalformedPattern(
                "RVA array data is not word-aligned".into(),
            ));
        }
        let words: Vec<u32> = initial
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let profile = ConstantsProfile::detect(&words).ok_or_else(|| {
            Error::MalformedPattern("no keystream generation fits the scrambled pool".into())
        })?;
        let descrambled = profile.unscramble(&words)?;
        let bytes: Vec<u8> = descrambled.iter().flat_map(|w| w.to_le_bytes()).collect();
        decompressor.decompress(&bytes)
    }

    /// Matches decrypter stubs among the generic `T (uint32)` methods the host found.
    pub fn find_decrypters(&mut self, candidates: &[MethodBody]) {
        for body in candidates {
            if let Some(native) = Self::match_native_stub(body) {
                self.events.record(EventKind::DecrypterFound {
                    method: body.token,
                    native: true,
                });
                self.decrypters.push(DecrypterInfo {
                    method: body.token,
                    derivation: Derivation::Native(native),
                });
            } else if let Some((num1, num2)) = Self::match_linear_stub(body) {
                self.events.record(EventKind::DecrypterFound {
                    method: body.token,
                    native: false,
                });
                self.decrypters.push(DecrypterInfo {
                    method: body.token,
                    derivation: Derivation::Linear { num1, num2 },
                });
            }
        }
    }

    /// `arg = arg * num1 ^ num2; ...` head of the linear stub.
    fn match_linear_stub(body: &MethodBody) -> Option<(u32, u32)> {
        let instrs = &body.instructions;
        if instrs.len() < 25 || !instrs[0].is_ldarg() {
            return None;
        }
        let num1 = instrs[1].ldc_i4_value()? as u32;
        if instrs[2].op != Op::Mul {
            return None;
        }
        let num2 = instrs[3].ldc_i4_value()? as u32;
        if instrs[4].op != Op::Xor || !instrs[5].is_starg() {
            return None;
        }
        Self::match_stub_tail(instrs, 6)?;
        Some((num1, num2))
    }

    /// `arg = native(arg); ...` head of the native stub.
    fn match_native_stub(body: &MethodBody) -> Option<MethodRef> {
        let instrs = &body.instructions;
        if instrs.len() < 25 || !instrs[0].is_ldarg() {
            return None;
        }
        let native = instrs[1].call_target()?;
        if !native.is_static
            || !native.is_native
            || native.signature != "System.Int32 (System.Int32)"
        {
            return None;
        }
        if !instrs[2].is_starg() {
            return None;
        }
        Self::match_stub_tail(instrs, 3)?;
        Some(native.clone())
    }

    /// The shared tail: `num = arg >> 30; ...; arg &= 0x3FFFFFFF; arg <<= 2` plus the
    /// BCL call set every real stub makes.
    fn match_stub_tail(instrs: &[Instruction], mut i: usize) -> Option<()> {
        if !instrs.get(i)?.is_ldarg() {
            return None;
        }
        i += 1;
        if instrs.get(i)?.ldc_i4_value() != Some(0x1E) {
            return None;
        }
        i += 1;
        if instrs.get(i)?.op != Op::ShrUn {
            return None;
        }
        i += 1;
        if !instrs.get(i)?.is_stloc() {
            return None;
        }
        // address load + initobj of the default return slot
        i += 2;
        if instrs.get(i)?.op != Op::Other {
            return None;
        }
        i += 1;
        if !instrs.get(i)?.is_ldarg() {
            return None;
        }
        i += 1;
        if instrs.get(i)?.ldc_i4_value() != Some(0x3FFF_FFFF) {
            return None;
        }
        i += 1;
        if instrs.get(i)?.op != Op::And {
            return None;
        }
        i += 1;
        if !instrs.get(i)?.is_starg() {
            return None;
        }
        i += 1;
        if !instrs.get(i)?.is_ldarg() {
            return None;
        }
        i += 1;
        if instrs.get(i)?.ldc_i4_value() != Some(2) {
            return None;
        }
        i += 1;
        if instrs.get(i)?.op != Op::Shl {
            return None;
        }
        i += 1;
        if !instrs.get(i)?.is_starg() {
            return None;
        }

        for name in STUB_CALLED_NAMES {
            let called = instrs
                .iter()
                .filter_map(Instruction::call_target)
                .any(|m| m.name == name);
            if !called {
                return None;
            }
        }
        Some(())
    }

    /// Derives the pool byte offset for a stub invocation.
    fn calculate_magic(&self, info: &DecrypterInfo, index: u32) -> Result<u32> {
        let mut magic = match &info.derivation {
            Derivation::Native(method) => self.oracle.execute(method, index as i32)? as u32,
            Derivation::Linear { num1, num2 } => index.wrapping_mul(*num1) ^ num2,
        };
        magic &= 0x3FFF_FFFF;
        magic <<= 2;
        Ok(magic)
    }

    fn pool(&self) -> Result<&[u8]> {
        self.decrypted.as_deref().ok_or(Error::OutOfBounds)
    }

    fn read_at(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(Error::OutOfBounds)?;
        self.pool()?.get(start..end).ok_or(Error::OutOfBounds)
    }

    fn read_i32_at(&self, offset: u32) -> Result<i32> {
        let bytes = self.read_at(offset, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decrypts a string constant: a length-prefixed UTF-8 run.
    ///
    /// # Errors
    /// Out-of-range offsets, invalid UTF-8 and oracle failures are fatal to the call.
    pub fn decrypt_string(&self, info: &DecrypterInfo, index: u32) -> Result<String> {
        let offset = self.calculate_magic(info, index)?;
        let count = self.read_i32_at(offset)?;
        let count = usize::try_from(count).map_err(|_| Error::OutOfBounds)?;
        let bytes = self.read_at(offset + 4, count)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::MalformedPattern("constant pool string is not UTF-8".into()))
    }

    /// Decrypts a 32-bit integer constant.
    ///
    /// # Errors
    /// As [`ConstantsDecrypter::decrypt_string`].
    pub fn decrypt_i32(&self, info: &DecrypterInfo, index: u32) -> Result<i32> {
        let offset = self.calculate_magic(info, index)?;
        self.read_i32_at(offset)
    }

    /// Decrypts a 64-bit integer constant.
    ///
    /// # Errors
    /// As [`ConstantsDecrypter::decrypt_string`].
    pub fn decrypt_i64(&self, info: &DecrypterInfo, index: u32) -> Result<i64> {
        let offset = self.calculate_magic(info, index)?;
        let b = self.read_at(offset, 8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Decrypts a 32-bit float constant.
    ///
    /// # Errors
    /// As [`ConstantsDecrypter::decrypt_string`].
    pub fn decrypt_f32(&self, info: &DecrypterInfo, index: u32) -> Result<f32> {
        Ok(f32::from_bits(self.decrypt_i32(info, index)? as u32))
    }

    /// Decrypts a 64-bit float constant.
    ///
    /// # Errors
    /// As [`ConstantsDecrypter::decrypt_string`].
    pub fn decrypt_f64(&self, info: &DecrypterInfo, index: u32) -> Result<f64> {
        Ok(f64::from_bits(self.decrypt_i64(info, index)? as u64))
    }

    /// Decrypts an array constant: a byte count, an element size word, then the data.
    ///
    /// # Errors
    /// As [`ConstantsDecrypter::decrypt_string`].
    pub fn decrypt_array(&self, info: &DecrypterInfo, index: u32) -> Result<Vec<u8>> {
        let offset = self.calculate_magic(info, index)?;
        let count = self.read_i32_at(offset)?;
        let count = usize::try_from(count).map_err(|_| Error::OutOfBounds)?;
        let len = count.checked_sub(4).ok_or(Error::OutOfBounds)?;
        Ok(self.read_at(offset + 8, len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::NativeMethodTable;

    fn method_ref(name: &str, token: u32) -> MethodRef {
        MethodRef {
            token: Token::new(token),
            name: name.into(),
            signature: String::new(),
            is_static: true,
            is_native: false,
            params: 1,
            returns: true,
        }
    }

    fn native_ref(token: u32) -> MethodRef {
        MethodRef {
            token: Token::new(token),
            name: "mix".into(),
            signature: "System.Int32 (System.Int32)".into(),
            is_static: true,
            is_native: true,
            params: 1,
            returns: true,
        }
    }

    /// Scrambles `pool` words under the legacy profile for initializer fixtures.
    fn scramble_legacy(pool_words: &[u32]) -> Vec<u8> {
        let key: Vec<u32> = (0..8).map(|i| 0xA5A5_0000u32 | (i as u32)).collect();
        let mut state = key.clone();
        let mut words = key;
        for block in pool_words.chunks_exact(8) {
            for (j, &word) in block.iter().enumerate() {
                words.push(word ^ state[j]);
                state[j] = {
                    let mut w = state[j];
                    w ^= w << 13;
                    w ^= w >> 7;
                    w ^= w << 17;
                    w
                };
            }
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Pool with "Hi!" at offset 0 and the i32 1234 at offset 8.
    fn test_pool() -> Vec<u8> {
        let mut pool = vec![0u8; 32];
        pool[0..4].copy_from_slice(&3i32.to_le_bytes());
        pool[4..7].copy_from_slice(b"Hi!");
        pool[8..12].copy_from_slice(&1234i32.to_le_bytes());
        pool
    }

    fn initializer_body(lzma: u32, initial: Vec<u8>) -> MethodBody {
        let array_field = FieldRef {
            token: Token::new(0x0400_0001),
            name: "rva".into(),
            initial_value: Some(initial),
        };
        let pool_field = FieldRef {
            token: Token::new(0x0400_0002),
            name: "pool".into(),
            initial_value: None,
        };
        let mut instructions = vec![
            Instruction::ldc_i4(96),
            Instruction::stloc(0),
            Instruction::ldc_i4(96),
            Instruction::with_operand(Op::Newarr, Operand::Str("System.UInt32".into())),
            Instruction::new(Op::Dup),
            Instruction::with_operand(Op::Ldtoken, Operand::Field(array_field)),
            Instruction::call(method_ref("InitializeArray", 0x0A00_0001)),
            Instruction::stloc(1),
        ];
        // filler the shape ignores
        instructions.extend((0..4).map(|_| Instruction::new(Op::Other)));
        instructions.extend([
            Instruction::ldloc(3),
            Instruction::call(method_ref("lzma", lzma)),
            Instruction::with_operand(Op::Stsfld, Operand::Field(pool_field)),
            Instruction::new(Op::Ret),
        ]);
        MethodBody {
            token: Token::new(0x0600_0001),
            instructions,
            locals: 4,
            args: 0,
        }
    }

    /// `arg >> 30` bookkeeping plus masks, shifts and the BCL call set.
    fn stub_tail() -> Vec<Instruction> {
        let mut tail = vec![
            Instruction::ldarg(0),
            Instruction::ldc_i4(0x1E),
            Instruction::new(Op::ShrUn),
            Instruction::stloc(0),
            Instruction::new(Op::Other), // ldloca
            Instruction::new(Op::Other), // initobj
            Instruction::ldarg(0),
            Instruction::ldc_i4(0x3FFF_FFFF),
            Instruction::new(Op::And),
            Instruction::starg(0),
            Instruction::ldarg(0),
            Instruction::ldc_i4(2),
            Instruction::new(Op::Shl),
            Instruction::starg(0),
        ];
        for (i, name) in STUB_CALLED_NAMES.iter().enumerate() {
            tail.push(Instruction::call(method_ref(name, 0x0A00_0100 + i as u32)));
        }
        tail.push(Instruction::new(Op::Ret));
        tail
    }

    fn linear_stub(num1: i32, num2: i32) -> MethodBody {
        let mut instructions = vec![
            Instruction::ldarg(0),
            Instruction::ldc_i4(num1),
            Instruction::new(Op::Mul),
            Instruction::ldc_i4(num2),
            Instruction::new(Op::Xor),
            Instruction::starg(0),
        ];
        instructions.extend(stub_tail());
        MethodBody {
            token: Token::new(0x0600_0002),
            instructions,
            locals: 1,
            args: 1,
        }
    }

    fn native_stub(helper: MethodRef) -> MethodBody {
        let mut instructions = vec![
            Instruction::ldarg(0),
            Instruction::call(helper),
            Instruction::starg(0),
        ];
        instructions.extend(stub_tail());
        MethodBody {
            token: Token::new(0x0600_0003),
            instructions,
            locals: 1,
            args: 1,
        }
    }

    fn identity_decompressor(data: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    #[test]
    fn initializer_and_linear_stub_end_to_end() {
        let lzma = 0x0600_0099;
        let scrambled = scramble_legacy(
            &test_pool()
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<_>>(),
        );
        let oracle = NativeMethodTable::new();
        let mut decrypter = ConstantsDecrypter::new(Token::new(lzma), &oracle);

        decrypter.find(&[initializer_body(lzma, scrambled)], &identity_decompressor);
        decrypter.find_decrypters(&[linear_stub(1, 0)]);
        assert!(decrypter.detected());
        assert_eq!(decrypter.init_method(), Some(Token::new(0x0600_0001)));

        let info = decrypter.decrypters()[0].clone();
        assert_eq!(info.derivation, Derivation::Linear { num1: 1, num2: 0 });
        // index 0 -> offset 0: the string; index 2 -> offset 8: the integer
        assert_eq!(decrypter.decrypt_string(&info, 0).unwrap(), "Hi!");
        assert_eq!(decrypter.decrypt_i32(&info, 2).unwrap(), 1234);
    }

    #[test]
    fn wrong_lzma_target_is_not_an_initializer() {
        let scrambled = scramble_legacy(&[0u32; 8]);
        let oracle = NativeMethodTable::new();
        let mut decrypter = ConstantsDecrypter::new(Token::new(0x0600_0099), &oracle);
        decrypter.find(
            &[initializer_body(0x0600_0098, scrambled)],
            &identity_decompressor,
        );
        assert!(!decrypter.detected());
        assert!(decrypter.init_method().is_none());
    }

    #[test]
    fn native_stub_derivation_uses_oracle() -> crate::Result<()> {
        // Helper computes arg + 2, so index 0 lands on offset (2 << 2) = 8
        let mut code = crate::x86::X86Method::PROLOGUE.to_vec();
        code.extend_from_slice(&[0x58, 0x81, 0xC0, 0x02, 0x00, 0x00, 0x00]);
        code.extend_from_slice(&crate::x86::X86Method::EPILOGUE);
        let helper = native_ref(0x0600_0042);
        let mut oracle = NativeMethodTable::new();
        oracle.insert_code(helper.token, &code)?;

        let lzma = 0x0600_0099;
        let scrambled = scramble_legacy(
            &test_pool()
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<_>>(),
        );
        let mut decrypter = ConstantsDecrypter::new(Token::new(lzma), &oracle);
        decrypter.find(&[initializer_body(lzma, scrambled)], &identity_decompressor);
        decrypter.find_decrypters(&[native_stub(helper.clone())]);

        let info = decrypter.decrypters()[0].clone();
        assert_eq!(info.derivation, Derivation::Native(helper));
        assert_eq!(decrypter.decrypt_i32(&info, 0)?, 1234);
        Ok(())
    }

    #[test]
    fn truncated_pool_reads_fail() {
        let lzma = 0x0600_0099;
        let scrambled = scramble_legacy(
            &test_pool()
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<_>>(),
        );
        let oracle = NativeMethodTable::new();
        let mut decrypter = ConstantsDecrypter::new(Token::new(lzma), &oracle);
        decrypter.find(&[initializer_body(lzma, scrambled)], &identity_decompressor);
        decrypter.find_decrypters(&[linear_stub(1, 0)]);

        let info = decrypter.decrypters()[0].clone();
        // index 1000 maps far past the 32-byte pool
        assert!(matches!(
            decrypter.decrypt_i32(&info, 1000),
            Err(Error::OutOfBounds)
        ));
    }
}
