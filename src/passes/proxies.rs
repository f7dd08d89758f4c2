//! Delegate-proxy call resolution.
//!
//! Proxied call sites go through delegate fields whose real targets are computed at
//! runtime by a create-method: the module cctor registers each delegate field together
//! with a salt byte, and the create-method derives the callee token from the field's
//! signature blob via reflection lookups, arithmetic and sometimes a native helper.
//!
//! Rather than modeling the reflection API, the resolver rewrites the handful of
//! reflection call patterns in a copy of the create-method into the constants they
//! would produce for a given field, then replays the token computation on the CIL
//! emulator. The call opcode at the site is recovered from the salt byte and a
//! character constant embedded in the create-method.

use std::collections::HashMap;

use crate::cil::{
    FieldRef, Instruction, InstructionEmulator, MethodBody, MethodContext, MethodRef, Op, Operand,
};
use crate::passes::{EventKind, EventLog, NativeOracle};
use crate::token::Token;
use crate::{Error, Result};

/// Metadata lookups the resolver needs from the host module.
pub trait ProxyMetadata {
    /// Raw signature blob of the delegate field.
    ///
    /// # Errors
    /// Fails when the field has no resolvable signature.
    fn signature_blob(&self, field: Token) -> Result<Vec<u8>>;

    /// Token of the optional custom modifier on the delegate field's type.
    ///
    /// The create-method reads this token back through
    /// `GetOptionalCustomModifiers()[0].MetadataToken`; the resolver inlines it as a
    /// constant before replaying the computation.
    ///
    /// # Errors
    /// Fails when the field's type carries no optional modifier.
    fn modifier_token(&self, field: Token) -> Result<Token>;

    /// Resolves a member token produced by the emulation to a method reference.
    ///
    /// # Errors
    /// Fails when the token does not name a method.
    fn resolve_method(&self, token: Token) -> Result<MethodRef>;

    /// Body of a method, for the create-method and delegate cctors.
    fn method_body(&self, method: Token) -> Option<MethodBody>;

    /// The create-method's marker attribute: its constructor body and the first
    /// constructor argument, when present.
    fn attribute_ctor(&self, create_method: Token) -> Option<(MethodBody, i32)>;
}

/// One registered delegate field: its salt byte and the create-method that derives
/// its target.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// The salt byte passed alongside the field registration.
    pub byte_num: i32,
    /// The registered create-method.
    pub create_method: MethodRef,
}

/// A resolved proxy call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCall {
    /// The real callee.
    pub target: MethodRef,
    /// The call form the rewritten site must use.
    pub call_op: Op,
}

/// Resolves delegate-proxied call sites to their real targets.
pub struct ProxyCallFixer<'a> {
    metadata: &'a dyn ProxyMetadata,
    oracle: &'a dyn NativeOracle,
    contexts: HashMap<Token, ProxyContext>,
    events: EventLog,
}

impl<'a> ProxyCallFixer<'a> {
    /// Creates a resolver over the host's metadata and native-helper table.
    #[must_use]
    pub fn new(metadata: &'a dyn ProxyMetadata, oracle: &'a dyn NativeOracle) -> Self {
        ProxyCallFixer {
            metadata,
            oracle,
            contexts: HashMap::new(),
            events: EventLog::new(),
        }
    }

    /// Registered field contexts, keyed by field token.
    #[must_use]
    pub fn contexts(&self) -> &HashMap<Token, ProxyContext> {
        &self.contexts
    }

    /// Outcomes recorded so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Scans a cctor for field registrations.
    ///
    /// Each registration is the triple `ldtoken field; ldc.i4 salt; call create`.
    pub fn find_contexts(&mut self, cctor: &MethodBody) {
        let instrs = &cctor.instructions;
        for i in 0..instrs.len().saturating_sub(2) {
            if instrs[i].op != Op::Ldtoken {
                continue;
            }
            let Some(field) = instrs[i].field() else {
                continue;
            };
            let Some(byte_num) = instrs[i + 1].ldc_i4_value() else {
                continue;
            };
            let Some(create) = instrs[i + 2].call_target() else {
                continue;
            };
            self.contexts.insert(
                field.token,
                ProxyContext {
                    byte_num,
                    create_method: create.clone(),
                },
            );
        }
    }

    /// Resolves one delegate field to its real call target, recording the outcome.
    ///
    /// # Errors
    /// Fails when the field was never registered, the create-method body cannot be
    /// replayed to a known token, or the opcode byte is not a recognized call form.
    pub fn resolve(&mut self, field: &FieldRef) -> Result<ProxyCall> {
        match self.try_resolve(field) {
            Ok(call) => {
                self.events.record(EventKind::ProxyResolved {
                    field: field.token,
                    target: call.target.token,
                });
                Ok(call)
            }
            Err(e) => {
                self.events.record(EventKind::ProxySkipped { field: field.token });
                Err(e)
            }
        }
    }

    fn try_resolve(&self, field: &FieldRef) -> Result<ProxyCall> {
        let context = self.contexts.get(&field.token).ok_or_else(|| {
            Error::MalformedPattern(format!("no proxy registration for field {}", field.token))
        })?;
        let body = self
            .metadata
            .method_body(context.create_method.token)
            .ok_or_else(|| {
                Error::MalformedPattern("create-method body is not available".into())
            })?;

        let sig = self.metadata.signature_blob(field.token)?;
        let extra_token = extra_data_token(&sig)?;
        let modifier = self.metadata.modifier_token(field.token)?;

        let mut instrs = body.instructions.clone();
        replace_metadata_token(&mut instrs, modifier.value() as i32);
        replace_field_name_chars(&mut instrs, &field.name);
        inline_arrays(&mut instrs, &extra_token.to_le_bytes());
        remove_decrementor_block(&mut instrs);

        let window = find_emulation_window(&instrs)?;
        let mut emulator = InstructionEmulator::new();
        let ctx = MethodContext::new(body.locals, body.args);
        emulator.initialize(&ctx, false);
        emulator.set_arg(1, crate::cil::EmValue::known(context.byte_num));
        emulator.emulate(&instrs, window.start, window.end)?;
        let mut token_value = emulator
            .pop()
            .as_known_i32()
            .ok_or(Error::UnknownValue)?;

        if let Some(native) = &window.native {
            token_value = self.oracle.execute(native, token_value)?;
        }
        if let Some((ctor, first_arg)) = self.metadata.attribute_ctor(context.create_method.token)
        {
            token_value = token_value.wrapping_mul(attribute_magic(&ctor, first_arg)?);
        }

        let target = self.metadata.resolve_method(Token::new(token_value as u32))?;
        // The substitutions are length-preserving; the salt XOR pattern survives in
        // the rewritten copy at its original offsets.
        let call_op = call_op_for(&target, &instrs, context.byte_num)?;
        Ok(ProxyCall { target, call_op })
    }
}

/// Extracts the extra-data token hidden in a delegate field's signature blob.
///
/// The four token bytes sit at the blob's tail with one decoy byte spliced in:
/// positions `len-5` and `len-3..len`, stored reversed.
///
/// # Errors
/// [`Error::MalformedPattern`] when the blob is too short to carry the token.
pub fn extra_data_token(sig: &[u8]) -> Result<u32> {
    let l = sig.len();
    if l < 5 {
        return Err(Error::MalformedPattern(
            "signature blob too short for an embedded token".into(),
        ));
    }
    let bytes = [sig[l - 1], sig[l - 2], sig[l - 3], sig[l - 5]];
    Ok(u32::from_le_bytes(bytes))
}

fn callvirt_named(instr: &Instruction, name: &str) -> bool {
    instr.op == Op::Callvirt
        && matches!(&instr.operand, Operand::Method(m) if m.name == name)
}

/// `field.GetOptionalCustomModifiers()[0].MetadataToken` becomes `ldc.i4 token`.
fn replace_metadata_token(instrs: &mut [Instruction], token: i32) {
    for i in 0..instrs.len().saturating_sub(4) {
        if instrs[i].is_ldloc()
            && callvirt_named(&instrs[i + 1], "GetOptionalCustomModifiers")
            && instrs[i + 2].ldc_i4_value() == Some(0)
            && callvirt_named(&instrs[i + 4], "get_MetadataToken")
        {
            instrs[i] = Instruction::ldc_i4(token);
            for slot in &mut instrs[i + 1..i + 5] {
                *slot = Instruction::new(Op::Nop);
            }
            return;
        }
    }
}

/// Every `field.Name[k]` lookup becomes `ldc.i4` of that character.
fn replace_field_name_chars(instrs: &mut [Instruction], field_name: &str) {
    let chars: Vec<char> = field_name.chars().collect();
    for i in 0..instrs.len().saturating_sub(3) {
        if instrs[i].is_ldloc()
            && callvirt_named(&instrs[i + 1], "get_Name")
            && instrs[i + 2].is_ldc_i4()
            && callvirt_named(&instrs[i + 3], "get_Chars")
        {
            let Some(idx) = instrs[i + 2].ldc_i4_value().and_then(|v| usize::try_from(v).ok())
            else {
                continue;
            };
            let Some(&c) = chars.get(idx) else {
                continue;
            };
            instrs[i] = Instruction::ldc_i4(c as i32);
            for slot in &mut instrs[i + 1..i + 4] {
                *slot = Instruction::new(Op::Nop);
            }
        }
    }
}

/// Each post-decrement byte-array read becomes `ldc.i4` of the next token byte.
///
/// The create-method reads at most four bytes this way, in the order `values` lists
/// them.
fn inline_arrays(instrs: &mut [Instruction], values: &[u8]) {
    let mut next = 0usize;
    for i in 0..instrs.len().saturating_sub(6) {
        if next >= values.len() {
            break;
        }
        if instrs[i].is_ldloc()
            && instrs[i + 1].is_ldloc()
            && instrs[i + 2].ldc_i4_value() == Some(1)
            && instrs[i + 3].op == Op::Sub
            && instrs[i + 4].op == Op::Dup
            && instrs[i + 5].is_stloc()
            && instrs[i + 6].op == Op::LdelemU1
        {
            instrs[i] = Instruction::ldc_i4(i32::from(values[next]));
            next += 1;
            for slot in &mut instrs[i + 1..i + 7] {
                *slot = Instruction::new(Op::Nop);
            }
        }
    }
}

/// A bare `int = int - 1` counter update is dead once the array reads are inlined.
fn remove_decrementor_block(instrs: &mut [Instruction]) {
    for i in 0..instrs.len().saturating_sub(3) {
        if instrs[i].is_ldloc()
            && instrs[i + 1].ldc_i4_value() == Some(1)
            && instrs[i + 2].op == Op::Sub
            && instrs[i + 3].is_stloc()
        {
            for slot in &mut instrs[i..i + 4] {
                *slot = Instruction::new(Op::Nop);
            }
            return;
        }
    }
}

struct EmulationWindow {
    start: usize,
    end: usize,
    native: Option<MethodRef>,
}

/// The token computation spans from just past the signature-array setup to just
/// before the attribute lookup.
fn find_emulation_window(instrs: &[Instruction]) -> Result<EmulationWindow> {
    let setup = instrs
        .windows(6)
        .position(|w| {
            callvirt_named(&w[0], "ResolveSignature")
                && w[1].is_stloc()
                && w[2].is_ldloc()
                && w[3].op == Op::Ldlen
                && w[4].op == Op::ConvI4
                && w[5].is_stloc()
        })
        .ok_or_else(|| {
            Error::MalformedPattern("signature-array setup not found in create-method".into())
        })?;
    let start = setup + 6;

    let attr_lookup = instrs
        .iter()
        .position(|i| callvirt_named(i, "GetCustomAttributes"))
        .ok_or_else(|| {
            Error::MalformedPattern("attribute lookup not found in create-method".into())
        })?;
    let mut end = attr_lookup
        .checked_sub(4)
        .filter(|e| *e > start)
        .ok_or_else(|| Error::MalformedPattern("create-method token window is empty".into()))?;

    // A trailing call through the embedded native helper marks the native variant;
    // it runs outside the CIL emulation.
    let mut native = None;
    if let Some(method) = instrs[end - 1].call_target() {
        if instrs[end - 1].op == Op::Call && method.is_native {
            native = Some(method.clone());
            end -= 1;
        }
    }
    Ok(EmulationWindow { start, end, native })
}

/// Replays an attribute constructor to its stored multiplier.
fn attribute_magic(ctor: &MethodBody, first_arg: i32) -> Result<i32> {
    let len = ctor.instructions.len();
    if len < 5 {
        return Err(Error::MalformedPattern(
            "attribute constructor body too short".into(),
        ));
    }
    let mut emulator = InstructionEmulator::new();
    let ctx = MethodContext::new(ctor.locals, ctor.args);
    emulator.initialize(&ctx, false);
    emulator.set_arg(1, crate::cil::EmValue::known(first_arg));
    emulator.emulate(&ctor.instructions, 3, len - 2)?;
    emulator.pop().as_known_i32().ok_or(Error::UnknownValue)
}

/// Derives the call form for the rewritten site.
///
/// Static targets always use `call`; instance targets recover the form from the
/// character constant XORed with the salt byte.
fn call_op_for(target: &MethodRef, create_body: &[Instruction], byte_num: i32) -> Result<Op> {
    if target.is_static {
        return Ok(Op::Call);
    }
    let char_num = find_char_num(create_body)?;
    match ((char_num ^ byte_num) & 0xFF) as u8 {
        0x28 => Ok(Op::Call),
        0x6F => Ok(Op::Callvirt),
        0x73 => Ok(Op::Newobj),
        other => Err(Error::MalformedPattern(format!(
            "unrecognized call opcode byte {other:#04x}"
        ))),
    }
}

/// The character constant feeding the opcode XOR: the `ldc.i4` five slots before the
/// `ldarg salt; xor` pair.
fn find_char_num(instrs: &[Instruction]) -> Result<i32> {
    for i in 5..instrs.len().saturating_sub(1) {
        if instrs[i].arg_index() == Some(1)
            && instrs[i].is_ldarg()
            && instrs[i + 1].op == Op::Xor
        {
            return instrs[i - 5]
                .ldc_i4_value()
                .ok_or_else(|| {
                    Error::MalformedPattern("opcode character constant not found".into())
                });
        }
    }
    Err(Error::MalformedPattern(
        "salt XOR pattern not found in create-method".into(),
    ))
}
