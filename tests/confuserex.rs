//! End-to-end pass pipeline tests.
//!
//! These build obfuscated method shapes the way the protector emits them - a natively
//! dispatched flattened method and an encrypted constant pool with its decrypter stubs -
//! and run the public pass API against a shared native-helper table, verifying both the
//! rewrites and the recorded event trail.

use unfuser::blocks::{Block, MethodBlocks};
use unfuser::cil::{FieldRef, Instruction, MethodBody, MethodRef, Op, Operand};
use unfuser::passes::constants::{ConstantsDecrypter, Derivation};
use unfuser::passes::switches::ControlFlowFixer;
use unfuser::passes::{EventKind, EventLog, NativeMethodTable};
use unfuser::x86::X86Method;
use unfuser::{Result, Token};

const MIX_TOKEN: u32 = 0x0600_0042;

/// Registers the helper `arg ^ 0x55` under [`MIX_TOKEN`].
fn mix_oracle() -> Result<NativeMethodTable> {
    // pop eax; xor eax, 0x55
    let mut code = X86Method::PROLOGUE.to_vec();
    code.extend_from_slice(&[0x58, 0x81, 0xF0, 0x55, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&X86Method::EPILOGUE);
    let mut table = NativeMethodTable::new();
    table.insert_code(Token::new(MIX_TOKEN), &code)?;
    Ok(table)
}

fn mix_ref() -> MethodRef {
    MethodRef {
        token: Token::new(MIX_TOKEN),
        name: "mix".into(),
        signature: "System.Int32 (System.Int32)".into(),
        is_static: true,
        is_native: true,
        params: 1,
        returns: true,
    }
}

fn static_call(name: &str, token: u32) -> MethodRef {
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

#[test]
fn natively_dispatched_method_unflattens() -> Result<()> {
    // Three case blocks feed a dispatcher that mixes the raw value through the native
    // helper and switches on key % 3:
    //   value 0x54 -> key 1, value 0x57 -> key 2, value 0x55 -> key 0
    let cases = [0x54, 0x57, 0x55].map(|v| Block::with_fallthrough(vec![Instruction::ldc_i4(v)], 3));
    let mut dispatcher = Block::new(vec![
        Instruction::call(mix_ref()),
        Instruction::new(Op::Dup),
        Instruction::stloc(0),
        Instruction::ldc_i4(3),
        Instruction::new(Op::RemUn),
        Instruction::new(Op::Switch),
    ]);
    dispatcher.targets = vec![4, 5, 6];

    let mut all: Vec<Block> = cases.into_iter().collect();
    all.push(dispatcher);
    all.extend((0..3).map(|_| Block::new(vec![Instruction::new(Op::Ret)])));
    let mut blocks = MethodBlocks::new(all, 1, 0);

    let oracle = mix_oracle()?;
    let mut fixer = ControlFlowFixer::new(&oracle);
    assert!(fixer.deobfuscate(&mut blocks));

    assert_eq!(blocks.blocks[0].fallthrough, Some(5));
    assert_eq!(blocks.blocks[1].fallthrough, Some(6));
    assert_eq!(blocks.blocks[2].fallthrough, Some(4));
    for case in 0..3 {
        assert!(blocks.blocks[case].processed);
        assert_eq!(blocks.blocks[case].last_instr().map(|i| i.op), Some(Op::Br));
    }
    // The discovered helper is reported exactly once for host-side removal
    assert_eq!(fixer.native_methods(), &[Token::new(MIX_TOKEN)]);
    let resolved = fixer
        .events()
        .iter()
        .filter(|e| matches!(e, EventKind::SwitchResolved { .. }))
        .count();
    assert_eq!(resolved, 3);
    Ok(())
}

/// Builds the scrambled RVA blob for `pool`, legacy keystream generation.
fn scramble(pool: &[u8]) -> Vec<u8> {
    let key: Vec<u32> = (0..8).map(|i| 0xC0FF_EE00u32 | i).collect();
    let mut state = key.clone();
    let mut words = key;
    for chunk in pool.chunks_exact(4) {
        let j = (words.len() - 8) % 8;
        words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ state[j]);
        state[j] = {
            let mut w = state[j];
            w ^= w << 13;
            w ^= w >> 7;
            w ^= w << 17;
            w
        };
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn initializer(lzma_token: u32, blob: Vec<u8>) -> MethodBody {
    let rva_field = FieldRef {
        token: Token::new(0x0400_0001),
        name: "data".into(),
        initial_value: Some(blob),
    };
    let pool_field = FieldRef {
        token: Token::new(0x0400_0002),
        name: "pool".into(),
        initial_value: None,
    };
    let mut instructions = vec![
        Instruction::ldc_i4(40),
        Instruction::stloc(0),
        Instruction::ldc_i4(40),
        Instruction::with_operand(Op::Newarr, Operand::Str("System.UInt32".into())),
        Instruction::new(Op::Dup),
        Instruction::with_operand(Op::Ldtoken, Operand::Field(rva_field)),
        Instruction::call(static_call("InitializeArray", 0x0A00_0001)),
        Instruction::stloc(1),
    ];
    instructions.extend((0..4).map(|_| Instruction::new(Op::Other)));
    instructions.extend([
        Instruction::ldloc(3),
        Instruction::call(static_call("lzma", lzma_token)),
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

/// A native decrypter stub: `arg = mix(arg)` then the common masking tail.
fn native_stub() -> MethodBody {
    let mut instructions = vec![
        Instruction::ldarg(0),
        Instruction::call(mix_ref()),
        Instruction::starg(0),
        Instruction::ldarg(0),
        Instruction::ldc_i4(0x1E),
        Instruction::new(Op::ShrUn),
        Instruction::stloc(0),
        Instruction::new(Op::Other),
        Instruction::new(Op::Other),
        Instruction::ldarg(0),
        Instruction::ldc_i4(0x3FFF_FFFF),
        Instruction::new(Op::And),
        Instruction::starg(0),
        Instruction::ldarg(0),
        Instruction::ldc_i4(2),
        Instruction::new(Op::Shl),
        Instruction::starg(0),
    ];
    for (i, name) in [
        "get_UTF8",
        "GetString",
        "CreateInstance",
        "Intern",
        "BlockCopy",
        "GetTypeFromHandle",
        "GetElementType",
    ]
    .iter()
    .enumerate()
    {
        instructions.push(Instruction::call(static_call(name, 0x0A00_0100 + i as u32)));
    }
    instructions.push(Instruction::new(Op::Ret));
    MethodBody {
        token: Token::new(0x0600_0002),
        instructions,
        locals: 1,
        args: 1,
    }
}

fn stored_plain(data: &[u8]) -> Result<Vec<u8>> {
    Ok(data.to_vec())
}

#[test]
fn constant_pool_recovers_through_native_stub() -> Result<()> {
    // Pool: string "ok" at offset 0, i32 -7 at offset 8
    let mut pool = vec![0u8; 32];
    pool[0..4].copy_from_slice(&2i32.to_le_bytes());
    pool[4..6].copy_from_slice(b"ok");
    pool[8..12].copy_from_slice(&(-7i32).to_le_bytes());

    let lzma_token = 0x0600_0099;
    let oracle = mix_oracle()?;
    let mut decrypter = ConstantsDecrypter::new(Token::new(lzma_token), &oracle);
    decrypter.find(&[initializer(lzma_token, scramble(&pool))], &stored_plain);
    decrypter.find_decrypters(&[native_stub()]);
    assert!(decrypter.detected());

    let info = decrypter.decrypters()[0].clone();
    assert_eq!(info.derivation, Derivation::Native(mix_ref()));

    // mix(0x55) = 0 -> offset 0; mix(0x57) = 2 -> offset 8
    assert_eq!(decrypter.decrypt_string(&info, 0x55)?, "ok");
    assert_eq!(decrypter.decrypt_i32(&info, 0x57)?, -7);

    let mut audit = EventLog::new();
    audit.merge(decrypter.events().clone());
    assert!(audit
        .iter()
        .any(|e| matches!(e, EventKind::ConstantPoolRecovered { size: 32, .. })));
    assert!(audit
        .iter()
        .any(|e| matches!(e, EventKind::DecrypterFound { native: true, .. })));
    Ok(())
}
