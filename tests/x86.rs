//! Decoder and executor integration tests for the native-helper x86 subset.
//!
//! The sweep test cross-checks the decoder/emulator pair against an independent
//! reference interpreter: deterministic pseudo-random programs are generated in an
//! abstract form, encoded to machine code, decoded back with [`ByteDecoder`] and
//! executed on [`X86Emulator`], then compared register-for-register against direct
//! interpretation of the abstract form.

use unfuser::x86::{ByteDecoder, InstructionDecoder, X86Emulator, X86Method, X86Register};
use unfuser::{Error, Parser};

/// Register-direct ALU operations in the encodable subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alu {
    Add,
    Sub,
    Xor,
    Mov,
    IMul,
}

/// Abstract form of one generated instruction. Register operands are encodings 0..8.
#[derive(Debug, Clone, Copy)]
enum GenInstr {
    MovImm { dst: u8, imm: i32 },
    AluReg { op: Alu, dst: u8, src: u8 },
    AluImm { op: Alu, dst: u8, imm: i32 },
    Neg { dst: u8 },
    Not { dst: u8 },
    Pop { dst: u8 },
}

fn modrm(reg: u8, rm: u8) -> u8 {
    0xC0 | (reg << 3) | rm
}

fn encode(program: &[GenInstr]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for instr in program {
        match *instr {
            GenInstr::MovImm { dst, imm } => {
                bytes.push(0xB8 + dst);
                bytes.extend_from_slice(&imm.to_le_bytes());
            }
            GenInstr::AluReg { op, dst, src } => match op {
                Alu::Add => bytes.extend_from_slice(&[0x01, modrm(src, dst)]),
                Alu::Sub => bytes.extend_from_slice(&[0x29, modrm(src, dst)]),
                Alu::Xor => bytes.extend_from_slice(&[0x31, modrm(src, dst)]),
                Alu::Mov => bytes.extend_from_slice(&[0x89, modrm(src, dst)]),
                Alu::IMul => bytes.extend_from_slice(&[0x0F, 0xAF, modrm(dst, src)]),
            },
            GenInstr::AluImm { op, dst, imm } => {
                match op {
                    Alu::Add => bytes.extend_from_slice(&[0x81, modrm(0, dst)]),
                    Alu::Sub => bytes.extend_from_slice(&[0x81, modrm(5, dst)]),
                    Alu::Xor => bytes.extend_from_slice(&[0x81, modrm(6, dst)]),
                    // imul r, r/m, imm with rm == reg collapses to dst *= imm
                    Alu::IMul | Alu::Mov => bytes.extend_from_slice(&[0x69, modrm(dst, dst)]),
                }
                bytes.extend_from_slice(&imm.to_le_bytes());
            }
            GenInstr::Neg { dst } => bytes.extend_from_slice(&[0xF7, modrm(3, dst)]),
            GenInstr::Not { dst } => bytes.extend_from_slice(&[0xF7, modrm(2, dst)]),
            GenInstr::Pop { dst } => bytes.push(0x58 + dst),
        }
    }
    bytes.push(0xC3);
    bytes
}

/// Direct interpretation of the abstract form, independent of the crate's emulator.
fn reference_execute(program: &[GenInstr], args: &[i32]) -> [i32; 8] {
    let mut regs = [0i32; 8];
    let mut stack: Vec<i32> = args.iter().rev().copied().collect();
    for instr in program {
        match *instr {
            GenInstr::MovImm { dst, imm } => regs[dst as usize] = imm,
            GenInstr::AluReg { op, dst, src } => {
                let (d, s) = (dst as usize, src as usize);
                regs[d] = apply(op, regs[d], regs[s]);
            }
            GenInstr::AluImm { op, dst, imm } => {
                let d = dst as usize;
                regs[d] = apply(op, regs[d], imm);
            }
            GenInstr::Neg { dst } => regs[dst as usize] = regs[dst as usize].wrapping_neg(),
            GenInstr::Not { dst } => regs[dst as usize] = !regs[dst as usize],
            GenInstr::Pop { dst } => {
                regs[dst as usize] = stack.pop().unwrap_or_else(|| panic!("generator overdrew"));
            }
        }
    }
    regs
}

fn apply(op: Alu, dst: i32, src: i32) -> i32 {
    match op {
        Alu::Add => dst.wrapping_add(src),
        Alu::Sub => dst.wrapping_sub(src),
        Alu::Xor => dst ^ src,
        Alu::Mov => src,
        Alu::IMul => dst.wrapping_mul(src),
    }
}

/// Small deterministic generator so failures reproduce byte-for-byte.
struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

fn generate_program(rng: &mut XorShift, max_pops: usize) -> Vec<GenInstr> {
    let alu = [Alu::Add, Alu::Sub, Alu::Xor, Alu::Mov, Alu::IMul];
    let len = 1 + (rng.next() % 10) as usize;
    let mut pops = 0usize;
    let mut program = Vec::with_capacity(len);
    for _ in 0..len {
        let dst = (rng.next() % 8) as u8;
        let instr = match rng.next() % 6 {
            0 => GenInstr::MovImm { dst, imm: rng.next() as i32 },
            1 => GenInstr::AluReg {
                op: alu[(rng.next() % 5) as usize],
                dst,
                src: (rng.next() % 8) as u8,
            },
            2 => GenInstr::AluImm {
                // register-to-register mov has no group-1 immediate form
                op: [Alu::Add, Alu::Sub, Alu::Xor, Alu::IMul][(rng.next() % 4) as usize],
                dst,
                imm: rng.next() as i32,
            },
            3 => GenInstr::Neg { dst },
            4 => GenInstr::Not { dst },
            _ if pops < max_pops => {
                pops += 1;
                GenInstr::Pop { dst }
            }
            _ => GenInstr::MovImm { dst, imm: 1 },
        };
        program.push(instr);
    }
    program
}

#[test]
fn decoder_and_emulator_match_reference_interpreter() -> unfuser::Result<()> {
    let args = [0x1357_9BDF, -42, 7];
    let mut rng = XorShift(0xDEAD_BEEF);

    for round in 0..256 {
        let program = generate_program(&mut rng, args.len());
        let bytes = encode(&program);

        let mut parser = Parser::new(&bytes);
        let decoded = ByteDecoder::new().decode_until_ret(&mut parser)?;
        assert_eq!(decoded.len(), program.len(), "round {round}: {program:?}");
        assert!(!parser.has_more_data(), "round {round}: trailing bytes");

        let mut emulator = X86Emulator::new(&args);
        emulator.execute(&decoded)?;

        let expected = reference_execute(&program, &args);
        for (i, register) in [
            X86Register::Eax,
            X86Register::Ecx,
            X86Register::Edx,
            X86Register::Ebx,
            X86Register::Esp,
            X86Register::Ebp,
            X86Register::Esi,
            X86Register::Edi,
        ]
        .into_iter()
        .enumerate()
        {
            assert_eq!(
                emulator.reg(register),
                expected[i],
                "round {round}, register {register}: {program:?}"
            );
        }
    }
    Ok(())
}

#[test]
fn arguments_pop_in_call_order() -> unfuser::Result<()> {
    // pop eax; pop ecx; pop edx; sub eax, ecx; imul eax, edx -> (a - b) * c
    let mut code = X86Method::PROLOGUE.to_vec();
    code.extend_from_slice(&[0x58, 0x59, 0x5A, 0x29, 0xC8, 0x0F, 0xAF, 0xC2]);
    code.extend_from_slice(&X86Method::EPILOGUE);

    let method = X86Method::parse(&code)?;
    assert_eq!(method.execute(&[10, 4, 3])?, 18);
    assert_eq!(method.execute(&[4, 10, -1])?, 6);
    Ok(())
}

#[test]
fn memory_operands_always_fail_to_decode() {
    // Every ModRM-carrying opcode in the subset, with every non-register-direct mod
    for prefix in [
        vec![0x01u8],
        vec![0x29],
        vec![0x31],
        vec![0x89],
        vec![0x0F, 0xAF],
        vec![0x81],
        vec![0xF7],
        vec![0x69],
    ] {
        for modrm_byte in 0u8..=0xFF {
            if (modrm_byte >> 6) == 0b11 {
                continue;
            }
            let mut bytes = prefix.clone();
            bytes.push(modrm_byte);
            // enough trailing bytes for any displacement/immediate the form could want
            bytes.extend_from_slice(&[0u8; 8]);
            let result = ByteDecoder::new().decode(&mut Parser::new(&bytes));
            assert!(
                matches!(result, Err(Error::MemoryOperand { offset: 0 })),
                "prefix {prefix:?}, modrm {modrm_byte:#04x}: {result:?}"
            );
        }
    }
}

#[test]
fn helper_frame_is_mandatory() {
    // Missing prologue
    assert!(matches!(
        X86Method::parse(&[0x58, 0xC3]),
        Err(Error::UnsupportedPrologue)
    ));
    // Prologue with one flipped byte
    let mut code = X86Method::PROLOGUE.to_vec();
    code[3] ^= 0xFF;
    code.extend_from_slice(&[0x58, 0xC3]);
    assert!(matches!(
        X86Method::parse(&code),
        Err(Error::UnsupportedPrologue)
    ));
}

#[test]
fn execution_is_repeatable_across_calls() -> unfuser::Result<()> {
    // pop eax; xor eax, 0x55AA
    let mut code = X86Method::PROLOGUE.to_vec();
    code.extend_from_slice(&[0x58, 0x81, 0xF0, 0xAA, 0x55, 0x00, 0x00]);
    code.extend_from_slice(&X86Method::EPILOGUE);
    let method = X86Method::parse(&code)?;

    for value in [-3, 0, 1, 0x55AA, i32::MIN, i32::MAX] {
        assert_eq!(method.execute(&[value])?, value ^ 0x55AA);
        assert_eq!(method.execute(&[value])?, value ^ 0x55AA);
    }
    Ok(())
}
