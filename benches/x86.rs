//! Benchmarks for native-helper decoding and execution.
//!
//! Measures the two hot paths of key derivation: parsing a helper body out of its
//! machine-code frame, and repeated execution of an already-parsed helper (the shape
//! the switch and constants passes hit once per dispatch key).

extern crate unfuser;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use unfuser::x86::{ByteDecoder, InstructionDecoder, X86Method};
use unfuser::Parser;

/// A helper body mixing the argument through every supported operation form.
fn helper_code() -> Vec<u8> {
    let mut code = X86Method::PROLOGUE.to_vec();
    // pop eax; mov ecx, 0x1337; xor eax, ecx; imul eax, 0x2B; add eax, 0x0F0F;
    // neg eax; not eax; sub eax, ecx
    code.extend_from_slice(&[0x58]);
    code.extend_from_slice(&[0xB9, 0x37, 0x13, 0x00, 0x00]);
    code.extend_from_slice(&[0x31, 0xC8]);
    code.extend_from_slice(&[0x69, 0xC0, 0x2B, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0x81, 0xC0, 0x0F, 0x0F, 0x00, 0x00]);
    code.extend_from_slice(&[0xF7, 0xD8]);
    code.extend_from_slice(&[0xF7, 0xD0]);
    code.extend_from_slice(&[0x29, 0xC8]);
    code.extend_from_slice(&X86Method::EPILOGUE);
    code
}

fn bench_parse(c: &mut Criterion) {
    let code = helper_code();

    let mut group = c.benchmark_group("x86_parse");
    group.throughput(Throughput::Bytes(code.len() as u64));
    group.bench_function("parse_helper", |b| {
        b.iter(|| {
            let method = X86Method::parse(black_box(&code)).unwrap();
            black_box(method)
        });
    });
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    // A long flat stream of the body repeated, ending in one ret
    let body = &helper_code()[X86Method::PROLOGUE.len()..];
    let body = &body[..body.len() - X86Method::EPILOGUE.len()];
    let mut stream = Vec::new();
    for _ in 0..256 {
        stream.extend_from_slice(body);
    }
    stream.push(0xC3);

    let mut group = c.benchmark_group("x86_decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_until_ret", |b| {
        b.iter(|| {
            let mut parser = Parser::new(black_box(&stream));
            let decoded = ByteDecoder::new().decode_until_ret(&mut parser).unwrap();
            black_box(decoded)
        });
    });
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let method = X86Method::parse(&helper_code()).unwrap();

    let mut group = c.benchmark_group("x86_execute");
    group.bench_function("execute_helper", |b| {
        let mut arg = 0x1234_5678;
        b.iter(|| {
            arg = method.execute(black_box(&[arg])).unwrap();
            black_box(arg)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_decode_stream, bench_execute);
criterion_main!(benches);
