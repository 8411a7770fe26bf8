// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{Criterion, criterion_group, criterion_main};
use mp4decode::testutil::{ReorderingLibrary, synthetic_stream};
use mp4decode::{SampleSource, Session, reframe};

/// A 1 MiB access unit made of 1,000-byte slice NAL units.
fn many_nals() -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 << 20);
    while buf.len() + 1_004 <= 1 << 20 {
        buf.extend_from_slice(&1_000u32.to_be_bytes());
        buf.push(0x41);
        buf.extend(std::iter::repeat_n(0x9a, 999));
    }
    buf
}

fn read_all(lib: &ReorderingLibrary) {
    let mut session = Session::open(synthetic_stream(900, 30), lib).unwrap();
    session.initialize().unwrap();
    while session.read_next_frame().unwrap().is_some() {}
}

fn criterion_benchmark(c: &mut Criterion) {
    let original = many_nals();
    let mut buf = original.clone();
    let mut g = c.benchmark_group("reframe");
    g.throughput(criterion::Throughput::Bytes(
        u64::try_from(original.len()).unwrap(),
    ))
    .bench_function("to_annex_b", |b| {
        b.iter(|| {
            buf.copy_from_slice(&original);
            reframe::to_annex_b(&mut buf, reframe::SUPPORTED_LENGTH_SIZE).unwrap();
        })
    });
    g.finish();

    let lib = ReorderingLibrary::new(2);
    let samples = synthetic_stream(900, 30).info().samples;
    let mut g = c.benchmark_group("session");
    g.throughput(criterion::Throughput::Elements(samples))
        .bench_function("read_all", |b| b.iter(|| read_all(&lib)));
    g.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
