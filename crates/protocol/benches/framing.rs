//! Benchmarks for bulk stream deframing
//!
//! Measures how fast frames can be pulled out of an in-memory stream at the
//! payload sizes a device typically produces (small control packets up to
//! large key frames).

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{FrameReader, encode_frame, sp};
use std::io::Cursor;

fn build_stream(payload_size: usize, frames: usize) -> Vec<u8> {
    let payload = vec![0xA5; payload_size];
    let mut stream = Vec::with_capacity((payload_size + 4) * frames);
    for _ in 0..frames {
        stream.extend(encode_frame(&payload).unwrap());
    }
    stream
}

fn benchmark_deframing(c: &mut Criterion) {
    let mut group = c.benchmark_group("deframing");

    for size in [64usize, 4096, 65531, 512 * 1024] {
        let frames = 16;
        let stream = build_stream(size, frames);
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &stream, |b, stream| {
            b.iter(|| {
                let mut reader = FrameReader::new(Cursor::new(black_box(stream.as_slice())));
                for _ in 0..frames {
                    black_box(reader.read_frame().unwrap());
                }
            })
        });
    }

    group.finish();
}

fn benchmark_push_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_encoding");

    for size in [64usize, 4096, 65531] {
        let body = vec![0x5A; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| sp::encode_message(black_box(body)))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_deframing, benchmark_push_encoding);
criterion_main!(benches);
