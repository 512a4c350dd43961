//! Frame codec benchmark suite.
//!
//! Measures the hot paths a transport driver hits per frame:
//! - encode (masked and unmasked) across payload length encodings
//! - streaming decode of masked frames
//! - raw XOR masking throughput
//! - accept-key derivation (handshake, once per connection)

#![allow(missing_docs)]

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ws_engine::frame::{Frame, FrameCodec, Role, apply_mask};
use ws_engine::handshake::compute_accept_key;

const SIZES: &[usize] = &[16, 125, 1024, 65536];

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for &len in SIZES {
        group.throughput(Throughput::Bytes(len as u64));
        let data = payload(len);

        group.bench_with_input(BenchmarkId::new("masked", len), &data, |b, data| {
            let mut codec = FrameCodec::new(Role::Client, usize::MAX);
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(len + 14);
                codec
                    .encode(&Frame::binary(data.clone()), &mut buf)
                    .unwrap();
                black_box(buf);
            });
        });

        group.bench_with_input(BenchmarkId::new("unmasked", len), &data, |b, data| {
            let mut codec = FrameCodec::new(Role::Server, usize::MAX);
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(len + 10);
                codec
                    .encode(&Frame::binary(data.clone()), &mut buf)
                    .unwrap();
                black_box(buf);
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for &len in SIZES {
        group.throughput(Throughput::Bytes(len as u64));

        let mut encoder = FrameCodec::new(Role::Client, usize::MAX);
        let mut wire = BytesMut::new();
        encoder
            .encode(&Frame::binary(payload(len)), &mut wire)
            .unwrap();
        let wire = wire.freeze();

        group.bench_with_input(BenchmarkId::new("masked", len), &wire, |b, wire| {
            let mut codec = FrameCodec::new(Role::Server, usize::MAX);
            b.iter(|| {
                let mut buf = BytesMut::from(wire.as_ref());
                let frame = codec.decode(&mut buf).unwrap().unwrap();
                black_box(frame);
            });
        });
    }
    group.finish();
}

fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_mask");
    for &len in SIZES {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let mut data = payload(len);
            b.iter(|| {
                apply_mask(black_box(&mut data), [0x37, 0xFA, 0x21, 0x3D]);
            });
        });
    }
    group.finish();
}

fn bench_accept_key(c: &mut Criterion) {
    c.bench_function("compute_accept_key", |b| {
        b.iter(|| black_box(compute_accept_key(black_box("dGhlIHNhbXBsZSBub25jZQ=="))));
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_masking,
    bench_accept_key
);
criterion_main!(benches);
