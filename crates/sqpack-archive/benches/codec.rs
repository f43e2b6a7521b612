//! Packed entry codec benchmarks.
//!
//! Measures eager and lazy encoding of a binary entry, and partial reads
//! through the unpacking stream.
//!
//! Run with:
//! ```bash
//! cargo bench --bench codec
//! ```

#![allow(clippy::expect_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sqpack_archive::{GeneratorConfig, ReaderConfig, SqPackReader, VirtualSqPack};
use sqpack_formats::{
    EncodeKind, MemoryStream, PackedFileStream, RandomAccessStream, SharedStream, UnpackingStream,
};
use std::hint::black_box;
use std::sync::Arc;

/// Half runs, half noise, so blocks both compress and get stored
fn sample(len: usize) -> Vec<u8> {
    (0..len as u32)
        .map(|i| {
            if (i / 8192) % 2 == 0 {
                (i % 31) as u8
            } else {
                (i.wrapping_mul(2_654_435_761) >> 13) as u8
            }
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [64 * 1024usize, 1024 * 1024] {
        let source = MemoryStream::shared(sample(size));
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("eager", size), &source, |b, source| {
            b.iter(|| {
                let packed =
                    PackedFileStream::encode(Arc::clone(source), EncodeKind::Binary, 6, false)
                        .expect("Failed to encode entry");
                black_box(packed.size())
            });
        });

        group.bench_with_input(BenchmarkId::new("lazy_full_read", size), &source, |b, source| {
            b.iter(|| {
                let packed =
                    PackedFileStream::encode(Arc::clone(source), EncodeKind::Binary, 6, true)
                        .expect("Failed to plan entry");
                black_box(packed.read_all().expect("Failed to read lazy entry"))
            });
        });
    }
    group.finish();
}

fn bench_partial_decode(c: &mut Criterion) {
    let data = sample(1024 * 1024);
    let packed: SharedStream = Arc::new(
        PackedFileStream::encode(MemoryStream::shared(data), EncodeKind::Binary, 6, false)
            .expect("Failed to encode entry"),
    );
    let stream = UnpackingStream::new(packed).expect("Failed to open entry");

    let mut group = c.benchmark_group("partial_decode");
    for len in [256usize, 4096, 64 * 1024] {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let mut buf = vec![0u8; len];
            let mut offset = 0u64;
            b.iter(|| {
                offset = (offset + 40_009) % (stream.size() - len as u64);
                black_box(stream.read_at(offset, &mut buf).expect("Failed to read entry"))
            });
        });
    }
    group.finish();
}

fn bench_frozen_lookup(c: &mut Criterion) {
    let mut pack = VirtualSqPack::new(GeneratorConfig::default());
    for i in 0..2000 {
        pack.add_raw(
            &format!("bench/dir{}/file{i}.bin", i % 40),
            MemoryStream::shared(vec![i as u8; 64]),
            false,
        )
        .expect("Failed to add entry");
    }
    let frozen = pack.freeze().expect("Failed to freeze archive");
    let reader = SqPackReader::from_streams(
        Some(frozen.index1()),
        Some(frozen.index2()),
        frozen.data_files(),
        ReaderConfig::default(),
    )
    .expect("Failed to open frozen archive");

    c.bench_function("find_path", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7) % 2000;
            black_box(
                reader
                    .find_path(&format!("bench/dir{}/file{i}.bin", i % 40))
                    .expect("Entry not found"),
            )
        });
    });
}

criterion_group!(benches, bench_encode, bench_partial_decode, bench_frozen_lookup);
criterion_main!(benches);
