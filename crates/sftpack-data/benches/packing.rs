//! Benchmarks for batch conversion and sequence packing.
//!
//! Run with: cargo bench -p sftpack-data

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sftpack_core::{FormatType, PackingConfig};
use sftpack_data::{Converter, SequencePacker, TokenizedExample, RUST_EXPLANATION};

/// Deterministic example lengths in `1..=max_len`.
fn generate_examples(count: usize, max_len: usize) -> Vec<TokenizedExample> {
    (0..count)
        .map(|i| {
            let len = (i * 7919) % max_len + 1;
            TokenizedExample::fully_trainable((0..len as u32).collect())
        })
        .collect()
}

fn generate_records(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            serde_json::json!({
                "input": format!("fn f{i}(x: u32) -> u32 {{ x * {i} }}"),
                "output": format!("Multiplies its argument by {i}."),
            })
            .to_string()
        })
        .collect()
}

/// Benchmark single-pass packing across block lengths.
fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");
    let examples = generate_examples(10_000, 1024);
    let tokens: usize = examples.iter().map(TokenizedExample::len).sum();
    group.throughput(Throughput::Elements(tokens as u64));

    for block_length in [1024usize, 2048, 4096].iter() {
        let packer = SequencePacker::new(PackingConfig::with_block_length(*block_length), 0)
            .expect("valid config");
        group.bench_with_input(
            BenchmarkId::new("greedy", block_length),
            block_length,
            |b, _| {
                b.iter(|| packer.pack(black_box(examples.clone())).expect("pack"));
            },
        );
    }

    group.finish();
}

/// Benchmark sharded packing against one pass.
fn bench_pack_sharded(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_sharded");
    let examples = generate_examples(50_000, 512);
    let packer =
        SequencePacker::new(PackingConfig::with_block_length(2048), 0).expect("valid config");

    for shard_size in [1_000usize, 10_000, 50_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("shard_size", shard_size),
            shard_size,
            |b, &shard_size| {
                b.iter(|| {
                    packer
                        .pack_sharded(black_box(examples.clone()), shard_size)
                        .expect("pack_sharded")
                });
            },
        );
    }

    group.finish();
}

/// Benchmark parallel batch conversion.
fn bench_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert_batch");
    let converter = Converter::default();

    for count in [1_000usize, 10_000].iter() {
        let records = generate_records(*count);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("rust_explanation", count), count, |b, _| {
            b.iter(|| {
                converter
                    .convert_batch(black_box(&records), FormatType::Alpaca, RUST_EXPLANATION)
                    .expect("convert")
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pack, bench_pack_sharded, bench_convert);
criterion_main!(benches);
