//! Micro-benchmarks for the tracestore block lifecycle.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench block              # run all benchmarks
//! cargo bench --bench block -- find      # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use std::sync::Arc;
use std::time::Duration;

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use tempfile::TempDir;
use tracestore::{
    Block, BlockMeta, Cancellation, CompactionBlockSelector, CompleteBlock, ObjectCombiner,
    SelectorConfig, SyncPolicy, TimeWindowBlockSelector, Wal, WalConfig, compact,
};
use uuid::Uuid;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Payload of a typical small span batch (512 bytes).
const PAYLOAD: &[u8; 512] = &[0xAB; 512];

struct KeepLatest;

impl ObjectCombiner for KeepLatest {
    fn combine(&self, _existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        incoming.to_vec()
    }
}

fn trace_id(i: u64) -> Vec<u8> {
    // spread IDs like random trace IDs while staying reproducible
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_be_bytes().to_vec()
}

/// WAL without per-write fsync, so benchmarks measure the block code
/// rather than the device.
fn open_wal(dir: &std::path::Path) -> Wal {
    let config = WalConfig {
        sync_policy: SyncPolicy::OnComplete,
        ..WalConfig::new(dir.join("wal"))
    };
    Wal::open(config, Arc::new(KeepLatest)).expect("open")
}

fn sealed_block(wal: &Wal, count: u64, offset: u64) -> CompleteBlock {
    let head = wal.new_block(Uuid::new_v4(), "bench").unwrap();
    for i in 0..count {
        head.write(&trace_id(i + offset), PAYLOAD).unwrap();
    }
    let block = head.complete(&wal.block_config()).unwrap();
    head.discard().unwrap();
    block
}

// ================================================================================================
// Head block
// ================================================================================================

/// Appends to a head block and seals it.
///
/// `write` measures one framed append; `complete` measures sorting,
/// copying and indexing a block of 10,000 objects.
fn bench_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("head");

    group.throughput(Throughput::Bytes(PAYLOAD.len() as u64));
    group.bench_function("write", |b| {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        let head = wal.new_block(Uuid::new_v4(), "bench").unwrap();
        let mut seq = 0u64;

        b.iter(|| {
            head.write(black_box(&trace_id(seq)), black_box(PAYLOAD))
                .unwrap();
            seq += 1;
        });
    });

    group.throughput(Throughput::Elements(10_000));
    group.sample_size(10);
    group.bench_function("complete/10k", |b| {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());

        b.iter_batched(
            || {
                let head = wal.new_block(Uuid::new_v4(), "bench").unwrap();
                for i in 0..10_000 {
                    head.write(&trace_id(i), PAYLOAD).unwrap();
                }
                head
            },
            |head| head.complete(&wal.block_config()).unwrap(),
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Lookups
// ================================================================================================

/// Point lookups against a sealed block of 10,000 objects.
///
/// `hit` walks bloom filter, sparse index and one span; `miss` should
/// mostly stop at the bloom filter.
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");
    let dir = TempDir::new().unwrap();
    let wal = open_wal(dir.path());
    let block = sealed_block(&wal, 10_000, 0);

    let mut seq = 0u64;
    group.bench_function("hit", |b| {
        b.iter(|| {
            let id = trace_id(seq % 10_000);
            seq += 1;
            black_box(block.find(&id).unwrap())
        });
    });

    let mut seq = 0u64;
    group.bench_function("miss", |b| {
        b.iter(|| {
            let id = trace_id(1_000_000 + seq);
            seq += 1;
            black_box(block.find(&id).unwrap())
        });
    });

    group.finish();
}

// ================================================================================================
// Compaction
// ================================================================================================

/// Selection over large blocklists and merging of sealed blocks.
fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");

    for &blocks in &[100u64, 10_000] {
        let metas: Vec<BlockMeta> = (0..blocks)
            .map(|i| BlockMeta {
                end_time: i * 60 * 1_000_000_000,
                total_objects: i % 17,
                compaction_level: (i % 3) as u32,
                ..BlockMeta::new(Uuid::from_u128(u128::from(i)), "bench")
            })
            .collect();
        let config = SelectorConfig {
            max_compaction_range: Duration::from_secs(60 * 60),
            active_window: None,
            ..SelectorConfig::default()
        };

        group.bench_with_input(BenchmarkId::new("select_all", blocks), &metas, |b, metas| {
            b.iter(|| {
                let mut selector =
                    TimeWindowBlockSelector::new(black_box(metas), config.clone()).unwrap();
                let mut groups = 0;
                while selector.blocks_to_compact().is_some() {
                    groups += 1;
                }
                groups
            });
        });
    }

    group.sample_size(10);
    group.bench_function("merge/2x5k", |b| {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        let inputs = [sealed_block(&wal, 5_000, 0), sealed_block(&wal, 5_000, 2_500)];

        b.iter(|| {
            let merged = compact(
                &inputs,
                &wal.block_config(),
                wal.combiner(),
                &Cancellation::new(),
            )
            .unwrap();
            black_box(merged.meta().total_objects)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_head, bench_find, bench_compaction);
criterion_main!(benches);
