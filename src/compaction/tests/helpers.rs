use std::{path::Path, sync::Arc, time::Duration};

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::block::{
    BlockConfig, BlockMeta, CompleteBlock, HeadBlock, ObjectCombiner, SyncPolicy,
};
use crate::compaction::{CompactionBlockSelector, CompactionGroup, SelectorConfig};

pub const SECOND: u64 = 1_000_000_000;
pub const DAY: u64 = 24 * 60 * 60 * SECOND;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Metadata of block `n` (block IDs order like `n`).
pub fn meta(n: u128, end_time: u64, total_objects: u64, level: u32) -> BlockMeta {
    BlockMeta {
        end_time,
        start_time: end_time.saturating_sub(SECOND),
        total_objects,
        compaction_level: level,
        ..BlockMeta::new(Uuid::from_u128(n), "tenant")
    }
}

/// One-second windows, no active region.
pub fn plain_config() -> SelectorConfig {
    init_tracing();
    SelectorConfig {
        max_compaction_range: Duration::from_secs(1),
        max_compaction_objects: 100,
        min_input_blocks: 2,
        max_input_blocks: 2,
        active_window: None,
    }
}

/// One-day windows with a one-day active region.
pub fn active_config() -> SelectorConfig {
    init_tracing();
    SelectorConfig {
        max_compaction_range: Duration::from_secs(24 * 60 * 60),
        max_compaction_objects: 100,
        min_input_blocks: 2,
        max_input_blocks: 2,
        active_window: Some(Duration::from_secs(24 * 60 * 60)),
    }
}

/// Block numbers of a group, in group order.
pub fn numbers(group: &CompactionGroup) -> Vec<u128> {
    group.blocks.iter().map(|m| m.block_id.as_u128()).collect()
}

/// Drains a selector into per-group block numbers.
pub fn drain(selector: &mut dyn CompactionBlockSelector) -> Vec<Vec<u128>> {
    std::iter::from_fn(|| selector.blocks_to_compact())
        .map(|g| numbers(&g))
        .collect()
}

pub struct Concat;

impl ObjectCombiner for Concat {
    fn combine(&self, existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        [existing, incoming].concat()
    }
}

pub fn concat() -> Arc<dyn ObjectCombiner> {
    Arc::new(Concat)
}

pub fn block_config(root: &Path) -> BlockConfig {
    init_tracing();
    BlockConfig {
        work_dir: root.join("work"),
        blocks_dir: root.join("blocks"),
        index_downsample: 3,
        bloom_false_positive_rate: 0.01,
    }
}

/// Writes `objects` into a fresh head block of `tenant` and seals it.
pub fn sealed_block(root: &Path, tenant: &str, objects: &[(&[u8], &[u8])]) -> CompleteBlock {
    let head = HeadBlock::create(
        root,
        Uuid::new_v4(),
        tenant,
        SyncPolicy::OnComplete,
        concat(),
    )
    .unwrap();
    for (id, payload) in objects {
        head.write(id, payload).unwrap();
    }
    let block = head.complete(&block_config(root)).unwrap();
    head.discard().unwrap();
    block
}
