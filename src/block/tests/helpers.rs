use std::{path::Path, sync::Arc};

use tracing_subscriber::EnvFilter;

use crate::block::{BlockConfig, ObjectCombiner};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Combines duplicates by concatenating payloads, so the fold order is
/// visible in the result.
pub struct Concat;

impl ObjectCombiner for Concat {
    fn combine(&self, existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        [existing, incoming].concat()
    }
}

pub fn concat() -> Arc<dyn ObjectCombiner> {
    Arc::new(Concat)
}

/// Sealing targets under `root`.
pub fn block_config(root: &Path, index_downsample: usize) -> BlockConfig {
    init_tracing();
    BlockConfig {
        work_dir: root.join("work"),
        blocks_dir: root.join("blocks"),
        index_downsample,
        bloom_false_positive_rate: 0.01,
    }
}

pub fn random_id() -> Vec<u8> {
    rand::random::<[u8; 16]>().to_vec()
}
