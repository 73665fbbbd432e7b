use std::{path::Path, sync::Arc};

use tracing_subscriber::EnvFilter;

use crate::block::ObjectCombiner;
use crate::wal::{Wal, WalConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Keeps the newer payload.
pub struct LastWins;

impl ObjectCombiner for LastWins {
    fn combine(&self, _existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        incoming.to_vec()
    }
}

pub fn config(root: &Path) -> WalConfig {
    init_tracing();
    WalConfig {
        index_downsample: 2,
        ..WalConfig::new(root.join("wal"))
    }
}

pub fn open_wal(root: &Path) -> Wal {
    Wal::open(config(root), Arc::new(LastWins)).unwrap()
}
