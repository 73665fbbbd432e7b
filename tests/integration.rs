//! Integration tests for the public `tracestore` API.
//!
//! These tests drive the whole block lifecycle (head block → sealed block →
//! selection → merge) through the public API only.
//!
//! ## Coverage areas
//! - **Lifecycle**: write, seal, discard, reopen, select, merge
//! - **Restart**: head blocks replayed after the WAL handle is dropped
//! - **Concurrency**: writers and readers sharing one head block

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracestore::block::block_name;
use tracestore::{
    Block, Cancellation, CompactionBlockSelector, CompleteBlock, ObjectCombiner, SelectorConfig,
    TimeWindowBlockSelector, Wal, WalConfig, compact,
};
use uuid::Uuid;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Joins payloads with `|`, so the fold order is visible.
struct Join;

impl ObjectCombiner for Join {
    fn combine(&self, existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        [existing, b"|", incoming].concat()
    }
}

fn open(dir: &std::path::Path) -> Wal {
    let config = WalConfig {
        index_downsample: 4,
        ..WalConfig::new(dir.join("wal"))
    };
    Wal::open(config, Arc::new(Join)).expect("open")
}

fn trace_id(i: u32) -> Vec<u8> {
    format!("trace-{i:06}").into_bytes()
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Two head blocks of one tenant are sealed, found again after a restart,
/// selected as one group and merged.
///
/// # Actions
/// 1. Write 50 traces to each of two head blocks; 10 IDs appear in both.
/// 2. Seal both blocks and discard the head files.
/// 3. Reopen the WAL and list the sealed blocks.
/// 4. Select with a single, all-covering window and merge the group.
/// 5. Mark the inputs compacted.
///
/// # Expected behavior
/// The selector returns both blocks; the merged block holds 90 distinct
/// IDs, shared IDs combine in input order, and the inputs carry a
/// compaction marker.
#[test]
fn write_seal_select_merge() {
    let dir = TempDir::new().unwrap();
    let wal = open(dir.path());

    let first = wal.new_block(Uuid::new_v4(), "tenant").unwrap();
    let second = wal.new_block(Uuid::new_v4(), "tenant").unwrap();
    for i in 0..50 {
        first.write(&trace_id(i), b"first").unwrap();
        second.write(&trace_id(i + 40), b"second").unwrap();
    }

    for head in [first, second] {
        head.complete(&wal.block_config()).unwrap();
        head.discard().unwrap();
    }
    drop(wal);

    let wal = open(dir.path());
    assert!(wal.list_blocks().unwrap().is_empty());
    let sealed = wal.completed_blocks().unwrap();
    assert_eq!(sealed.len(), 2);

    let metas: Vec<_> = sealed.iter().map(|b| b.block_meta().clone()).collect();
    let config = SelectorConfig {
        max_compaction_range: Duration::MAX,
        active_window: None,
        ..SelectorConfig::default()
    };
    let mut selector = TimeWindowBlockSelector::new(&metas, config).unwrap();
    let group = selector.blocks_to_compact().expect("one group");
    assert_eq!(group.blocks.len(), 2);
    assert_eq!(group.hash, "tenant-*-0");
    assert!(selector.blocks_to_compact().is_none());

    // merge in the order the selector chose
    let ordered: Vec<CompleteBlock> = group
        .blocks
        .iter()
        .map(|m| {
            let dir = wal.blocks_dir().join(block_name(&m.block_id, &m.tenant_id));
            CompleteBlock::open(dir, wal.combiner()).unwrap()
        })
        .collect();
    let merged = compact(&ordered, &wal.block_config(), wal.combiner(), &Cancellation::new())
        .unwrap();

    let meta = merged.block_meta();
    assert_eq!(meta.total_objects, 90);
    assert_eq!(meta.compaction_level, 1);
    assert_eq!(meta.min_id, trace_id(0));
    assert_eq!(meta.max_id, trace_id(89));

    // trace 0 was only written to the first head block
    let first_goes_first = ordered[0].find(&trace_id(0)).unwrap().is_some();
    let expected: &[u8] = if first_goes_first {
        b"first|second"
    } else {
        b"second|first"
    };
    assert_eq!(merged.find(&trace_id(45)).unwrap().as_deref(), Some(expected));
    assert_eq!(merged.find(&trace_id(10)).unwrap(), Some(b"first".to_vec()));
    assert_eq!(merged.find(&trace_id(85)).unwrap(), Some(b"second".to_vec()));
    assert_eq!(merged.find(&trace_id(1000)).unwrap(), None);

    for input in &ordered {
        input.mark_compacted(meta.end_time).unwrap();
        assert_eq!(input.compacted_at().unwrap(), Some(meta.end_time));
    }
    assert_eq!(wal.completed_blocks().unwrap().len(), 3);
}

// ================================================================================================
// Restart
// ================================================================================================

/// # Scenario
/// A head block left behind by a previous process is replayed and sealed.
///
/// # Actions
/// 1. Write 20 traces, some twice, and drop the WAL without sealing.
/// 2. Reopen and replay all head blocks.
/// 3. Seal the replayed block.
///
/// # Expected behavior
/// The replayed block holds every write; duplicates combine in write order
/// both before and after sealing.
#[test]
fn head_blocks_are_replayed_after_restart() {
    let dir = TempDir::new().unwrap();
    let wal = open(dir.path());
    let block_id = Uuid::new_v4();
    let head = wal.new_block(block_id, "tenant").unwrap();
    for i in 0..20 {
        head.write(&trace_id(i), b"a").unwrap();
    }
    head.write(&trace_id(3), b"b").unwrap();
    drop(head);
    drop(wal);

    let wal = open(dir.path());
    let mut heads = wal.all_blocks().unwrap();
    assert_eq!(heads.len(), 1);
    let head = heads.remove(0);
    assert_eq!(head.meta().block_id, block_id);
    assert_eq!(head.meta().total_objects, 21);
    assert_eq!(head.find(&trace_id(3)).unwrap(), Some(b"a|b".to_vec()));

    let sealed = head.complete(&wal.block_config()).unwrap();
    assert_eq!(sealed.find(&trace_id(3)).unwrap(), Some(b"a|b".to_vec()));
    assert_eq!(sealed.records().len(), 6);
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Several threads append to one head block while others look IDs up.
///
/// # Expected behavior
/// Every write lands exactly once and readers never fail.
#[test]
fn concurrent_writers_and_readers() {
    let dir = TempDir::new().unwrap();
    let wal = open(dir.path());
    let head = Arc::new(wal.new_block(Uuid::new_v4(), "tenant").unwrap());

    let writers: Vec<_> = (0..4u32)
        .map(|t| {
            let head = Arc::clone(&head);
            thread::spawn(move || {
                for i in 0..50 {
                    head.write(&trace_id(t * 1000 + i), b"x").unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2u32)
        .map(|_| {
            let head = Arc::clone(&head);
            thread::spawn(move || {
                for i in 0..50 {
                    let found = head.find(&trace_id(i)).unwrap();
                    assert!(found.is_none() || found == Some(b"x".to_vec()));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    assert_eq!(head.len(), 200);
    let iterated = head.iter(Cancellation::new()).unwrap().count();
    assert_eq!(iterated, 200);
    for t in 0..4 {
        assert_eq!(
            head.find(&trace_id(t * 1000 + 49)).unwrap(),
            Some(b"x".to_vec())
        );
    }
}
