//! Merging sealed blocks into one higher-level block.
//!
//! Inputs are streamed through a heap-based k-way merge in ID order (ties go
//! to the earlier input), duplicate IDs are folded with the combiner, and
//! the result is written with a [`BlockWriter`]. Input blocks are not
//! modified; marking them compacted and removing them is up to the caller.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::block::{
    Block, BlockConfig, BlockError, BlockIter, BlockMeta, BlockWriter, Cancellation,
    CompleteBlock, DedupingIterator, Object, ObjectCombiner,
};

use super::CompactionError;

// ------------------------------------------------------------------------------------------------
// MergeIterator: heap-based k-way merge over block iterators
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    id: Vec<u8>,
    payload: Vec<u8>,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the smallest ID, then the earliest source,
        // pops first.
        self.id
            .cmp(&other.id)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Yields the objects of several ID-sorted iterators in global ID order.
struct MergeIterator {
    sources: Vec<BlockIter>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergeIterator {
    fn new(mut sources: Vec<BlockIter>) -> Result<Self, BlockError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(item) = iter.next() {
                let (id, payload) = item?;
                heap.push(HeapEntry {
                    id,
                    payload,
                    source,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Object, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.heap.pop()?;

        if let Some(item) = self.sources[entry.source].next() {
            match item {
                Ok((id, payload)) => self.heap.push(HeapEntry {
                    id,
                    payload,
                    source: entry.source,
                }),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        Some(Ok((entry.id, entry.payload)))
    }
}

// ------------------------------------------------------------------------------------------------
// compact
// ------------------------------------------------------------------------------------------------

/// Merges `blocks` (all of one tenant) into a new published block.
///
/// The output gets a fresh block ID, the earliest start time and latest end
/// time of its inputs, and a compaction level one above the highest input
/// level. Its object count is the number of objects left after folding
/// duplicates.
pub fn compact(
    blocks: &[CompleteBlock],
    config: &BlockConfig,
    combiner: Arc<dyn ObjectCombiner>,
    cancel: &Cancellation,
) -> Result<CompleteBlock, CompactionError> {
    let metas: Vec<BlockMeta> = blocks.iter().map(|b| b.block_meta().clone()).collect();
    let first = metas
        .first()
        .ok_or_else(|| CompactionError::InvalidInput("no blocks to merge".into()))?;
    if let Some(other) = metas.iter().find(|m| m.tenant_id != first.tenant_id) {
        return Err(CompactionError::InvalidInput(format!(
            "cannot merge tenants {} and {}",
            first.tenant_id, other.tenant_id
        )));
    }

    let template = BlockMeta {
        start_time: metas.iter().map(|m| m.start_time).min().unwrap_or_default(),
        end_time: metas.iter().map(|m| m.end_time).max().unwrap_or_default(),
        compaction_level: metas
            .iter()
            .map(|m| m.compaction_level)
            .max()
            .unwrap_or_default()
            + 1,
        ..BlockMeta::new(Uuid::new_v4(), first.tenant_id.clone())
    };
    let expected: u64 = metas.iter().map(|m| m.total_objects).sum();
    let expected = usize::try_from(expected).unwrap_or(usize::MAX);

    debug!(
        "Merging {} blocks of tenant {} into {} (level {})",
        metas.len(),
        template.tenant_id,
        template.block_id,
        template.compaction_level
    );

    let sources = blocks
        .iter()
        .map(|b| b.iter(cancel.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut writer = BlockWriter::create(template, config.clone(), expected)?;
    let written = MergeIterator::new(sources).and_then(|merged| {
        for object in DedupingIterator::new(merged, combiner.as_ref()) {
            let (id, payload) = object?;
            writer.append(&id, &payload)?;
        }
        Ok(())
    });
    if let Err(e) = written {
        if let Err(cleanup) = writer.abort() {
            warn!("Failed to clean up aborted block build: {cleanup}");
        }
        return Err(e.into());
    }

    let output = writer.finish(Arc::clone(&combiner))?;
    let out_meta = output.block_meta();
    info!(
        "Merged {} blocks ({} objects) into block {} ({} objects, level {})",
        metas.len(),
        expected,
        out_meta.block_id,
        out_meta.total_objects,
        out_meta.compaction_level
    );
    Ok(output)
}
