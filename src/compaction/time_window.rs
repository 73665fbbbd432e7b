//! Time-windowed block selection.
//!
//! # Bucketing
//!
//! A block belongs to window `end_time / max_compaction_range`. Windows at
//! or after `window(now - active_window)` are **active**: their blocks are
//! bucketed per `(window, compaction level)` so that levels never mix while
//! a window may still be receiving data. Older windows are **inactive** and
//! form one bucket per window, whatever the levels.
//!
//! Inside a bucket blocks are ordered by object count, then block ID, so the
//! cheapest merges come first and ties are deterministic.
//!
//! # Selection order
//!
//! 1. Active buckets, newest window first, lowest level first. At most one
//!    group is taken from the active region per selector, which keeps recent
//!    windows from monopolizing a planning pass.
//! 2. Inactive buckets, oldest window first.
//!
//! A group takes blocks from the front of a bucket while it holds fewer than
//! `max_input_blocks` and the summed object count stays within
//! `max_compaction_objects`. It is handed out only if it reaches
//! `min_input_blocks`; otherwise the bucket is dropped for this selector.
//! A bucket that still has blocks after a group was taken is revisited on
//! the next call.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use tracing::debug;

use crate::block::{BlockMeta, meta::now_nanos};

use super::{CompactionBlockSelector, CompactionError, CompactionGroup, SelectorConfig};

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

struct Bucket {
    window: u64,
    /// `Some` for active buckets, which hold a single compaction level.
    level: Option<u32>,
    blocks: VecDeque<BlockMeta>,
}

impl Bucket {
    fn new(window: u64, level: Option<u32>, mut blocks: Vec<BlockMeta>) -> Self {
        blocks.sort_by(|a, b| {
            a.total_objects
                .cmp(&b.total_objects)
                .then_with(|| a.block_id.cmp(&b.block_id))
        });
        Self {
            window,
            level,
            blocks: blocks.into(),
        }
    }

    fn take_group(&mut self, config: &SelectorConfig) -> Option<Vec<BlockMeta>> {
        let mut count = 0;
        let mut objects = 0u64;
        for meta in &self.blocks {
            if count == config.max_input_blocks {
                break;
            }
            match objects.checked_add(meta.total_objects) {
                Some(sum) if sum <= config.max_compaction_objects => objects = sum,
                _ => break,
            }
            count += 1;
        }

        if count < config.min_input_blocks {
            return None;
        }
        Some(self.blocks.drain(..count).collect())
    }

    fn hash(&self, tenant_id: &str) -> String {
        match self.level {
            Some(level) => format!("{tenant_id}-{level}-{}", self.window),
            None => format!("{tenant_id}-*-{}", self.window),
        }
    }
}

/// Hands out groups of blocks that share a time window.
///
/// See the [module documentation](self) for the policy.
pub struct TimeWindowBlockSelector {
    active: VecDeque<Bucket>,
    inactive: VecDeque<Bucket>,
    config: SelectorConfig,
}

impl TimeWindowBlockSelector {
    /// Builds a selector over `blocklist`, judging window activity against
    /// the current time.
    pub fn new(blocklist: &[BlockMeta], config: SelectorConfig) -> Result<Self, CompactionError> {
        Self::new_at(blocklist, config, now_nanos())
    }

    /// Builds a selector judging window activity against `now` (Unix nanos).
    pub fn new_at(
        blocklist: &[BlockMeta],
        config: SelectorConfig,
        now: u64,
    ) -> Result<Self, CompactionError> {
        config.validate()?;

        let range = duration_nanos(config.max_compaction_range).max(1);
        let active_from = config
            .active_window
            .map(|buffer| now.saturating_sub(duration_nanos(buffer)) / range);

        let mut active: BTreeMap<(Reverse<u64>, u32), Vec<BlockMeta>> = BTreeMap::new();
        let mut inactive: BTreeMap<u64, Vec<BlockMeta>> = BTreeMap::new();
        for meta in blocklist {
            let window = meta.end_time / range;
            match active_from {
                Some(from) if window >= from => active
                    .entry((Reverse(window), meta.compaction_level))
                    .or_default()
                    .push(meta.clone()),
                _ => inactive.entry(window).or_default().push(meta.clone()),
            }
        }

        debug!(
            blocks = blocklist.len(),
            active_buckets = active.len(),
            inactive_buckets = inactive.len(),
            "built time window selector"
        );

        Ok(Self {
            active: active
                .into_iter()
                .map(|((Reverse(window), level), blocks)| Bucket::new(window, Some(level), blocks))
                .collect(),
            inactive: inactive
                .into_iter()
                .map(|(window, blocks)| Bucket::new(window, None, blocks))
                .collect(),
            config,
        })
    }
}

fn into_group(bucket: &Bucket, blocks: Vec<BlockMeta>) -> CompactionGroup {
    let tenant = blocks.first().map(|m| m.tenant_id.as_str()).unwrap_or_default();
    let hash = bucket.hash(tenant);
    debug!(hash = %hash, blocks = blocks.len(), "selected compaction group");
    CompactionGroup { blocks, hash }
}

impl CompactionBlockSelector for TimeWindowBlockSelector {
    fn blocks_to_compact(&mut self) -> Option<CompactionGroup> {
        while let Some(bucket) = self.active.front_mut() {
            if let Some(blocks) = bucket.take_group(&self.config) {
                let group = into_group(bucket, blocks);
                self.active.clear();
                return Some(group);
            }
            self.active.pop_front();
        }

        while let Some(bucket) = self.inactive.front_mut() {
            if let Some(blocks) = bucket.take_group(&self.config) {
                return Some(into_group(bucket, blocks));
            }
            self.inactive.pop_front();
        }

        None
    }
}
