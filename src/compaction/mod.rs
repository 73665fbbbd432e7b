//! # Compaction Module
//!
//! Decides which sealed blocks to merge and performs a single merge.
//!
//! ## Selection
//!
//! A [`CompactionBlockSelector`] is built from a snapshot of block metadata
//! for one tenant and hands out [`CompactionGroup`]s one call at a time.
//! Each call consumes the blocks it returns; `None` means nothing else is
//! eligible in this snapshot. Selectors carry cursor state and are meant to
//! be driven by one planner: build a fresh one per planning pass.
//!
//! [`TimeWindowBlockSelector`] buckets blocks by the time window their end
//! time falls in and prefers the smallest blocks of a window. Recent
//! windows can additionally be kept apart by compaction level.
//!
//! ## Merge
//!
//! [`merge::compact`] merges the blocks of one group into a single block one
//! compaction level higher, folding duplicate IDs with the object combiner.
//! Scheduling, retries and the removal of merged inputs belong to the
//! caller.

pub mod merge;
pub mod time_window;

#[cfg(test)]
mod tests;

pub use merge::compact;
pub use time_window::TimeWindowBlockSelector;

use std::time::Duration;

use thiserror::Error;

use crate::block::{BlockError, BlockMeta};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by selector construction and merges.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Invalid selector configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Inputs that cannot be merged together.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Error reading an input block or writing the output block.
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
}

// ------------------------------------------------------------------------------------------------
// Selector interface
// ------------------------------------------------------------------------------------------------

/// A set of blocks to merge together.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionGroup {
    pub blocks: Vec<BlockMeta>,

    /// Stable label of the bucket the group came from, e.g. for sharding
    /// merge work between planners.
    pub hash: String,
}

/// Stateful source of compaction groups.
pub trait CompactionBlockSelector {
    /// The next group to merge, or `None` once the snapshot is exhausted.
    fn blocks_to_compact(&mut self) -> Option<CompactionGroup>;
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning for [`TimeWindowBlockSelector`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Width of a time window.
    ///
    /// Default: 1 hour. Must be non-zero.
    pub max_compaction_range: Duration,

    /// Ceiling on the summed object count of one group.
    ///
    /// Default: 1 000 000. Must be ≥ 1.
    pub max_compaction_objects: u64,

    /// Smallest group worth merging.
    ///
    /// Default: 2. Must be ≥ 2.
    pub min_input_blocks: usize,

    /// Largest group handed out at once.
    ///
    /// Default: 2. Must be ≥ `min_input_blocks`.
    pub max_input_blocks: usize,

    /// Age below which windows are treated as still receiving data. Blocks
    /// in those windows are only grouped with blocks of the same compaction
    /// level, and at most one such group is handed out per selector.
    /// `None` applies the plain time-window policy everywhere.
    ///
    /// Default: `None`.
    pub active_window: Option<Duration>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_compaction_range: Duration::from_secs(60 * 60),
            max_compaction_objects: 1_000_000,
            min_input_blocks: 2,
            max_input_blocks: 2,
            active_window: None,
        }
    }
}

impl SelectorConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), CompactionError> {
        if self.max_compaction_range.is_zero() {
            return Err(CompactionError::InvalidConfig(
                "max_compaction_range must be non-zero".into(),
            ));
        }
        if self.max_compaction_objects < 1 {
            return Err(CompactionError::InvalidConfig(
                "max_compaction_objects must be >= 1".into(),
            ));
        }
        if self.min_input_blocks < 2 {
            return Err(CompactionError::InvalidConfig(
                "min_input_blocks must be >= 2".into(),
            ));
        }
        if self.max_input_blocks < self.min_input_blocks {
            return Err(CompactionError::InvalidConfig(
                "max_input_blocks must be >= min_input_blocks".into(),
            ));
        }
        Ok(())
    }
}
