//! # tracestore
//!
//! Block lifecycle and compaction selection for a trace storage backend.
//! Trace objects (an opaque ID plus an opaque payload) are appended to a
//! per-tenant **head block**, sealed into an immutable, indexed **complete
//! block**, and later merged with neighbouring blocks chosen by a
//! **time-window selector**.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tracestore::{Block, ObjectCombiner, Wal, WalConfig};
//! use uuid::Uuid;
//!
//! struct KeepLatest;
//!
//! impl ObjectCombiner for KeepLatest {
//!     fn combine(&self, _existing: &[u8], incoming: &[u8]) -> Vec<u8> {
//!         incoming.to_vec()
//!     }
//! }
//!
//! let wal = Wal::open(WalConfig::new("/tmp/traces"), Arc::new(KeepLatest)).unwrap();
//!
//! // Append
//! let head = wal.new_block(Uuid::new_v4(), "tenant-1").unwrap();
//! head.write(b"trace-a", b"span batch 1").unwrap();
//! head.write(b"trace-a", b"span batch 2").unwrap();
//!
//! // Seal
//! let block = head.complete(&wal.block_config()).unwrap();
//! head.discard().unwrap();
//!
//! // Look up
//! assert_eq!(block.find(b"trace-a").unwrap(), Some(b"span batch 2".to_vec()));
//! ```
//!
//! ## Features
//!
//! - **Write-ahead head blocks**: appends are checksummed frames, replayed
//!   after a restart with torn tails truncated.
//! - **Sparse indexes and bloom filters**: sealed blocks answer misses
//!   without touching data and hits with a single span read.
//! - **Deduplication**: objects stored more than once under an ID are
//!   merged by a caller-supplied [`ObjectCombiner`].
//! - **Time-window compaction**: [`TimeWindowBlockSelector`] groups blocks
//!   of the same window and [`compact`] merges a group into one block.

pub mod block;
pub mod compaction;
pub mod encoding;
pub mod wal;

pub use block::{
    Block, BlockConfig, BlockError, BlockMeta, Cancellation, CompleteBlock, HeadBlock,
    ObjectCombiner, SyncPolicy,
};
pub use compaction::{
    CompactionBlockSelector, CompactionError, CompactionGroup, SelectorConfig,
    TimeWindowBlockSelector, compact,
};
pub use wal::{Wal, WalConfig, WalError};
