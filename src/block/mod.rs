//! Block Module
//!
//! A **block** is the unit of persisted trace data for one tenant. It comes
//! in two kinds that expose the same lookup and iteration surface through
//! the [`Block`] trait:
//!
//! - [`HeadBlock`]: the mutable, append-only write-ahead block that accepts
//!   objects as they arrive and can be queried while still open.
//! - [`CompleteBlock`]: the immutable block produced by sealing a head
//!   block (or by merging sealed blocks): ID-sorted, sparsely indexed and
//!   bloom-filtered.
//!
//! ## Design Overview
//!
//! Every object is stored as a self-checking frame (see [`object`]). A
//! [`Record`] addresses a byte range of frames inside a block's data file.
//! In a head block each record covers exactly one frame, in write order.
//! In a complete block the records form a **sparse index**: each entry
//! summarizes a span of consecutive sorted frames and carries the largest
//! ID in that span.
//!
//! Point lookups go through the [`DedupingFinder`], which merges objects
//! written more than once under the same ID using a caller-supplied
//! [`ObjectCombiner`].
//!
//! # On-disk layout
//!
//! ```text
//! <wal>/{BlockID}-{TenantID}                  head block (append-only frames)
//! <wal>/work/{BlockID}-{TenantID}/            sealed block under construction
//! <wal>/blocks/{BlockID}-{TenantID}/data      sorted frames
//! <wal>/blocks/{BlockID}-{TenantID}/index     [LEN_LE][Vec<Record>][CRC32_LE]
//! <wal>/blocks/{BlockID}-{TenantID}/bloom     [LEN_LE][BLOOM_BYTES][CRC32_LE]
//! <wal>/blocks/{BlockID}-{TenantID}/meta      [LEN_LE][BlockMeta][CRC32_LE]
//! <wal>/blocks/{BlockID}-{TenantID}/compacted [LEN_LE][u64 nanos][CRC32_LE]  (optional)
//! ```
//!
//! # Concurrency model
//!
//! - Head blocks serialize appends behind a mutex; readers work on a
//!   snapshot of the record list taken at call entry and never read past
//!   the bytes that snapshot describes.
//! - Complete blocks are immutable and can be shared freely across threads.
//! - Every file handle is opened by the operation that needs it and closed
//!   when that operation (or the iterator it returned) is dropped.
//!
//! # Guarantees
//!
//! - **Integrity:** every frame and every companion file carries a CRC32.
//! - **Atomic publish:** sealed blocks are built in the work directory and
//!   renamed into place only once fully synced.
//! - **Immutability:** the files of a published block never change.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod bloom;
pub mod complete;
pub mod finder;
pub mod head;
pub mod meta;
pub mod object;
pub mod record;
pub mod writer;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports: public API surface
// ------------------------------------------------------------------------------------------------

pub use bloom::{BloomFilter, fingerprint};
pub use complete::CompleteBlock;
pub use finder::{DedupingFinder, Finder, ObjectCombiner};
pub use head::{HeadBlock, SyncPolicy};
pub use meta::BlockMeta;
pub use object::DedupingIterator;
pub use record::Record;
pub use writer::{BlockConfig, BlockWriter};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::fs::FileExt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use uuid::Uuid;

use crate::encoding::EncodingError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Sorted object frames of a sealed block.
pub const DATA_FILE: &str = "data";

/// Encoded sparse index of a sealed block.
pub const INDEX_FILE: &str = "index";

/// Serialized bloom filter of a sealed block.
pub const BLOOM_FILE: &str = "bloom";

/// Encoded [`BlockMeta`] of a sealed block.
pub const META_FILE: &str = "meta";

/// Companion record written when a sealed block has been merged away.
pub const COMPACTED_FILE: &str = "compacted";

const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// Length of a hyphenated UUID, the fixed-width prefix of every block name.
const UUID_STR_LEN: usize = 36;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block operations (write, find, iterate, seal, open).
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error in a companion file.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Malformed on-disk data (truncated frame, span out of bounds, bad name).
    #[error("Corrupt block data: {0}")]
    Corrupt(String),

    /// Checksum mismatch.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The head block has been sealed and accepts no more writes.
    #[error("Block is sealed")]
    Sealed,

    /// A block with no objects cannot be sealed.
    #[error("Block has no objects")]
    Empty,

    /// A sealed block with this ID is already published.
    #[error("Block {0} is already published")]
    AlreadyPublished(Uuid),

    /// Iteration was cancelled by its caller.
    #[error("Iteration cancelled")]
    Cancelled,

    /// Caller-supplied value out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockError {
    /// `true` when the error indicates damaged on-disk data rather than a
    /// failing device or a caller mistake.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlockError::Corrupt(_) | BlockError::ChecksumMismatch | BlockError::Encoding(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Block trait
// ------------------------------------------------------------------------------------------------

/// An `(id, payload)` pair as stored in a block.
pub type Object = (Vec<u8>, Vec<u8>);

/// Lazy, finite sequence of objects read from a block.
pub type BlockIter = Box<dyn Iterator<Item = Result<Object, BlockError>> + Send>;

/// The read surface shared by head and complete blocks.
pub trait Block: Send + Sync {
    /// Snapshot of the block metadata.
    fn meta(&self) -> BlockMeta;

    /// Point lookup. Duplicates of `id` are merged with the block's
    /// combiner; `Ok(None)` means no object carries `id`.
    fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError>;

    /// Iterates the block's objects: write order for a head block,
    /// ascending ID order for a complete block.
    ///
    /// Each call starts from the beginning. Once `cancel` fires the
    /// iterator yields [`BlockError::Cancelled`] and then ends.
    fn iter(&self, cancel: Cancellation) -> Result<BlockIter, BlockError>;
}

// ------------------------------------------------------------------------------------------------
// Random access reads
// ------------------------------------------------------------------------------------------------

/// Positional reads against a block's data store.
pub trait ReadAt {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// A range past the end of the store is corruption: the caller only
    /// ever asks for spans that a record says were written.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, BlockError>;
}

impl ReadAt for File {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, BlockError> {
        let mut buf = vec![0u8; len];
        match self.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(BlockError::Corrupt(
                format!("span [{offset}, +{len}) extends past end of data"),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, BlockError> {
        let start = usize::try_from(offset)
            .map_err(|_| BlockError::Corrupt(format!("offset {offset} not addressable")))?;
        match start.checked_add(len) {
            Some(end) if end <= self.len() => Ok(self[start..end].to_vec()),
            _ => Err(BlockError::Corrupt(format!(
                "span [{offset}, +{len}) extends past end of data"
            ))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cancellation
// ------------------------------------------------------------------------------------------------

/// Cloneable cancellation flag handed to iteration operations.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Wraps an object iterator so it stops at the next yield point after
/// cancellation.
pub(crate) struct Cancellable<I> {
    inner: I,
    cancel: Cancellation,
    done: bool,
}

impl<I> Cancellable<I> {
    pub(crate) fn new(inner: I, cancel: Cancellation) -> Self {
        Self {
            inner,
            cancel,
            done: false,
        }
    }
}

impl<I> Iterator for Cancellable<I>
where
    I: Iterator<Item = Result<Object, BlockError>>,
{
    type Item = Result<Object, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(BlockError::Cancelled));
        }
        let item = self.inner.next();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

// ------------------------------------------------------------------------------------------------
// Block naming
// ------------------------------------------------------------------------------------------------

/// File or directory name of a block: `{BlockID}-{TenantID}`.
pub fn block_name(block_id: &Uuid, tenant_id: &str) -> String {
    format!("{}-{}", block_id.hyphenated(), tenant_id)
}

/// Parses a name produced by [`block_name`].
///
/// Tenant IDs may themselves contain `-`, so the UUID is taken as the
/// fixed-width prefix rather than split on the first separator.
pub fn parse_block_name(name: &str) -> Option<(Uuid, String)> {
    let id = name.get(..UUID_STR_LEN)?;
    let rest = name.get(UUID_STR_LEN..)?;
    let tenant = rest.strip_prefix('-')?;
    if tenant.is_empty() {
        return None;
    }
    let block_id = Uuid::parse_str(id).ok()?;
    Some((block_id, tenant.to_string()))
}

// ------------------------------------------------------------------------------------------------
// Checksummed companion files
// ------------------------------------------------------------------------------------------------

/// Writes `[len_le][data][crc32_le]` to a new file at `path` and syncs it.
pub(crate) fn write_checksummed_file(path: &Path, data: &[u8]) -> Result<(), BlockError> {
    let len = u32::try_from(data.len()).map_err(|_| {
        BlockError::InvalidArgument(format!("companion file of {} bytes", data.len()))
    })?;

    let mut hasher = Crc32::new();
    hasher.update(data);
    let checksum = hasher.finalize();

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(data)?;
    file.write_all(&checksum.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Reads a file written by [`write_checksummed_file`] and verifies it.
pub(crate) fn read_checksummed_file(path: &Path) -> Result<Vec<u8>, BlockError> {
    let raw = fs::read(path)?;
    if raw.len() < LEN_SIZE + CRC_SIZE {
        return Err(BlockError::Corrupt(format!(
            "{} is too short ({} bytes)",
            path.display(),
            raw.len()
        )));
    }

    let mut len_bytes = [0u8; LEN_SIZE];
    len_bytes.copy_from_slice(&raw[..LEN_SIZE]);
    let content_len = u32::from_le_bytes(len_bytes) as usize;
    if LEN_SIZE + content_len + CRC_SIZE != raw.len() {
        return Err(BlockError::Corrupt(format!(
            "{} declares {content_len} bytes but holds {}",
            path.display(),
            raw.len() - LEN_SIZE - CRC_SIZE
        )));
    }

    let content = &raw[LEN_SIZE..LEN_SIZE + content_len];
    let mut crc_bytes = [0u8; CRC_SIZE];
    crc_bytes.copy_from_slice(&raw[LEN_SIZE + content_len..]);

    let mut hasher = Crc32::new();
    hasher.update(content);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(BlockError::ChecksumMismatch);
    }

    Ok(content.to_vec())
}

/// Flushes directory entries (creates and renames) to stable storage.
pub(crate) fn sync_dir(path: &Path) -> Result<(), BlockError> {
    File::open(path)?.sync_all()?;
    Ok(())
}
