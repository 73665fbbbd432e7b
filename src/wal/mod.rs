//! Write-Ahead Log (WAL) Module
//!
//! The WAL owns one directory and everything the block lifecycle keeps in
//! it: the append-only head block files of blocks still receiving writes,
//! the transient work area used while sealing, and the published sealed
//! blocks.
//!
//! # On-disk layout
//!
//! ```text
//! <path>/{BlockID}-{TenantID}          head blocks (one file each)
//! <path>/work/                         in-progress completions and merges
//! <path>/blocks/{BlockID}-{TenantID}/  published sealed blocks
//! ```
//!
//! # Startup
//!
//! [`Wal::open`] creates the directories if needed and empties `work/`.
//! Anything found there is debris from a completion or merge that never
//! published, so removing it loses nothing. Head blocks left by a previous
//! run are picked up with [`Wal::all_blocks`].
//!
//! # Guarantees
//!
//! - The work directory is empty once `open` returns successfully.
//! - Head block files survive restarts and are replayed on demand; a torn
//!   final frame is truncated during replay.

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::block::{
    BlockConfig, BlockError, CompleteBlock, HeadBlock, ObjectCombiner, SyncPolicy, block_name,
    parse_block_name,
};

/// Sub-directory holding in-progress block builds.
pub const WORK_DIR: &str = "work";

/// Sub-directory holding published sealed blocks.
pub const BLOCKS_DIR: &str = "blocks";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from a block operation.
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Caller-supplied value rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Wal`].
///
/// # Example
///
/// ```rust
/// use tracestore::wal::WalConfig;
///
/// let config = WalConfig {
///     index_downsample: 13,
///     ..WalConfig::new("/tmp/wal")
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WalConfig {
    /// Root directory of the WAL.
    pub path: PathBuf,

    /// Objects summarized by one sparse index entry of a sealed block.
    ///
    /// Default: 100. Must be ≥ 1.
    pub index_downsample: usize,

    /// Bloom filter false-positive rate of sealed blocks.
    ///
    /// Default: 0.01. Must be in (0.0, 1.0).
    pub bloom_false_positive_rate: f64,

    /// Durability of head block appends.
    ///
    /// Default: [`SyncPolicy::Always`].
    pub sync_policy: SyncPolicy,
}

impl WalConfig {
    /// Default settings rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), WalError> {
        if self.path.as_os_str().is_empty() {
            return Err(WalError::InvalidConfig("path must not be empty".into()));
        }
        if self.index_downsample < 1 {
            return Err(WalError::InvalidConfig(
                "index_downsample must be >= 1".into(),
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(WalError::InvalidConfig(
                "bloom_false_positive_rate must be in (0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("wal"),
            index_downsample: 100,
            bloom_false_positive_rate: 0.01,
            sync_policy: SyncPolicy::Always,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// Directory manager for head and sealed blocks.
pub struct Wal {
    config: WalConfig,
    combiner: Arc<dyn ObjectCombiner>,
}

impl Wal {
    /// Opens (creating if needed) the WAL directory and empties the work
    /// directory.
    pub fn open(config: WalConfig, combiner: Arc<dyn ObjectCombiner>) -> Result<Self, WalError> {
        config.validate()?;

        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join(WORK_DIR))?;
        fs::create_dir_all(config.path.join(BLOCKS_DIR))?;

        let wal = Self { config, combiner };
        let removed = wal.clean_work_dir()?;
        if removed > 0 {
            warn!(
                "Removed {removed} leftover entries from {}",
                wal.work_dir().display()
            );
        }

        info!("Opened WAL at {}", wal.config.path.display());
        Ok(wal)
    }

    fn clean_work_dir(&self) -> Result<usize, WalError> {
        let mut removed = 0;
        for entry in fs::read_dir(self.work_dir())? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            debug!("Removed work dir entry {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }

    /// Creates an empty head block.
    ///
    /// The tenant ID becomes part of a file name, so it must be non-empty
    /// and free of path separators.
    pub fn new_block(&self, block_id: Uuid, tenant_id: &str) -> Result<HeadBlock, WalError> {
        if tenant_id.is_empty() {
            return Err(WalError::InvalidArgument("tenant ID must not be empty".into()));
        }
        if tenant_id.contains(['/', '\\', '\0']) {
            return Err(WalError::InvalidArgument(format!(
                "tenant ID {tenant_id:?} contains a path separator"
            )));
        }

        let block = HeadBlock::create(
            &self.config.path,
            block_id,
            tenant_id,
            self.config.sync_policy,
            Arc::clone(&self.combiner),
        )?;
        Ok(block)
    }

    /// `(BlockID, TenantID)` of every head block file, sorted by name.
    pub fn list_blocks(&self) -> Result<Vec<(Uuid, String)>, WalError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(parse_block_name) {
                Some(parsed) => names.push((name.to_string_lossy().into_owned(), parsed)),
                None => debug!("Ignoring unrecognized WAL entry {name:?}"),
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(names.into_iter().map(|(_, parsed)| parsed).collect())
    }

    /// Replays every head block file.
    pub fn all_blocks(&self) -> Result<Vec<HeadBlock>, WalError> {
        let mut blocks = Vec::new();
        for (block_id, tenant_id) in self.list_blocks()? {
            let path = self.config.path.join(block_name(&block_id, &tenant_id));
            blocks.push(HeadBlock::recover(
                path,
                self.config.sync_policy,
                Arc::clone(&self.combiner),
            )?);
        }
        info!("Replayed {} head blocks", blocks.len());
        Ok(blocks)
    }

    /// Opens every published sealed block, sorted by directory name.
    pub fn completed_blocks(&self) -> Result<Vec<CompleteBlock>, WalError> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(self.blocks_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut blocks = Vec::with_capacity(dirs.len());
        for dir in dirs {
            blocks.push(CompleteBlock::open(&dir, Arc::clone(&self.combiner))?);
        }
        Ok(blocks)
    }

    /// Target configuration for sealing head blocks of this WAL.
    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            work_dir: self.work_dir(),
            blocks_dir: self.blocks_dir(),
            index_downsample: self.config.index_downsample,
            bloom_false_positive_rate: self.config.bloom_false_positive_rate,
        }
    }

    pub fn combiner(&self) -> Arc<dyn ObjectCombiner> {
        Arc::clone(&self.combiner)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn work_dir(&self) -> PathBuf {
        self.config.path.join(WORK_DIR)
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.config.path.join(BLOCKS_DIR)
    }
}
