//! Sealed block writer: builds a [`CompleteBlock`] from an ID-sorted
//! stream of objects.
//!
//! Used both when a head block is completed and when sealed blocks are
//! merged.
//!
//! # Atomicity
//!
//! 1. Create `work/{BlockID}-{TenantID}/` and stream frames into `data`.
//! 2. Write `index`, `bloom` and `meta`, syncing every file and the
//!    directory.
//! 3. Rename the directory into `blocks/` and sync the parent.
//!
//! A crash before step 3 leaves only work-directory debris, which is
//! removed the next time the WAL is opened. Any error in
//! [`BlockWriter::create`] or [`BlockWriter::finish`] removes the work
//! directory immediately, so a failed build can be retried.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::encoding::{encode_to_vec, encode_vec};

use super::{
    BLOOM_FILE, BlockError, BlockMeta, BloomFilter, CompleteBlock, DATA_FILE, INDEX_FILE,
    META_FILE, ObjectCombiner, Record, block_name, bloom::fingerprint, object::encode_object,
    record::downsample, sync_dir, write_checksummed_file,
};

// ------------------------------------------------------------------------------------------------
// BlockConfig
// ------------------------------------------------------------------------------------------------

/// Where and how sealed blocks are built.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockConfig {
    /// Transient build area.
    pub work_dir: PathBuf,

    /// Published sealed blocks.
    pub blocks_dir: PathBuf,

    /// Objects summarized by one sparse index entry. Must be ≥ 1.
    pub index_downsample: usize,

    /// Target bloom false-positive rate. Must be in (0.0, 1.0).
    pub bloom_false_positive_rate: f64,
}

impl BlockConfig {
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.index_downsample < 1 {
            return Err(BlockError::InvalidArgument(
                "index_downsample must be >= 1".into(),
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(BlockError::InvalidArgument(
                "bloom_false_positive_rate must be in (0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// BlockWriter
// ------------------------------------------------------------------------------------------------

/// Streams sorted objects into a new sealed block.
pub struct BlockWriter {
    meta: BlockMeta,
    config: BlockConfig,
    work_path: PathBuf,
    data: BufWriter<File>,
    offset: u64,
    /// One record per written frame; collapsed into the sparse index on
    /// finish.
    records: Vec<Record>,
    bloom: BloomFilter,
}

impl BlockWriter {
    /// Starts a block described by `meta`.
    ///
    /// ID bounds and the object count are recomputed from what is
    /// appended; times and compaction level are kept as given.
    /// `expected_objects` sizes the bloom filter.
    pub fn create(
        meta: BlockMeta,
        config: BlockConfig,
        expected_objects: usize,
    ) -> Result<Self, BlockError> {
        config.validate()?;

        fs::create_dir_all(&config.work_dir)?;
        let work_path = config
            .work_dir
            .join(block_name(&meta.block_id, &meta.tenant_id));
        fs::create_dir(&work_path)?;

        let opened = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(work_path.join(DATA_FILE))
            .map_err(BlockError::from)
            .and_then(|file| {
                let bloom =
                    BloomFilter::new(expected_objects, config.bloom_false_positive_rate)?;
                Ok((file, bloom))
            });
        let (file, bloom) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&work_path) {
                    warn!(
                        "Failed to remove work directory {}: {cleanup}",
                        work_path.display()
                    );
                }
                return Err(e);
            }
        };

        let meta = BlockMeta {
            min_id: Vec::new(),
            max_id: Vec::new(),
            total_objects: 0,
            bloom_false_positive_rate: config.bloom_false_positive_rate,
            ..meta
        };

        debug!(
            "Building block {} for tenant {} in {}",
            meta.block_id,
            meta.tenant_id,
            work_path.display()
        );

        Ok(Self {
            meta,
            config,
            work_path,
            data: BufWriter::new(file),
            offset: 0,
            records: Vec::with_capacity(expected_objects),
            bloom,
        })
    }

    /// Appends one object. IDs must not decrease.
    pub fn append(&mut self, id: &[u8], payload: &[u8]) -> Result<(), BlockError> {
        if let Some(last) = self.records.last() {
            if id < last.id.as_slice() {
                return Err(BlockError::InvalidArgument(
                    "objects must be appended in ascending ID order".into(),
                ));
            }
        }

        let frame = encode_object(id, payload)?;
        let length = u32::try_from(frame.len()).map_err(|_| {
            BlockError::InvalidArgument(format!("object of {} bytes is too large", frame.len()))
        })?;

        self.data.write_all(&frame)?;
        self.records.push(Record {
            id: id.to_vec(),
            start: self.offset,
            length,
        });
        self.offset += u64::from(length);
        self.bloom.add(fingerprint(id));
        Ok(())
    }

    /// Objects appended so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes the companion files and publishes the block.
    ///
    /// Fails with [`BlockError::Empty`] if nothing was appended and with
    /// [`BlockError::AlreadyPublished`] if the destination exists.
    pub fn finish(self, combiner: Arc<dyn ObjectCombiner>) -> Result<CompleteBlock, BlockError> {
        let work_path = self.work_path.clone();
        let result = self.publish(combiner);
        if result.is_err() {
            if let Err(cleanup) = fs::remove_dir_all(&work_path) {
                warn!(
                    "Failed to remove work directory {}: {cleanup}",
                    work_path.display()
                );
            }
        }
        result
    }

    /// Drops the partially built block.
    pub fn abort(self) -> Result<(), BlockError> {
        let BlockWriter {
            data, work_path, ..
        } = self;
        drop(data);
        fs::remove_dir_all(&work_path)?;
        debug!("Aborted block build in {}", work_path.display());
        Ok(())
    }

    fn publish(self, combiner: Arc<dyn ObjectCombiner>) -> Result<CompleteBlock, BlockError> {
        let BlockWriter {
            mut meta,
            config,
            work_path,
            mut data,
            records,
            bloom,
            ..
        } = self;

        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(BlockError::Empty),
        };
        meta.min_id = first.id.clone();
        meta.max_id = last.id.clone();
        meta.total_objects = records.len() as u64;

        data.flush()?;
        data.get_ref().sync_all()?;
        drop(data);

        let index = downsample(&records, config.index_downsample)?;
        let mut index_bytes = Vec::new();
        encode_vec(&index, &mut index_bytes)?;
        write_checksummed_file(&work_path.join(INDEX_FILE), &index_bytes)?;
        write_checksummed_file(&work_path.join(BLOOM_FILE), &bloom.to_bytes())?;
        write_checksummed_file(&work_path.join(META_FILE), &encode_to_vec(&meta)?)?;
        sync_dir(&work_path)?;

        fs::create_dir_all(&config.blocks_dir)?;
        let dest = config
            .blocks_dir
            .join(block_name(&meta.block_id, &meta.tenant_id));
        if dest.exists() {
            return Err(BlockError::AlreadyPublished(meta.block_id));
        }
        fs::rename(&work_path, &dest)?;
        sync_dir(&config.blocks_dir)?;

        info!(
            "Published block {} (tenant {}, {} objects, {} index entries, level {})",
            meta.block_id,
            meta.tenant_id,
            meta.total_objects,
            index.len(),
            meta.compaction_level
        );

        Ok(CompleteBlock::from_parts(meta, index, bloom, dest, combiner))
    }
}
