//! Immutable, published block.

use std::{
    fmt,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::encoding::{decode_from_slice, decode_vec, encode_to_vec};

use super::{
    BLOOM_FILE, Block, BlockError, BlockIter, BlockMeta, BloomFilter, COMPACTED_FILE, Cancellable,
    Cancellation, DATA_FILE, DedupingFinder, Finder, INDEX_FILE, META_FILE, ObjectCombiner,
    Record, block_name, bloom::fingerprint, object::ObjectIter, read_checksummed_file, sync_dir,
    write_checksummed_file,
};

/// A sealed block: ID-sorted data, sparse index, bloom filter and metadata.
///
/// The index, bloom filter and metadata are held in memory; the data file
/// is opened per lookup and memory-mapped per iteration.
pub struct CompleteBlock {
    meta: BlockMeta,
    index: Vec<Record>,
    bloom: BloomFilter,
    dir: PathBuf,
    combiner: Arc<dyn ObjectCombiner>,
}

impl CompleteBlock {
    pub(crate) fn from_parts(
        meta: BlockMeta,
        index: Vec<Record>,
        bloom: BloomFilter,
        dir: PathBuf,
        combiner: Arc<dyn ObjectCombiner>,
    ) -> Self {
        Self {
            meta,
            index,
            bloom,
            dir,
            combiner,
        }
    }

    /// Opens a published block directory.
    ///
    /// Every companion file is checksum-verified, and the directory name
    /// must match the stored block and tenant IDs.
    pub fn open(dir: impl AsRef<Path>, combiner: Arc<dyn ObjectCombiner>) -> Result<Self, BlockError> {
        let dir = dir.as_ref();

        let (meta, _) = decode_from_slice::<BlockMeta>(&read_checksummed_file(
            &dir.join(META_FILE),
        )?)?;
        let (index, _) = decode_vec::<Record>(&read_checksummed_file(&dir.join(INDEX_FILE))?)?;
        let bloom = BloomFilter::from_bytes(&read_checksummed_file(&dir.join(BLOOM_FILE))?)?;

        let expected = block_name(&meta.block_id, &meta.tenant_id);
        let actual = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if actual != expected {
            return Err(BlockError::Corrupt(format!(
                "block directory {actual} holds metadata for {expected}"
            )));
        }

        debug!(
            "Opened block {} ({} objects, {} index entries)",
            meta.block_id,
            meta.total_objects,
            index.len()
        );

        Ok(Self {
            meta,
            index,
            bloom,
            dir: dir.to_path_buf(),
            combiner,
        })
    }

    pub fn block_meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// The sparse index: one entry per span, carrying the span's largest ID.
    pub fn records(&self) -> &[Record] {
        &self.index
    }

    /// Bloom filter over the fingerprints of every stored ID.
    pub fn bloom_filter(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records that this block has been superseded by a merge at `at`
    /// (Unix nanos). The block's own files are left untouched.
    pub fn mark_compacted(&self, at: u64) -> Result<(), BlockError> {
        let path = self.dir.join(COMPACTED_FILE);
        let tmp = self.dir.join(format!("{COMPACTED_FILE}.tmp"));
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        write_checksummed_file(&tmp, &encode_to_vec(&at)?)?;
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        debug!("Marked block {} compacted at {at}", self.meta.block_id);
        Ok(())
    }

    /// When the block was marked compacted, if it was.
    pub fn compacted_at(&self) -> Result<Option<u64>, BlockError> {
        let path = self.dir.join(COMPACTED_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let (at, _) = decode_from_slice::<u64>(&read_checksummed_file(&path)?)?;
        Ok(Some(at))
    }
}

impl Block for CompleteBlock {
    fn meta(&self) -> BlockMeta {
        self.meta.clone()
    }

    fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        if !self.bloom.has(fingerprint(id)) {
            trace!("bloom rejects lookup in block {}", self.meta.block_id);
            return Ok(None);
        }
        let file = File::open(self.dir.join(DATA_FILE))?;
        DedupingFinder::sorted(&self.index, &file, self.combiner.as_ref()).find(id)
    }

    fn iter(&self, cancel: Cancellation) -> Result<BlockIter, BlockError> {
        let file = File::open(self.dir.join(DATA_FILE))?;

        // SAFETY: published data files are never written again, and the
        // map is read-only.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Box::new(Cancellable::new(ObjectIter::new(mmap), cancel)))
    }
}

impl fmt::Debug for CompleteBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompleteBlock")
            .field("meta", &self.meta)
            .field("index_entries", &self.index.len())
            .field("dir", &self.dir)
            .finish()
    }
}
