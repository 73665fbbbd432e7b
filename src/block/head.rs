//! Head block: the mutable, append-only write-ahead block.
//!
//! # Lifecycle
//!
//! ```text
//! Empty ──write──▶ Writable ──complete──▶ Sealed ──▶ CompleteBlock
//! ```
//!
//! Writes append one frame per object to `<wal>/{BlockID}-{TenantID}` and
//! record `(id, start, length)` in write order. Nothing is sorted until
//! [`HeadBlock::complete`], which seals the block and streams its objects
//! into a new [`CompleteBlock`] in ID order. Once sealed, writes are
//! rejected and the head file is never touched again; it stays readable
//! until [`HeadBlock::discard`] removes it.
//!
//! # Concurrency model
//!
//! - Appends are serialized by a mutex around the file handle.
//! - A record is published only after its bytes were written (and synced,
//!   under [`SyncPolicy::Always`]), so a reader that snapshots the record
//!   list never reaches a byte that is not on disk.
//! - `find` and `iter` open their own read handles.
//!
//! # Recovery
//!
//! [`HeadBlock::recover`] replays an existing head file. A torn final frame
//! (crash mid-append) is truncated away. Damage anywhere else, including a
//! length field that points past the end while intact frames follow, is
//! reported as corruption and the file is left untouched.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    Block, BlockConfig, BlockError, BlockIter, BlockMeta, BlockWriter, Cancellable, Cancellation,
    CompleteBlock, DedupingFinder, Finder, ObjectCombiner, ReadAt, Record, block_name,
    meta::{now_nanos, unix_nanos},
    object::{FrameReader, decode_object, encode_object, find_intact_frame, frame_len},
    parse_block_name,
    record::sort_records,
};

// ------------------------------------------------------------------------------------------------
// SyncPolicy
// ------------------------------------------------------------------------------------------------

/// When head-block appends reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// `fdatasync` after every write.
    #[default]
    Always,

    /// Sync once, when the block is completed.
    OnComplete,
}

// ------------------------------------------------------------------------------------------------
// HeadBlock
// ------------------------------------------------------------------------------------------------

/// Append side of a head file: the handle and the length of its valid
/// prefix.
pub(crate) struct Appender {
    file: File,
    offset: u64,
    /// Set when a failed append could not be rolled back. The file may then
    /// end in a partial frame that `offset` does not cover.
    broken: bool,
}

impl Appender {
    pub(crate) fn new(file: File, offset: u64) -> Self {
        Self {
            file,
            offset,
            broken: false,
        }
    }

    /// Appends `frame`, returning the offset it starts at.
    ///
    /// On failure the file is truncated back to its previous length. If that
    /// truncation fails as well the appender is marked broken and refuses
    /// every later append.
    pub(crate) fn append(&mut self, frame: &[u8], sync: SyncPolicy) -> io::Result<u64> {
        if self.broken {
            return Err(io::Error::other(
                "head file holds a partial frame from an earlier failed append",
            ));
        }

        let start = self.offset;
        let written = self.file.write_all(frame).and_then(|()| match sync {
            SyncPolicy::Always => self.file.sync_data(),
            SyncPolicy::OnComplete => Ok(()),
        });
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(start) {
                error!("Failed to roll back head file append at offset {start}: {rollback}");
                self.broken = true;
            }
            return Err(e);
        }

        self.offset += frame.len() as u64;
        Ok(start)
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }
}

/// A mutable block accepting appends.
pub struct HeadBlock {
    path: PathBuf,
    meta: RwLock<BlockMeta>,
    /// One record per frame, in write order.
    records: RwLock<Vec<Record>>,
    appender: Mutex<Appender>,
    sealed: AtomicBool,
    sync: SyncPolicy,
    combiner: Arc<dyn ObjectCombiner>,
}

fn poisoned<T>(_: T) -> BlockError {
    BlockError::Internal("head block lock poisoned".into())
}

impl HeadBlock {
    /// Creates an empty head block file in `dir`.
    pub fn create(
        dir: impl AsRef<Path>,
        block_id: Uuid,
        tenant_id: &str,
        sync: SyncPolicy,
        combiner: Arc<dyn ObjectCombiner>,
    ) -> Result<Self, BlockError> {
        let path = dir.as_ref().join(block_name(&block_id, tenant_id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)?;

        info!("Created head block {} at {}", block_id, path.display());

        Ok(Self {
            path,
            meta: RwLock::new(BlockMeta::new(block_id, tenant_id)),
            records: RwLock::new(Vec::new()),
            appender: Mutex::new(Appender::new(file, 0)),
            sealed: AtomicBool::new(false),
            sync,
            combiner,
        })
    }

    /// Reopens a head block file, rebuilding its records and metadata.
    ///
    /// Write times are not persisted per object, so a recovered block's
    /// start and end times are the file's modification time.
    pub fn recover(
        path: impl AsRef<Path>,
        sync: SyncPolicy,
        combiner: Arc<dyn ObjectCombiner>,
    ) -> Result<Self, BlockError> {
        let path = path.as_ref();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let (block_id, tenant_id) = parse_block_name(name).ok_or_else(|| {
            BlockError::Corrupt(format!("unrecognized head block file name {name:?}"))
        })?;

        let file = OpenOptions::new().read(true).append(true).open(path)?;
        let modified = unix_nanos(file.metadata()?.modified()?);

        let mut buf = Vec::new();
        (&file).read_to_end(&mut buf)?;

        let mut meta = BlockMeta::new(block_id, tenant_id);
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            match decode_object(&buf[pos..]) {
                Ok(((id, _), consumed)) => {
                    meta.object_added(&id, modified);
                    records.push(Record {
                        id,
                        start: pos as u64,
                        length: consumed as u32,
                    });
                    pos += consumed;
                }
                Err(e) => {
                    let reaches_end = frame_len(&buf[pos..])
                        .is_none_or(|len| pos.saturating_add(len) >= buf.len());
                    if !reaches_end {
                        return Err(e);
                    }
                    // A damaged length field can also point past the end;
                    // only a frame with nothing intact behind it is torn.
                    if let Some(next) = find_intact_frame(&buf, pos + 1) {
                        return Err(BlockError::Corrupt(format!(
                            "damaged frame at offset {pos} of {} is followed by an intact \
                             frame at offset {next}: {e}",
                            path.display()
                        )));
                    }
                    warn!(
                        "Truncating torn tail of head block {} at offset {pos} ({} bytes): {e}",
                        path.display(),
                        buf.len() - pos
                    );
                    file.set_len(pos as u64)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        info!(
            "Recovered head block {} with {} objects",
            block_id,
            records.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            meta: RwLock::new(meta),
            records: RwLock::new(records),
            appender: Mutex::new(Appender::new(file, pos as u64)),
            sealed: AtomicBool::new(false),
            sync,
            combiner,
        })
    }

    fn lock_appender(&self) -> Result<MutexGuard<'_, Appender>, BlockError> {
        self.appender.lock().map_err(poisoned)
    }

    /// Appends one object.
    ///
    /// On failure the file is truncated back to its previous length, so a
    /// failed write leaves no partial frame behind. If the truncation fails
    /// too, the block is sealed: later writes get [`BlockError::Sealed`] and
    /// the objects written so far can still be completed.
    pub fn write(&self, id: &[u8], payload: &[u8]) -> Result<(), BlockError> {
        let frame = encode_object(id, payload)?;
        let length = u32::try_from(frame.len()).map_err(|_| {
            BlockError::InvalidArgument(format!("object of {} bytes is too large", frame.len()))
        })?;

        let mut appender = self.lock_appender()?;
        if self.sealed.load(Ordering::Acquire) {
            return Err(BlockError::Sealed);
        }

        let start = match appender.append(&frame, self.sync) {
            Ok(start) => start,
            Err(e) => {
                if appender.is_broken() {
                    // objects already recorded stay readable and completable
                    self.sealed.store(true, Ordering::Release);
                    warn!("Sealed head block {} after a failed append", self.path.display());
                }
                return Err(e.into());
            }
        };

        self.records.write().map_err(poisoned)?.push(Record {
            id: id.to_vec(),
            start,
            length,
        });
        self.meta
            .write()
            .map_err(poisoned)?
            .object_added(id, now_nanos());

        trace!(start, length, "head block append");
        Ok(())
    }

    /// Seals the block and builds the sorted, indexed [`CompleteBlock`].
    ///
    /// Objects are ordered by ID; duplicates keep their write order. The
    /// head file is left intact whatever the outcome, so a failed
    /// completion can be retried; a retry after success fails with
    /// [`BlockError::AlreadyPublished`].
    pub fn complete(&self, config: &BlockConfig) -> Result<CompleteBlock, BlockError> {
        {
            let appender = self.lock_appender()?;
            if self.records.read().map_err(poisoned)?.is_empty() {
                return Err(BlockError::Empty);
            }
            self.sealed.store(true, Ordering::Release);
            if self.sync == SyncPolicy::OnComplete {
                appender.file.sync_data()?;
            }
        }

        let mut sorted = self.records();
        sort_records(&mut sorted);
        let head_meta = self.meta();

        let template = BlockMeta {
            compaction_level: 0,
            ..head_meta.clone()
        };
        let mut writer = BlockWriter::create(template, config.clone(), sorted.len())?;

        let copied = File::open(&self.path).map_err(BlockError::from).and_then(|file| {
            for record in &sorted {
                let frame = file.read_at(record.start, record.length as usize)?;
                let ((id, payload), _) = decode_object(&frame)?;
                writer.append(&id, &payload)?;
            }
            Ok(())
        });
        if let Err(e) = copied {
            if let Err(cleanup) = writer.abort() {
                warn!("Failed to clean up aborted block build: {cleanup}");
            }
            return Err(e);
        }

        let complete = writer.finish(Arc::clone(&self.combiner))?;
        debug!(
            "Completed head block {} into {}",
            head_meta.block_id,
            complete.dir().display()
        );
        Ok(complete)
    }

    /// Removes the head file. Call once the completed block is published.
    pub fn discard(self) -> Result<(), BlockError> {
        let HeadBlock { path, appender, .. } = self;
        drop(appender);
        fs::remove_file(&path)?;
        debug!("Discarded head block file {}", path.display());
        Ok(())
    }

    /// Snapshot of the records, in write order.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Block for HeadBlock {
    fn meta(&self) -> BlockMeta {
        self.meta.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        let records = self.records();
        if records.is_empty() {
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        DedupingFinder::unsorted(&records, &file, self.combiner.as_ref()).find(id)
    }

    fn iter(&self, cancel: Cancellation) -> Result<BlockIter, BlockError> {
        let end = self.records().last().map(Record::end).unwrap_or(0);
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file).take(end);
        Ok(Box::new(Cancellable::new(FrameReader::new(reader), cancel)))
    }
}

impl fmt::Debug for HeadBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadBlock")
            .field("path", &self.path)
            .field("objects", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
