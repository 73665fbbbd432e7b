//! Block metadata shared by head blocks, complete blocks and the
//! compaction selector.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::encoding::{Decode, Encode, EncodingError};

/// Descriptive metadata of one block.
///
/// Times are nanoseconds since the Unix epoch. `min_id`/`max_id` are the
/// smallest and largest object IDs under unsigned byte-wise ordering, which
/// for a sealed block are its first and last objects.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    pub block_id: Uuid,
    pub tenant_id: String,
    pub min_id: Vec<u8>,
    pub max_id: Vec<u8>,
    pub start_time: u64,
    pub end_time: u64,
    /// Objects written into the block, duplicates included.
    pub total_objects: u64,
    /// 0 for freshly sealed blocks, +1 per merge generation.
    pub compaction_level: u32,
    pub bloom_false_positive_rate: f64,
}

impl BlockMeta {
    /// Metadata of an empty block.
    pub fn new(block_id: Uuid, tenant_id: impl Into<String>) -> Self {
        Self {
            block_id,
            tenant_id: tenant_id.into(),
            min_id: Vec::new(),
            max_id: Vec::new(),
            start_time: 0,
            end_time: 0,
            total_objects: 0,
            compaction_level: 0,
            bloom_false_positive_rate: 0.0,
        }
    }

    /// Accounts for one more object with `id` written at `at`.
    pub fn object_added(&mut self, id: &[u8], at: u64) {
        if self.total_objects == 0 {
            self.min_id = id.to_vec();
            self.max_id = id.to_vec();
            self.start_time = at;
            self.end_time = at;
        } else {
            if id < self.min_id.as_slice() {
                self.min_id = id.to_vec();
            }
            if id > self.max_id.as_slice() {
                self.max_id = id.to_vec();
            }
            self.start_time = self.start_time.min(at);
            self.end_time = self.end_time.max(at);
        }
        self.total_objects += 1;
    }
}

/// Converts a wall-clock instant to Unix nanoseconds, clamping instants
/// before the epoch to zero.
pub fn unix_nanos(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> u64 {
    unix_nanos(SystemTime::now())
}

impl Encode for BlockMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.block_id.encode_to(buf)?;
        self.tenant_id.encode_to(buf)?;
        self.min_id.encode_to(buf)?;
        self.max_id.encode_to(buf)?;
        self.start_time.encode_to(buf)?;
        self.end_time.encode_to(buf)?;
        self.total_objects.encode_to(buf)?;
        self.compaction_level.encode_to(buf)?;
        self.bloom_false_positive_rate.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (block_id, n) = Uuid::decode_from(&buf[off..])?;
        off += n;
        let (tenant_id, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (min_id, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (max_id, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (start_time, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (end_time, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (total_objects, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (compaction_level, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (bloom_false_positive_rate, n) = f64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                block_id,
                tenant_id,
                min_id,
                max_id,
                start_time,
                end_time,
                total_objects,
                compaction_level,
                bloom_false_positive_rate,
            },
            off,
        ))
    }
}
