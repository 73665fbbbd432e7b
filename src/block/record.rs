//! Records and the sparse index built from them.
//!
//! The helpers here are pure: they take a record list and return a new one,
//! so concurrent completions of different blocks share no state.

use crate::encoding::{Decode, Encode, EncodingError};

use super::BlockError;

/// Addresses `length` bytes of frames starting at `start` in a block's data
/// file. In a sparse index `id` is the largest ID within that span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Vec<u8>,
    pub start: u64,
    pub length: u32,
}

impl Record {
    /// Offset one past the last byte of the span.
    pub fn end(&self) -> u64 {
        self.start + u64::from(self.length)
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.start.encode_to(buf)?;
        self.length.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, mut off) = Vec::<u8>::decode_from(buf)?;
        let (start, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (length, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { id, start, length }, off))
    }
}

/// Index of the first record whose ID is `>= id` (`records.len()` if none).
pub fn search(records: &[Record], id: &[u8]) -> usize {
    records.partition_point(|r| r.id.as_slice() < id)
}

/// Stable sort by ID: duplicates keep their write order.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| a.id.cmp(&b.id));
}

/// `true` when IDs never decrease and spans never overlap.
pub fn is_sorted(records: &[Record]) -> bool {
    records
        .windows(2)
        .all(|w| w[0].id <= w[1].id && w[0].end() <= w[1].start)
}

/// Builds a sparse index over `records`, which must be ID-sorted and laid
/// out back to back in the data file.
///
/// Every `factor` consecutive records collapse into one entry carrying the
/// last ID of the group, the first record's start and the combined length.
/// A trailing partial group gets its own entry, so the result has
/// `ceil(n / factor)` entries.
pub fn downsample(records: &[Record], factor: usize) -> Result<Vec<Record>, BlockError> {
    if factor == 0 {
        return Err(BlockError::InvalidArgument(
            "index downsample factor must be >= 1".into(),
        ));
    }

    records
        .chunks(factor)
        .map(|chunk| {
            let (first, last) = match (chunk.first(), chunk.last()) {
                (Some(first), Some(last)) => (first, last),
                _ => return Err(BlockError::Internal("empty index chunk".into())),
            };
            let span = last.end().saturating_sub(first.start);
            let length = u32::try_from(span).map_err(|_| {
                BlockError::InvalidArgument(format!(
                    "index span of {span} bytes exceeds u32::MAX; lower the downsample factor"
                ))
            })?;
            Ok(Record {
                id: last.id.clone(),
                start: first.start,
                length,
            })
        })
        .collect()
}
