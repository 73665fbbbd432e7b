//! Object framing and the iterators that decode it.
//!
//! # Frame layout
//!
//! ```text
//! [ID_LEN_LE u32][PAYLOAD_LEN_LE u32][ID_BYTES][PAYLOAD_BYTES][CRC32_LE]
//! ```
//!
//! The CRC covers both length fields, the ID and the payload. Frames carry
//! their own length, so a span of frames can be walked without knowing how
//! many objects it holds: the span length is authoritative.

use std::io::{self, Read};
use std::iter::Peekable;

use crc32fast::Hasher as Crc32;
use tracing::trace;

use crate::encoding::{Encode, MAX_BYTE_LEN, len_to_u32};

use super::{BlockError, CRC_SIZE, Object, ObjectCombiner};

pub(crate) const FRAME_HEADER_SIZE: usize = 8;

/// Bytes a frame adds around its ID and payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + CRC_SIZE;

// ------------------------------------------------------------------------------------------------
// Encode / decode
// ------------------------------------------------------------------------------------------------

/// Encodes one object as a checksummed frame.
pub fn encode_object(id: &[u8], payload: &[u8]) -> Result<Vec<u8>, BlockError> {
    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + id.len() + payload.len());
    len_to_u32(id.len())?.encode_to(&mut buf)?;
    len_to_u32(payload.len())?.encode_to(&mut buf)?;
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let checksum = hasher.finalize();
    checksum.encode_to(&mut buf)?;
    Ok(buf)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Total length of the frame starting at `buf[0]`, read from its header.
///
/// `None` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
pub(crate) fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let id_len = read_u32(buf, 0) as usize;
    let payload_len = read_u32(buf, 4) as usize;
    FRAME_OVERHEAD
        .checked_add(id_len)?
        .checked_add(payload_len)
}

/// Decodes the frame at the front of `buf`, returning the object and the
/// number of bytes it occupied.
pub fn decode_object(buf: &[u8]) -> Result<(Object, usize), BlockError> {
    let total = frame_len(buf).ok_or_else(|| {
        BlockError::Corrupt(format!("truncated frame header ({} bytes)", buf.len()))
    })?;

    let id_len = read_u32(buf, 0);
    let payload_len = read_u32(buf, 4);
    if id_len > MAX_BYTE_LEN || payload_len > MAX_BYTE_LEN {
        return Err(BlockError::Corrupt(format!(
            "frame lengths out of range (id {id_len}, payload {payload_len})"
        )));
    }
    if buf.len() < total {
        return Err(BlockError::Corrupt(format!(
            "truncated frame: need {total} bytes, have {}",
            buf.len()
        )));
    }

    let body_end = total - CRC_SIZE;
    let mut hasher = Crc32::new();
    hasher.update(&buf[..body_end]);
    if hasher.finalize() != read_u32(buf, body_end) {
        return Err(BlockError::ChecksumMismatch);
    }

    let id_end = FRAME_HEADER_SIZE + id_len as usize;
    let id = buf[FRAME_HEADER_SIZE..id_end].to_vec();
    let payload = buf[id_end..body_end].to_vec();
    Ok(((id, payload), total))
}

/// Offset of the first intact frame starting at or after `from`.
pub(crate) fn find_intact_frame(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find(|&at| decode_object(&buf[at..]).is_ok())
}

// ------------------------------------------------------------------------------------------------
// ObjectIter: walks the frames of an in-memory span
// ------------------------------------------------------------------------------------------------

/// Iterates the frames of a byte span, stopping cleanly at its end.
///
/// A frame that runs past the end of the span is corruption. The iterator
/// ends after yielding its first error.
pub struct ObjectIter<B> {
    buf: B,
    pos: usize,
    failed: bool,
}

impl<B: AsRef<[u8]>> ObjectIter<B> {
    pub fn new(buf: B) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }
}

impl<B: AsRef<[u8]>> Iterator for ObjectIter<B> {
    type Item = Result<Object, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.buf.as_ref();
        if self.failed || self.pos >= buf.len() {
            return None;
        }
        match decode_object(&buf[self.pos..]) {
            Ok((object, consumed)) => {
                self.pos += consumed;
                Some(Ok(object))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FrameReader: streams frames from a reader
// ------------------------------------------------------------------------------------------------

/// Maps a short read to a corruption error naming what was cut off.
fn truncated(e: io::Error, what: &str) -> BlockError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BlockError::Corrupt(format!("truncated {what}"))
    } else {
        BlockError::Io(e)
    }
}

/// Reads the next frame from `reader`. `Ok(None)` at a clean end of input.
pub fn read_object<R: Read>(reader: &mut R) -> Result<Option<Object>, BlockError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];

    // A clean end falls between frames: not even the first header byte.
    match reader.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            trace!("End of frames reached");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    reader
        .read_exact(&mut header[1..])
        .map_err(|e| truncated(e, "frame header"))?;

    let total = frame_len(&header)
        .ok_or_else(|| BlockError::Internal("frame header shorter than expected".into()))?;
    if read_u32(&header, 0) > MAX_BYTE_LEN || read_u32(&header, 4) > MAX_BYTE_LEN {
        return Err(BlockError::Corrupt("frame lengths out of range".into()));
    }

    let mut frame = vec![0u8; total];
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[FRAME_HEADER_SIZE..])
        .map_err(|e| truncated(e, &format!("frame of {total} bytes")))?;

    let (object, _) = decode_object(&frame)?;
    Ok(Some(object))
}

/// Iterator over the frames of a reader, in file order.
pub(crate) struct FrameReader<R> {
    reader: R,
    failed: bool,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Object, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match read_object(&mut self.reader) {
            Ok(Some(object)) => Some(Ok(object)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DedupingIterator
// ------------------------------------------------------------------------------------------------

/// Collapses runs of adjacent objects sharing an ID into one object whose
/// payload is folded left-to-right with the combiner.
///
/// An error from the inner iterator ends the current run; the error itself
/// is yielded on the following call.
pub struct DedupingIterator<'c, I>
where
    I: Iterator<Item = Result<Object, BlockError>>,
{
    inner: Peekable<I>,
    combiner: &'c dyn ObjectCombiner,
}

impl<'c, I> DedupingIterator<'c, I>
where
    I: Iterator<Item = Result<Object, BlockError>>,
{
    pub fn new(inner: I, combiner: &'c dyn ObjectCombiner) -> Self {
        Self {
            inner: inner.peekable(),
            combiner,
        }
    }
}

impl<I> Iterator for DedupingIterator<'_, I>
where
    I: Iterator<Item = Result<Object, BlockError>>,
{
    type Item = Result<Object, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, mut payload) = match self.inner.next()? {
            Ok(object) => object,
            Err(e) => return Some(Err(e)),
        };

        while let Some(Ok((next_id, _))) = self.inner.peek() {
            if *next_id != id {
                break;
            }
            if let Some(Ok((_, next_payload))) = self.inner.next() {
                payload = self.combiner.combine(&payload, &next_payload);
            }
        }

        Some(Ok((id, payload)))
    }
}
