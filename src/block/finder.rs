//! Deduplicating point lookup.
//!
//! The same logical object (for example a trace whose spans arrived in
//! separate writes) may be stored several times under one ID. Lookups merge
//! every stored copy into a single payload with an [`ObjectCombiner`].
//!
//! Merging happens at two levels:
//!
//! 1. **Within a span:** the frames covered by one record are decoded and
//!    adjacent duplicates are folded together by a [`DedupingIterator`].
//! 2. **Across spans:** a run of one ID can cross a record boundary, so the
//!    search keeps reading forward while the run may continue and folds
//!    each span's result into the accumulated payload.

use tracing::trace;

use super::{
    BlockError, DedupingIterator, ReadAt, Record,
    object::ObjectIter,
    record::search,
};

/// Merges two payloads stored under the same ID.
///
/// Repeated application over any split of a run of duplicates must give the
/// same logical result; lookups rely on it when a run spans several reads.
pub trait ObjectCombiner: Send + Sync {
    fn combine(&self, existing: &[u8], incoming: &[u8]) -> Vec<u8>;
}

/// Point lookup by ID.
pub trait Finder {
    /// Returns the combined payload of every object with `id`, or `None`.
    fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError>;
}

/// Point lookup over a record list and the data store it addresses.
pub struct DedupingFinder<'a, R: ReadAt + ?Sized> {
    records: &'a [Record],
    reader: &'a R,
    combiner: &'a dyn ObjectCombiner,
    sorted: bool,
}

impl<'a, R: ReadAt + ?Sized> DedupingFinder<'a, R> {
    /// Lookup over ID-sorted records: a sparse index whose entries carry
    /// the largest ID of their span, or a sorted list of single objects.
    pub fn sorted(records: &'a [Record], reader: &'a R, combiner: &'a dyn ObjectCombiner) -> Self {
        Self {
            records,
            reader,
            combiner,
            sorted: true,
        }
    }

    /// Lookup over records in write order, one object per record. Scans the
    /// whole list, so duplicates fold in the order they were written.
    pub fn unsorted(
        records: &'a [Record],
        reader: &'a R,
        combiner: &'a dyn ObjectCombiner,
    ) -> Self {
        Self {
            records,
            reader,
            combiner,
            sorted: false,
        }
    }

    fn accumulate(&self, acc: Option<Vec<u8>>, next: Vec<u8>) -> Vec<u8> {
        match acc {
            Some(existing) => self.combiner.combine(&existing, &next),
            None => next,
        }
    }

    /// Reads one span and returns the merged payload for `id` inside it.
    fn find_in_span(&self, id: &[u8], record: &Record) -> Result<Option<Vec<u8>>, BlockError> {
        let buf = self.reader.read_at(record.start, record.length as usize)?;
        let objects = DedupingIterator::new(ObjectIter::new(buf), self.combiner);

        for object in objects {
            let (found, payload) = object?;
            if found.as_slice() == id {
                return Ok(Some(payload));
            }
            if self.sorted && found.as_slice() > id {
                break;
            }
        }
        Ok(None)
    }

    fn find_sorted(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        let mut i = search(self.records, id);
        let mut found: Option<Vec<u8>> = None;

        while let Some(record) = self.records.get(i) {
            match self.find_in_span(id, record)? {
                Some(payload) => found = Some(self.accumulate(found, payload)),
                None => break,
            }
            // A span whose largest ID is past the target holds the end of
            // the run.
            if record.id.as_slice() != id {
                break;
            }
            i += 1;
        }

        trace!(stop_index = i, hit = found.is_some(), "sorted find");
        Ok(found)
    }

    fn find_unsorted(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        let mut found: Option<Vec<u8>> = None;
        for record in self.records.iter().filter(|r| r.id.as_slice() == id) {
            if let Some(payload) = self.find_in_span(id, record)? {
                found = Some(self.accumulate(found, payload));
            }
        }
        Ok(found)
    }
}

impl<R: ReadAt + ?Sized> Finder for DedupingFinder<'_, R> {
    fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        if self.sorted {
            self.find_sorted(id)
        } else {
            self.find_unsorted(id)
        }
    }
}
