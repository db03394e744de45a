use bytes::Bytes;

use crate::lazy_value::LazyValue;

/// Sequence numbers are stamped on every write and occupy 56 bits on the
/// wire; the top byte of the encoded tag carries the value kind.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 56) - 1;

/// A single internal record as seen by compaction.
///
/// The input stream hands these to the compaction iterator in internal-key
/// order: ascending user key, then descending sequence number, then
/// descending kind rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEntry {
    /// The user key bytes.
    pub key: Bytes,
    /// The sequence number of this entry.
    pub seq: u64,
    /// The payload, which may be a value, a merge operand, or a tombstone.
    pub value: EntryValue,
}

impl RowEntry {
    pub fn new(key: Bytes, seq: u64, value: EntryValue) -> Self {
        Self { key, seq, value }
    }

    /// Estimated in-memory size, used for progress accounting.
    pub(crate) fn estimated_size(&self) -> usize {
        self.key.len() + self.value.len() + std::mem::size_of::<u64>()
    }

    pub(crate) fn with_seq(self, seq: u64) -> Self {
        Self { seq, ..self }
    }

    #[cfg(test)]
    pub(crate) fn new_value(key: &[u8], value: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            seq,
            value: EntryValue::Put(LazyValue::inline(Bytes::copy_from_slice(value))),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_merge(key: &[u8], operand: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            seq,
            value: EntryValue::Merge(Bytes::copy_from_slice(operand)),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_tombstone(key: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            seq,
            value: EntryValue::Tombstone,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_single_tombstone(key: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            seq,
            value: EntryValue::SingleTombstone,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_range_tombstone(start: &[u8], end: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(start),
            seq,
            value: EntryValue::RangeTombstone {
                end_key: Bytes::copy_from_slice(end),
            },
        }
    }
}

/// The payload of a [`RowEntry`].
///
/// This is the entry kind passed to compaction for each record. A separated
/// ("blob index") value is a `Put` whose [`LazyValue`] is an indirection.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue {
    /// A regular value, inline or separated into a blob run.
    Put(LazyValue),
    /// A merge operand (used with merge operators).
    Merge(Bytes),
    /// A point deletion marker.
    Tombstone,
    /// A deletion marker that cancels exactly one matching Put.
    SingleTombstone,
    /// A deletion covering the user-key interval `[entry.key, end_key)`.
    RangeTombstone { end_key: Bytes },
}

#[allow(clippy::len_without_is_empty)]
impl EntryValue {
    /// Returns the length of the payload in bytes, or 0 for point tombstones.
    pub fn len(&self) -> usize {
        match self {
            EntryValue::Put(v) => v.len(),
            EntryValue::Merge(v) => v.len(),
            EntryValue::Tombstone | EntryValue::SingleTombstone => 0,
            EntryValue::RangeTombstone { end_key } => end_key.len(),
        }
    }

    /// Returns true for point and single tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, EntryValue::Tombstone | EntryValue::SingleTombstone)
    }

    /// Ordering rank used to break ties among entries with equal user key
    /// and sequence number; higher ranks sort first.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            EntryValue::RangeTombstone { .. } => 5,
            EntryValue::SingleTombstone => 4,
            EntryValue::Tombstone => 3,
            EntryValue::Merge(_) => 2,
            EntryValue::Put(_) => 1,
        }
    }
}
