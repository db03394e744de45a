use std::cmp::Ordering;

use bytes::Bytes;

use crate::comparator::ComparatorRef;
use crate::snapshot::SnapshotVector;
use crate::types::{EntryValue, RowEntry};

/// A tombstone covering every user key in `[start_key, end_key)` whose
/// sequence number is at or below `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeTombstone {
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub seq: u64,
}

impl RangeTombstone {
    pub(crate) fn to_entry(&self) -> RowEntry {
        RowEntry::new(
            self.start_key.clone(),
            self.seq,
            EntryValue::RangeTombstone {
                end_key: self.end_key.clone(),
            },
        )
    }
}

/// Query mode for [`RangeDelAggregator::should_delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDelMode {
    /// A record may only be dropped when the covering tombstone sits in the
    /// same snapshot stratum, so no live snapshot loses sight of it.
    ForCompaction,
    /// Pure coverage: any covering tombstone with a sequence at or above the
    /// record's hides it.
    ForReadTree,
}

/// The union of range tombstones observed in a subcompaction's inputs.
///
/// Tombstones are held sorted by start key (then descending seq); coverage
/// queries binary-search the start position and scan the short candidate
/// prefix backwards. Compaction keys move forward monotonically, so lookups
/// stay amortized logarithmic.
pub struct RangeDelAggregator {
    tombstones: Vec<RangeTombstone>,
    snapshots: SnapshotVector,
    comparator: ComparatorRef,
}

impl RangeDelAggregator {
    pub fn new(snapshots: SnapshotVector, comparator: ComparatorRef) -> Self {
        Self {
            tombstones: Vec::new(),
            snapshots,
            comparator,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    /// Records a tombstone seen while scanning the input.
    pub fn add_tombstone(&mut self, tombstone: RangeTombstone) {
        if self
            .comparator
            .compare(&tombstone.start_key, &tombstone.end_key)
            != Ordering::Less
        {
            // empty interval, nothing to cover
            return;
        }
        let pos = self.tombstones.partition_point(|t| {
            match self.comparator.compare(&t.start_key, &tombstone.start_key) {
                Ordering::Less => true,
                Ordering::Equal => t.seq > tombstone.seq,
                Ordering::Greater => false,
            }
        });
        self.tombstones.insert(pos, tombstone);
    }

    /// Whether `(key, seq)` is covered by some recorded tombstone under the
    /// given mode.
    pub fn should_delete(&self, key: &[u8], seq: u64, mode: RangeDelMode) -> bool {
        let end = self
            .tombstones
            .partition_point(|t| self.comparator.compare(&t.start_key, key) != Ordering::Greater);
        self.tombstones[..end].iter().rev().any(|t| {
            if self.comparator.compare(key, &t.end_key) != Ordering::Less || seq > t.seq {
                return false;
            }
            match mode {
                RangeDelMode::ForReadTree => true,
                RangeDelMode::ForCompaction => {
                    self.snapshots.earliest_visible(seq).0 == self.snapshots.earliest_visible(t.seq).0
                }
            }
        })
    }

    /// The tombstones each output run of this subcompaction must embed.
    ///
    /// On the bottommost level a tombstone is dropped once no snapshot lies
    /// below its sequence: everything it covered was either dropped in this
    /// compaction or shadowed within its own stratum.
    pub fn tombstones_for_output(&self, bottommost: bool) -> Vec<RangeTombstone> {
        self.tombstones
            .iter()
            .filter(|t| {
                if !bottommost {
                    return true;
                }
                self.snapshots.earliest().is_some_and(|s| s < t.seq)
            })
            .cloned()
            .collect()
    }
}
