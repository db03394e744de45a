use std::cmp::Ordering;

use bytes::Bytes;

use crate::blob_store::ValueSeparation;
use crate::comparator::ComparatorRef;
use crate::error::BasaltError;
use crate::iter::EntryIterator;
use crate::lazy_value::LazyValue;
use crate::merge_operator::MergeOperatorType;
use crate::peeking_iterator::PeekingIterator;
use crate::snapshot::SnapshotVector;
use crate::types::{EntryValue, RowEntry};

/// Outcome of collapsing one run of merge operands.
#[derive(Debug)]
pub(crate) struct MergeResolution {
    /// Records to emit, newest first.
    pub(crate) resolved: Vec<RowEntry>,
    /// Merge operands consumed from the input (including the triggering
    /// record).
    pub(crate) operand_count: u64,
    /// Sequence of the oldest input record consumed; the iterator resumes
    /// its group state from here.
    pub(crate) last_consumed_seq: u64,
}

/// Collapses contiguous same-key merge-operand runs into resolved records.
///
/// A run never collapses across a snapshot boundary: operands visible to an
/// older snapshot stay behind for their own resolution round, so every
/// snapshot still folds exactly the operands it can see.
pub(crate) struct MergeHelper {
    operator: Option<MergeOperatorType>,
    comparator: ComparatorRef,
    snapshots: SnapshotVector,
}

impl MergeHelper {
    pub(crate) fn new(
        operator: Option<MergeOperatorType>,
        comparator: ComparatorRef,
        snapshots: SnapshotVector,
    ) -> Self {
        Self {
            operator,
            comparator,
            snapshots,
        }
    }

    /// Consumes `first` (a merge operand) plus every following same-key
    /// record in the same snapshot stratum, up to and including an optional
    /// base record, and folds them.
    ///
    /// `bottommost` widens the partial-merge case: when the run ends with no
    /// base and no same-key input remains, there can be no older value below
    /// the output level, so the fold becomes a full value.
    pub(crate) async fn merge_until<T: EntryIterator>(
        &self,
        first: RowEntry,
        input: &mut PeekingIterator<T>,
        bottommost: bool,
        combiner: Option<&dyn ValueSeparation>,
    ) -> Result<MergeResolution, BasaltError> {
        let operator = self
            .operator
            .as_ref()
            .ok_or(BasaltError::MergeOperatorNotSupported)?;

        let key = first.key.clone();
        let newest_seq = first.seq;
        let bucket = self.snapshots.earliest_visible(first.seq).0;
        let first_operand = match first.value {
            EntryValue::Merge(op) => op,
            _ => {
                return Err(BasaltError::InvalidRecord {
                    msg: "merge_until called on a non-merge record".to_string(),
                })
            }
        };

        // newest first, matching input order
        let mut operands: Vec<Bytes> = vec![first_operand];
        let mut last_consumed_seq = newest_seq;
        let mut base: Option<RowEntry> = None;
        let mut stopped_at_boundary = false;

        loop {
            let stop = match input.peek().await? {
                None => true,
                Some(entry) => {
                    if self.comparator.compare(&entry.key, &key) != Ordering::Equal {
                        true
                    } else if matches!(entry.value, EntryValue::RangeTombstone { .. }) {
                        // not part of the point-record group; the aggregator
                        // will pick it up
                        true
                    } else if self.snapshots.earliest_visible(entry.seq).0 != bucket {
                        stopped_at_boundary = true;
                        true
                    } else {
                        false
                    }
                }
            };
            if stop {
                break;
            }
            let entry = input
                .next_entry()
                .await?
                .expect("peeked entry disappeared");
            last_consumed_seq = entry.seq;
            match entry.value {
                EntryValue::Merge(op) => operands.push(op),
                _ => {
                    base = Some(entry);
                    break;
                }
            }
        }

        let mut acc: Option<Bytes> = match &base {
            Some(RowEntry {
                value: EntryValue::Put(lazy),
                ..
            }) => Some(self.materialize(lazy, combiner).await?),
            _ => None,
        };
        let operand_count = operands.len() as u64;
        for operand in operands.into_iter().rev() {
            acc = Some(operator.merge(&key, acc, operand)?);
        }
        let folded = acc.expect("merge fold over non-empty operands");

        let base_is_put = matches!(
            base,
            Some(RowEntry {
                value: EntryValue::Put(_),
                ..
            })
        );
        let base_is_tombstone = base.as_ref().is_some_and(|b| b.value.is_tombstone());
        let full = base_is_put || base_is_tombstone || (bottommost && !stopped_at_boundary);
        let resolved_value = if full {
            EntryValue::Put(LazyValue::inline(folded))
        } else {
            EntryValue::Merge(folded)
        };

        let mut resolved = vec![RowEntry::new(key, newest_seq, resolved_value)];
        if base_is_tombstone && !bottommost {
            // the tombstone still shadows older data below the output level
            resolved.push(base.expect("tombstone base"));
        }

        Ok(MergeResolution {
            resolved,
            operand_count,
            last_consumed_seq,
        })
    }

    async fn materialize(
        &self,
        lazy: &LazyValue,
        combiner: Option<&dyn ValueSeparation>,
    ) -> Result<Bytes, BasaltError> {
        match lazy {
            LazyValue::Inline(bytes) => Ok(bytes.clone()),
            LazyValue::Indirect(blob_ref) => match combiner {
                Some(combiner) => combiner.combine(*blob_ref).await,
                None => Err(BasaltError::InvalidRecord {
                    msg: "separated merge base without a blob store".to_string(),
                }),
            },
        }
    }
}
