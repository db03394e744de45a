use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::blob_store::ValueSeparation;
use crate::blob_format::PlacementHint;
use crate::compaction::{CompactionView, SeparationType};
use crate::error::BasaltError;
use crate::iter::EntryIterator;
use crate::lazy_value::{BlobRef, LazyValue};
use crate::merge_operator::{MergeOperator, MergeOperatorError};
use crate::types::{EntryValue, RowEntry};

/// Asserts that the iterator returns exactly the expected entries in order.
pub(crate) async fn assert_iterator<T: EntryIterator>(iterator: &mut T, entries: Vec<RowEntry>) {
    iterator
        .init()
        .await
        .expect("iterator init failed in assert_iterator");
    for expected_entry in entries.iter() {
        assert_next_entry(iterator, expected_entry).await;
    }
    assert!(iterator
        .next_entry()
        .await
        .expect("iterator next_entry failed")
        .is_none());
}

pub(crate) async fn assert_next_entry<T: EntryIterator>(
    iterator: &mut T,
    expected_entry: &RowEntry,
) {
    iterator
        .init()
        .await
        .expect("iterator init failed in assert_next_entry");
    let actual_entry = iterator
        .next_entry()
        .await
        .expect("iterator next_entry failed")
        .expect("expected iterator to return a value");
    assert_eq!(actual_entry, expected_entry.clone())
}

pub(crate) struct TestIterator {
    entries: VecDeque<Result<RowEntry, BasaltError>>,
}

impl TestIterator {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn with_entry(self, key: &[u8], val: &[u8], seq: u64) -> Self {
        self.with_row_entry(RowEntry::new_value(key, val, seq))
    }

    pub(crate) fn with_row_entry(mut self, entry: RowEntry) -> Self {
        self.entries.push_back(Ok(entry));
        self
    }
}

#[async_trait]
impl EntryIterator for TestIterator {
    async fn init(&mut self) -> Result<(), BasaltError> {
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        self.entries.pop_front().map_or(Ok(None), |e| match e {
            Ok(kv) => Ok(Some(kv)),
            Err(err) => Err(err),
        })
    }

    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError> {
        while let Some(entry_result) = self.entries.front() {
            let entry = entry_result.clone()?;
            if entry.key < next_key {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        Ok(())
    }
}

pub(crate) fn gen_rand_bytes(n: usize) -> Bytes {
    use rand::Rng;
    let mut rng = rand::rng();
    let random_bytes: Vec<u8> = (0..n).map(|_| rng.random::<u8>()).collect();
    Bytes::from(random_bytes)
}

/// Merge operator over decimal-encoded integers; operands add.
pub(crate) struct IntAddMergeOperator;

impl MergeOperator for IntAddMergeOperator {
    fn merge(
        &self,
        _key: &Bytes,
        existing_value: Option<Bytes>,
        operand: Bytes,
    ) -> Result<Bytes, MergeOperatorError> {
        let parse = |bytes: &Bytes| -> Result<i64, MergeOperatorError> {
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| MergeOperatorError::OperandsIncompatible {
                    msg: format!("not an integer: {bytes:?}"),
                })
        };
        let existing = existing_value.as_ref().map(parse).transpose()?.unwrap_or(0);
        let operand = parse(&operand)?;
        Ok(Bytes::from((existing + operand).to_string()))
    }
}

/// Hand-rolled [`CompactionView`] for iterator tests.
pub(crate) struct TestCompactionView {
    level: u32,
    bottommost: bool,
    number_levels: u32,
    allow_ingest_behind: bool,
    preserve_deletes: bool,
    preserve_deletes_seqnum: u64,
    separation: SeparationType,
    key_beyond_output_level: bool,
}

impl TestCompactionView {
    pub(crate) fn bottommost() -> Self {
        Self {
            level: 6,
            bottommost: true,
            number_levels: 7,
            allow_ingest_behind: false,
            preserve_deletes: false,
            preserve_deletes_seqnum: 0,
            separation: SeparationType::Separate,
            key_beyond_output_level: false,
        }
    }

    pub(crate) fn intermediate() -> Self {
        Self {
            level: 2,
            bottommost: false,
            key_beyond_output_level: true,
            ..Self::bottommost()
        }
    }

    pub(crate) fn with_ingest_behind(mut self) -> Self {
        self.allow_ingest_behind = true;
        self
    }

    pub(crate) fn with_preserve_deletes(mut self, seqnum: u64) -> Self {
        self.preserve_deletes = true;
        self.preserve_deletes_seqnum = seqnum;
        self
    }

    pub(crate) fn with_separation(mut self, separation: SeparationType) -> Self {
        self.separation = separation;
        self
    }

    pub(crate) fn with_key_beyond_output_level(mut self) -> Self {
        self.key_beyond_output_level = true;
        self
    }
}

impl CompactionView for TestCompactionView {
    fn separation_type(&self) -> SeparationType {
        self.separation
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn bottommost_level(&self) -> bool {
        self.bottommost
    }

    fn number_levels(&self) -> u32 {
        self.number_levels
    }

    fn largest_user_key(&self) -> Option<&Bytes> {
        None
    }

    fn allow_ingest_behind(&self) -> bool {
        self.allow_ingest_behind
    }

    fn preserve_deletes(&self) -> bool {
        self.preserve_deletes
    }

    fn preserve_deletes_seqnum(&self) -> u64 {
        self.preserve_deletes_seqnum
    }

    fn key_not_exists_beyond_output_level(
        &self,
        _user_key: &[u8],
        _level_ptrs: &mut [usize],
    ) -> bool {
        !self.key_beyond_output_level
    }
}

/// In-memory [`ValueSeparation`] double: every separated value lands in its
/// own synthetic blob file.
pub(crate) struct InMemorySeparation {
    next_file: AtomicU64,
    values: Mutex<HashMap<(u64, u64), Bytes>>,
    inheritance: Mutex<HashMap<u64, Vec<u64>>>,
}

impl InMemorySeparation {
    pub(crate) fn new(first_file_id: u64) -> Self {
        Self {
            next_file: AtomicU64::new(first_file_id),
            values: Mutex::new(HashMap::new()),
            inheritance: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self, value: Bytes) -> BlobRef {
        let file_id = self.next_file.fetch_add(1, AtomicOrdering::SeqCst);
        let blob_ref = BlobRef {
            file_id,
            offset: 0,
            len: value.len() as u32,
        };
        self.values.lock().insert((file_id, 0), value);
        blob_ref
    }

    pub(crate) fn stored(&self, blob_ref: BlobRef) -> Bytes {
        self.values
            .lock()
            .get(&(blob_ref.file_id, blob_ref.offset))
            .expect("unknown blob ref")
            .clone()
    }

    pub(crate) fn inheritance(&self, file_id: u64) -> Vec<u64> {
        self.inheritance
            .lock()
            .get(&file_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ValueSeparation for InMemorySeparation {
    async fn separate(
        &self,
        _key: &[u8],
        _seq: u64,
        value: Bytes,
        _hint: PlacementHint,
    ) -> Result<BlobRef, BasaltError> {
        Ok(self.store(value))
    }

    async fn rebuild(
        &self,
        key: &[u8],
        seq: u64,
        value: Bytes,
        hint: PlacementHint,
        ancestor: u64,
    ) -> Result<BlobRef, BasaltError> {
        let blob_ref = self.separate(key, seq, value, hint).await?;
        self.inheritance
            .lock()
            .entry(blob_ref.file_id)
            .or_default()
            .push(ancestor);
        Ok(blob_ref)
    }

    async fn combine(&self, blob_ref: BlobRef) -> Result<Bytes, BasaltError> {
        Ok(self.stored(blob_ref))
    }
}

/// Reference resolver: the key-value mapping a reader at `snapshot` would
/// observe over a record stream. Used to check snapshot consistency between
/// compaction inputs and outputs.
pub(crate) fn resolve_visible_state(
    entries: &[RowEntry],
    snapshot: Option<u64>,
    operator: Option<&dyn MergeOperator>,
) -> BTreeMap<Bytes, Bytes> {
    let visible = |seq: u64| snapshot.is_none_or(|s| seq <= s);
    let range_tombstones: Vec<(Bytes, Bytes, u64)> = entries
        .iter()
        .filter(|e| visible(e.seq))
        .filter_map(|e| match &e.value {
            EntryValue::RangeTombstone { end_key } => {
                Some((e.key.clone(), end_key.clone(), e.seq))
            }
            _ => None,
        })
        .collect();
    let covered = |key: &Bytes, seq: u64| {
        range_tombstones
            .iter()
            .any(|(start, end, ts)| key >= start && key < end && seq <= *ts)
    };

    let mut result = BTreeMap::new();
    let mut idx = 0;
    let points: Vec<&RowEntry> = entries
        .iter()
        .filter(|e| !matches!(e.value, EntryValue::RangeTombstone { .. }))
        .collect();
    while idx < points.len() {
        let key = points[idx].key.clone();
        let mut operands: Vec<Bytes> = Vec::new();
        let mut base: Option<Option<Bytes>> = None;
        while idx < points.len() && points[idx].key == key {
            let entry = points[idx];
            idx += 1;
            if base.is_some() || !visible(entry.seq) {
                continue;
            }
            if covered(&key, entry.seq) {
                base = Some(None);
                continue;
            }
            match &entry.value {
                EntryValue::Put(LazyValue::Inline(v)) => base = Some(Some(v.clone())),
                EntryValue::Put(LazyValue::Indirect(_)) => {
                    panic!("resolver does not materialize indirections")
                }
                EntryValue::Tombstone | EntryValue::SingleTombstone => base = Some(None),
                EntryValue::Merge(op) => operands.push(op.clone()),
                EntryValue::RangeTombstone { .. } => unreachable!(),
            }
        }
        let mut acc = base.flatten();
        if !operands.is_empty() {
            let operator = operator.expect("merge operands need an operator");
            for op in operands.into_iter().rev() {
                acc = Some(
                    operator
                        .merge(&key, acc, op)
                        .expect("reference merge failed"),
                );
            }
        }
        if let Some(value) = acc {
            result.insert(key, value);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_resolver_applies_visibility_and_merges() {
        let entries = vec![
            RowEntry::new_value(b"a", b"new", 20),
            RowEntry::new_value(b"a", b"old", 5),
            RowEntry::new_tombstone(b"b", 15),
            RowEntry::new_value(b"b", b"gone", 3),
            RowEntry::new_merge(b"c", b"2", 9),
            RowEntry::new_value(b"c", b"40", 1),
        ];
        let state = resolve_visible_state(&entries, None, Some(&IntAddMergeOperator));
        assert_eq!(state.get(b"a".as_ref()).unwrap().as_ref(), b"new");
        assert!(!state.contains_key(b"b".as_ref()));
        assert_eq!(state.get(b"c".as_ref()).unwrap().as_ref(), b"42");

        let snapshot_state = resolve_visible_state(&entries, Some(10), Some(&IntAddMergeOperator));
        assert_eq!(snapshot_state.get(b"a".as_ref()).unwrap().as_ref(), b"old");
        assert_eq!(snapshot_state.get(b"b".as_ref()).unwrap().as_ref(), b"gone");
    }

    #[test]
    fn reference_resolver_applies_range_tombstones() {
        let entries = vec![
            RowEntry::new_range_tombstone(b"a", b"m", 50),
            RowEntry::new_value(b"g", b"x", 30),
            RowEntry::new_value(b"m", b"y", 31),
        ];
        let state = resolve_visible_state(&entries, None, None);
        assert!(!state.contains_key(b"g".as_ref()));
        assert_eq!(state.get(b"m".as_ref()).unwrap().as_ref(), b"y");
    }
}
