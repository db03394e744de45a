use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::blob_format::PlacementHint;
use crate::blob_store::ValueSeparation;
use crate::compaction::{CompactionView, SeparationType};
use crate::compaction_filter::{CompactionFilter, CompactionFilterDecision};
use crate::comparator::ComparatorRef;
use crate::config::BlobConfig;
use crate::error::BasaltError;
use crate::hotness::{KeyOccurrence, KeyOccurrenceListener};
use crate::iter::EntryIterator;
use crate::lazy_value::LazyValue;
use crate::merge_helper::MergeHelper;
use crate::merge_operator::MergeOperatorType;
use crate::peeking_iterator::PeekingIterator;
use crate::range_del::{RangeDelAggregator, RangeDelMode, RangeTombstone};
use crate::snapshot::SnapshotVector;
use crate::stats::CompactionIterationStats;
use crate::types::{EntryValue, RowEntry, MAX_SEQUENCE_NUMBER};

/// Everything a [`CompactionIterator`] is wired up with besides its input.
pub struct CompactionIteratorParams {
    pub comparator: ComparatorRef,
    pub snapshots: SnapshotVector,
    /// Records above this snapshot carry write-conflict evidence for
    /// transactions; a single delete above it may not annihilate with its
    /// put. `MAX_SEQUENCE_NUMBER` disables the rule.
    pub earliest_write_conflict_snapshot: u64,
    pub view: Arc<dyn CompactionView>,
    pub range_del_agg: Arc<Mutex<RangeDelAggregator>>,
    pub merge_operator: Option<MergeOperatorType>,
    pub compaction_filter: Option<Box<dyn CompactionFilter>>,
    pub filter_sample_interval: usize,
    pub separation: Option<Arc<dyn ValueSeparation>>,
    pub blob_config: BlobConfig,
    pub rebuild_blob_set: Arc<HashSet<u64>>,
    /// Exclusive upper bound of this subcompaction's key range.
    pub end_key: Option<Bytes>,
    pub shutting_down: Option<Arc<AtomicBool>>,
    pub occurrence_listener: Option<Arc<dyn KeyOccurrenceListener>>,
}

/// The compaction transducer: consumes the merged, sequence-ordered input
/// stream and yields exactly the records that must survive.
///
/// Survival is decided per user-key group against the snapshot list:
/// records shadowed within their snapshot stratum are dropped, tombstones
/// are suppressed once nothing below can resurface, single deletes
/// annihilate with the put they cover, merge operands collapse through the
/// merge operator, and values cross the separation threshold in and out of
/// blob runs. Range tombstones are absorbed into the aggregator rather than
/// emitted inline.
pub struct CompactionIterator<I: EntryIterator> {
    input: PeekingIterator<I>,
    comparator: ComparatorRef,
    snapshots: SnapshotVector,
    earliest_write_conflict_snapshot: u64,
    view: Arc<dyn CompactionView>,
    range_del_agg: Arc<Mutex<RangeDelAggregator>>,
    merge_helper: MergeHelper,
    compaction_filter: Option<Box<dyn CompactionFilter>>,
    filter_sample_interval: usize,
    filter_candidates: usize,
    separation: Option<Arc<dyn ValueSeparation>>,
    blob_config: BlobConfig,
    rebuild_blob_set: Arc<HashSet<u64>>,
    end_key: Option<Bytes>,
    shutting_down: Option<Arc<AtomicBool>>,
    occurrence_listener: Option<Arc<dyn KeyOccurrenceListener>>,

    // per-group state
    current_user_key: Option<Bytes>,
    current_user_key_sequence: u64,
    current_user_key_snapshot: Option<u64>,
    current_key_committed: bool,
    has_outputted_key: bool,
    /// Set when an emitted single delete left its paired put behind: the
    /// next record of the group is output without applying compaction
    /// rules.
    clear_and_output_next_key: bool,
    /// Blob run holding the newest value of the current key, if separated.
    latest_valid_fileno: Option<u64>,

    /// Resolved merge records waiting to be emitted.
    merge_out: VecDeque<RowEntry>,
    level_ptrs: Vec<usize>,
    finished: bool,
    filter_eof_notified: bool,
    initialized: bool,
    stats: CompactionIterationStats,
    bytes_processed: u64,
}

impl<I: EntryIterator> CompactionIterator<I> {
    pub fn new(input: I, params: CompactionIteratorParams) -> Self {
        let merge_helper = MergeHelper::new(
            params.merge_operator,
            params.comparator.clone(),
            params.snapshots.clone(),
        );
        let level_ptrs = vec![0; params.view.number_levels() as usize];
        Self {
            input: PeekingIterator::new(input),
            comparator: params.comparator,
            snapshots: params.snapshots,
            earliest_write_conflict_snapshot: params.earliest_write_conflict_snapshot,
            view: params.view,
            range_del_agg: params.range_del_agg,
            merge_helper,
            compaction_filter: params.compaction_filter,
            filter_sample_interval: params.filter_sample_interval.max(1),
            filter_candidates: 0,
            separation: params.separation,
            blob_config: params.blob_config,
            rebuild_blob_set: params.rebuild_blob_set,
            end_key: params.end_key,
            shutting_down: params.shutting_down,
            occurrence_listener: params.occurrence_listener,
            current_user_key: None,
            current_user_key_sequence: 0,
            current_user_key_snapshot: None,
            current_key_committed: false,
            has_outputted_key: false,
            clear_and_output_next_key: false,
            latest_valid_fileno: None,
            merge_out: VecDeque::new(),
            level_ptrs,
            finished: false,
            filter_eof_notified: false,
            initialized: false,
            stats: CompactionIterationStats::default(),
            bytes_processed: 0,
        }
    }

    pub fn iter_stats(&self) -> &CompactionIterationStats {
        &self.stats
    }

    /// Approximate input bytes consumed so far, for progress reporting.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    fn is_shutting_down(&self) -> bool {
        // best-effort facility; relaxed ordering is sufficient
        self.shutting_down
            .as_ref()
            .is_some_and(|flag| flag.load(atomic::Ordering::Relaxed))
    }

    /// Bottommost-level drops and sequence zeroing are disabled under
    /// ingest-behind, which reserves the bottommost level for external
    /// files.
    fn bottommost_for_drops(&self) -> bool {
        self.view.bottommost_level() && !self.view.allow_ingest_behind()
    }

    fn key_not_exists_beyond_output_level(&mut self, user_key: &Bytes) -> bool {
        let view = self.view.clone();
        view.key_not_exists_beyond_output_level(user_key, &mut self.level_ptrs)
    }

    fn tombstone_needed_for_preserved_deletes(&self, seq: u64) -> bool {
        self.view.preserve_deletes() && seq >= self.view.preserve_deletes_seqnum()
    }

    /// Zeroes the sequence number for better compressibility when nothing
    /// can observe the difference: the record must be a committed put above
    /// all snapshots on the bottommost level, with no data for its key
    /// below the output level.
    ///
    /// With any snapshot live the group may keep older pinned versions, and
    /// a zeroed newest version would sort behind them; zeroing therefore
    /// only happens when the snapshot list is empty.
    fn prepare_output(&mut self, entry: RowEntry) -> RowEntry {
        if !matches!(entry.value, EntryValue::Put(_)) || entry.seq == 0 {
            return entry;
        }
        if !self.bottommost_for_drops() || !self.snapshots.is_empty() {
            return entry;
        }
        if !self.snapshots.is_committed(entry.seq)
            || !self.key_not_exists_beyond_output_level(&entry.key)
        {
            return entry;
        }
        entry.with_seq(0)
    }

    fn enter_group(&mut self, entry: &RowEntry) {
        self.current_user_key = Some(entry.key.clone());
        self.has_outputted_key = false;
        self.clear_and_output_next_key = false;
        self.latest_valid_fileno = match &entry.value {
            EntryValue::Put(lazy) => lazy.blob_ref().map(|r| r.file_id),
            _ => None,
        };
        if let Some(listener) = &self.occurrence_listener {
            listener.on_key_occurrence(KeyOccurrence {
                user_key: entry.key.clone(),
                latest_valid_fileno: self.latest_valid_fileno,
            });
        }
    }

    fn should_invoke_filter(&mut self, entry: &RowEntry) -> bool {
        if self.compaction_filter.is_none() || self.has_outputted_key {
            return false;
        }
        // only records visible at the topmost reachable bucket are filtered;
        // anything a snapshot pins must pass through untouched
        let above_all_snapshots = match self.snapshots.latest() {
            None => true,
            Some(latest) => entry.seq > latest,
        };
        if !above_all_snapshots {
            return false;
        }
        let sampled = self.filter_candidates % self.filter_sample_interval == 0;
        self.filter_candidates += 1;
        sampled
    }

    async fn materialize(&self, entry: RowEntry) -> Result<RowEntry, BasaltError> {
        match &entry.value {
            EntryValue::Put(LazyValue::Indirect(blob_ref)) => match &self.separation {
                Some(separation) => {
                    let bytes = separation.combine(*blob_ref).await?;
                    Ok(RowEntry::new(
                        entry.key,
                        entry.seq,
                        EntryValue::Put(LazyValue::inline(bytes)),
                    ))
                }
                None => Ok(entry),
            },
            _ => Ok(entry),
        }
    }

    /// Applies the separation policy to a surviving put: separate large
    /// inline values, inline indirections that fell below the threshold,
    /// and rewrite indirections into blobs scheduled for rebuild.
    async fn apply_separation(&mut self, entry: RowEntry) -> Result<RowEntry, BasaltError> {
        let Some(separation) = self.separation.clone() else {
            return Ok(entry);
        };
        let separation_type = self.view.separation_type();
        let EntryValue::Put(lazy) = &entry.value else {
            return Ok(entry);
        };
        match lazy {
            LazyValue::Inline(value) => {
                let separate = matches!(
                    separation_type,
                    SeparationType::Separate | SeparationType::Rebuild
                ) && self
                    .blob_config
                    .should_separate(entry.key.len(), value.len());
                if !separate {
                    return Ok(entry);
                }
                let blob_ref = separation
                    .separate(&entry.key, entry.seq, value.clone(), PlacementHint::Default)
                    .await?;
                self.stats.num_values_separated += 1;
                Ok(RowEntry::new(
                    entry.key,
                    entry.seq,
                    EntryValue::Put(LazyValue::Indirect(blob_ref)),
                ))
            }
            LazyValue::Indirect(blob_ref) => {
                let blob_ref = *blob_ref;
                let rebuild = separation_type == SeparationType::Rebuild
                    && self.rebuild_blob_set.contains(&blob_ref.file_id);
                if rebuild {
                    let bytes = separation.combine(blob_ref).await?;
                    if self.blob_config.should_separate(entry.key.len(), bytes.len()) {
                        let new_ref = separation
                            .rebuild(
                                &entry.key,
                                entry.seq,
                                bytes,
                                PlacementHint::Default,
                                blob_ref.file_id,
                            )
                            .await?;
                        self.stats.num_values_separated += 1;
                        return Ok(RowEntry::new(
                            entry.key,
                            entry.seq,
                            EntryValue::Put(LazyValue::Indirect(new_ref)),
                        ));
                    }
                    self.stats.num_values_combined += 1;
                    return Ok(RowEntry::new(
                        entry.key,
                        entry.seq,
                        EntryValue::Put(LazyValue::inline(bytes)),
                    ));
                }
                if !self
                    .blob_config
                    .should_separate(entry.key.len(), blob_ref.len as usize)
                {
                    // the value no longer qualifies; pull it back inline
                    let bytes = separation.combine(blob_ref).await?;
                    self.stats.num_values_combined += 1;
                    return Ok(RowEntry::new(
                        entry.key,
                        entry.seq,
                        EntryValue::Put(LazyValue::inline(bytes)),
                    ));
                }
                Ok(entry)
            }
        }
    }

    fn covered_by_range_del(&self, entry: &RowEntry) -> bool {
        self.range_del_agg
            .lock()
            .should_delete(&entry.key, entry.seq, RangeDelMode::ForCompaction)
    }

    /// Drains one record out of the resolved-merge queue, applying the put
    /// emission rules to the resolved head.
    async fn next_from_merge_out(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        while let Some(entry) = self.merge_out.pop_front() {
            if matches!(entry.value, EntryValue::Put(_)) && self.covered_by_range_del(&entry) {
                self.stats.num_range_del_covered += 1;
                continue;
            }
            let entry = self.apply_separation(entry).await?;
            self.has_outputted_key = true;
            let entry = self.prepare_output(entry);
            self.stats.num_output_records += 1;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn next_from_input(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        loop {
            if let Some(entry) = self.next_from_merge_out().await? {
                return Ok(Some(entry));
            }
            if self.finished {
                return Ok(None);
            }
            if self.is_shutting_down() {
                return Err(BasaltError::ShutdownInProgress);
            }
            let Some(entry) = self.input.next_entry().await? else {
                self.finished = true;
                return Ok(None);
            };
            if let Some(end_key) = &self.end_key {
                if self.comparator.compare(&entry.key, end_key) != Ordering::Less {
                    self.finished = true;
                    return Ok(None);
                }
            }
            self.stats.num_input_records += 1;
            self.bytes_processed += entry.estimated_size() as u64;

            if let EntryValue::RangeTombstone { end_key } = &entry.value {
                self.range_del_agg.lock().add_tombstone(RangeTombstone {
                    start_key: entry.key.clone(),
                    end_key: end_key.clone(),
                    seq: entry.seq,
                });
                continue;
            }

            let committed = self.snapshots.is_committed(entry.seq);
            let (bucket, _prev_snapshot) = self.snapshots.earliest_visible(entry.seq);

            let same_group = self
                .current_user_key
                .as_ref()
                .is_some_and(|k| self.comparator.compare(&entry.key, k) == Ordering::Equal);
            if !same_group {
                self.enter_group(&entry);
                self.current_user_key_sequence = entry.seq;
                self.current_user_key_snapshot = bucket;
                self.current_key_committed = committed;
            } else {
                let last_snapshot = self.current_user_key_snapshot;
                let shadowed_by_committed = self.current_key_committed;
                debug_assert!(
                    entry.seq <= self.current_user_key_sequence,
                    "input regressed within a user-key group"
                );
                self.current_user_key_sequence = entry.seq;
                if !self.clear_and_output_next_key
                    && bucket == last_snapshot
                    && shadowed_by_committed
                {
                    // hidden by a newer committed record in the same
                    // snapshot stratum
                    self.stats.num_records_hidden += 1;
                    continue;
                }
                self.current_user_key_snapshot = bucket;
                self.current_key_committed = committed;
            }

            if self.clear_and_output_next_key {
                // the put whose single delete was already emitted; output it
                // without applying any compaction rules
                self.clear_and_output_next_key = false;
                self.has_outputted_key = true;
                let entry = self.prepare_output(entry);
                self.stats.num_output_records += 1;
                return Ok(Some(entry));
            }

            if !committed {
                // uncommitted data can neither be dropped nor transformed
                self.has_outputted_key = true;
                self.stats.num_output_records += 1;
                return Ok(Some(entry));
            }

            match &entry.value {
                EntryValue::Put(_) => {
                    let mut entry = entry;
                    if self.should_invoke_filter(&entry) {
                        entry = self.materialize(entry).await?;
                        if matches!(
                            entry.value,
                            EntryValue::Put(LazyValue::Inline(_))
                        ) {
                            let filter = self
                                .compaction_filter
                                .as_mut()
                                .expect("filter checked by should_invoke_filter");
                            match filter.filter(&entry).await.map_err(BasaltError::from)? {
                                CompactionFilterDecision::Keep => {}
                                CompactionFilterDecision::Remove => {
                                    self.stats.num_filtered += 1;
                                    continue;
                                }
                                CompactionFilterDecision::ChangeValue(new_value) => {
                                    entry = RowEntry::new(
                                        entry.key,
                                        entry.seq,
                                        EntryValue::Put(LazyValue::inline(new_value)),
                                    );
                                }
                                CompactionFilterDecision::RemoveAndSkipUntil(skip_until) => {
                                    self.stats.num_filtered += 1;
                                    self.input.seek(&skip_until).await?;
                                    // the group state no longer describes the
                                    // input position
                                    self.current_user_key = None;
                                    continue;
                                }
                            }
                        }
                    }
                    if self.covered_by_range_del(&entry) {
                        self.stats.num_range_del_covered += 1;
                        continue;
                    }
                    let entry = self.apply_separation(entry).await?;
                    self.has_outputted_key = true;
                    let entry = self.prepare_output(entry);
                    self.stats.num_output_records += 1;
                    return Ok(Some(entry));
                }
                EntryValue::Tombstone => {
                    let no_snapshot_below =
                        self.snapshots.earliest().is_none_or(|e| entry.seq <= e);
                    if self.bottommost_for_drops()
                        && no_snapshot_below
                        && !self.tombstone_needed_for_preserved_deletes(entry.seq)
                        && self.key_not_exists_beyond_output_level(&entry.key)
                    {
                        self.stats.num_obsolete_tombstones += 1;
                        continue;
                    }
                    self.has_outputted_key = true;
                    self.stats.num_output_records += 1;
                    return Ok(Some(entry));
                }
                EntryValue::SingleTombstone => {
                    let paired_put = match self.input.peek().await? {
                        Some(next) => {
                            self.comparator.compare(&next.key, &entry.key) == Ordering::Equal
                                && matches!(next.value, EntryValue::Put(_))
                                && self.snapshots.earliest_visible(next.seq).0 == bucket
                                && self.snapshots.is_committed(next.seq)
                        }
                        None => false,
                    };
                    if paired_put {
                        if entry.seq > self.earliest_write_conflict_snapshot {
                            // evidence of the write is still needed for
                            // conflict checking; emit the single delete and
                            // let the put through verbatim
                            self.clear_and_output_next_key = true;
                            self.has_outputted_key = true;
                            self.stats.num_output_records += 1;
                            return Ok(Some(entry));
                        }
                        let put = self
                            .input
                            .next_entry()
                            .await?
                            .expect("peeked paired put disappeared");
                        self.stats.num_input_records += 1;
                        self.bytes_processed += put.estimated_size() as u64;
                        self.current_user_key_sequence = put.seq;
                        self.stats.num_single_del_paired += 2;
                        continue;
                    }
                    // a floating single delete must survive for later
                    // compactions to pair it
                    self.stats.num_single_del_floating += 1;
                    self.has_outputted_key = true;
                    self.stats.num_output_records += 1;
                    return Ok(Some(entry));
                }
                EntryValue::Merge(_) => {
                    let bottommost = self.bottommost_for_drops();
                    let resolution = self
                        .merge_helper
                        .merge_until(
                            entry,
                            &mut self.input,
                            bottommost,
                            self.separation.as_deref(),
                        )
                        .await?;
                    self.stats.num_merge_operands += resolution.operand_count;
                    self.current_user_key_sequence = resolution.last_consumed_seq;
                    self.merge_out.extend(resolution.resolved);
                }
                EntryValue::RangeTombstone { .. } => unreachable!("absorbed above"),
            }
        }
    }
}

#[async_trait]
impl<I: EntryIterator> EntryIterator for CompactionIterator<I> {
    async fn init(&mut self) -> Result<(), BasaltError> {
        if self.initialized {
            return Ok(());
        }
        self.input.init().await?;
        self.initialized = true;
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        if !self.initialized {
            return Err(BasaltError::IteratorNotInitialized);
        }
        let out = self.next_from_input().await?;
        if out.is_none() && !self.filter_eof_notified {
            self.filter_eof_notified = true;
            if let Some(filter) = self.compaction_filter.as_mut() {
                filter
                    .on_compaction_end()
                    .await
                    .map_err(BasaltError::from)?;
            }
        }
        Ok(out)
    }

    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError> {
        self.input.seek(next_key).await?;
        self.current_user_key = None;
        self.merge_out.clear();
        self.finished = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::bytewise;
    use crate::compaction_filter::CompactionFilterError;
    use crate::test_utils::{
        assert_iterator, IntAddMergeOperator, InMemorySeparation, TestCompactionView, TestIterator,
    };
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        view: Arc<TestCompactionView>,
        snapshots: SnapshotVector,
        earliest_write_conflict_snapshot: u64,
        merge_operator: Option<MergeOperatorType>,
        compaction_filter: Option<Box<dyn CompactionFilter>>,
        filter_sample_interval: usize,
        separation: Option<Arc<dyn ValueSeparation>>,
        blob_config: BlobConfig,
        rebuild_blob_set: HashSet<u64>,
        end_key: Option<Bytes>,
        shutting_down: Option<Arc<AtomicBool>>,
        listener: Option<Arc<dyn KeyOccurrenceListener>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                view: Arc::new(TestCompactionView::bottommost()),
                snapshots: SnapshotVector::empty(),
                earliest_write_conflict_snapshot: MAX_SEQUENCE_NUMBER,
                merge_operator: None,
                compaction_filter: None,
                filter_sample_interval: 1,
                separation: None,
                blob_config: BlobConfig::disabled(),
                rebuild_blob_set: HashSet::new(),
                end_key: None,
                shutting_down: None,
                listener: None,
            }
        }

        fn with_snapshots(mut self, snapshots: Vec<u64>) -> Self {
            self.snapshots = SnapshotVector::new(snapshots, None);
            self
        }

        fn with_view(mut self, view: TestCompactionView) -> Self {
            self.view = Arc::new(view);
            self
        }

        fn build(self, input: TestIterator) -> CompactionIterator<TestIterator> {
            let snapshots = self.snapshots.clone();
            let agg = RangeDelAggregator::new(snapshots.clone(), bytewise());
            CompactionIterator::new(
                input,
                CompactionIteratorParams {
                    comparator: bytewise(),
                    snapshots,
                    earliest_write_conflict_snapshot: self.earliest_write_conflict_snapshot,
                    view: self.view,
                    range_del_agg: Arc::new(Mutex::new(agg)),
                    merge_operator: self.merge_operator,
                    compaction_filter: self.compaction_filter,
                    filter_sample_interval: self.filter_sample_interval,
                    separation: self.separation,
                    blob_config: self.blob_config,
                    rebuild_blob_set: Arc::new(self.rebuild_blob_set),
                    end_key: self.end_key,
                    shutting_down: self.shutting_down,
                    occurrence_listener: self.listener,
                },
            )
        }
    }

    struct DestroyValueFilter;

    #[async_trait]
    impl CompactionFilter for DestroyValueFilter {
        async fn filter(
            &mut self,
            entry: &RowEntry,
        ) -> Result<CompactionFilterDecision, CompactionFilterError> {
            match &entry.value {
                EntryValue::Put(LazyValue::Inline(v)) if v.as_ref() == b"destroy" => {
                    Ok(CompactionFilterDecision::Remove)
                }
                _ => Ok(CompactionFilterDecision::Keep),
            }
        }
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let mut iter = Fixture::new().build(TestIterator::new());
        assert_iterator(&mut iter, vec![]).await;
        assert_eq!(iter.iter_stats().num_input_records, 0);
    }

    #[tokio::test]
    async fn newest_version_wins_within_a_stratum() {
        let input = TestIterator::new()
            .with_entry(b"k", b"new", 9)
            .with_entry(b"k", b"mid", 5)
            .with_entry(b"k", b"old", 2);
        let mut iter = Fixture::new().build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"k", b"new", 0)]).await;
        assert_eq!(iter.iter_stats().num_records_hidden, 2);
    }

    #[tokio::test]
    async fn snapshots_split_key_groups_into_strata() {
        let input = TestIterator::new()
            .with_entry(b"k", b"new", 20)
            .with_entry(b"k", b"mid", 12)
            .with_entry(b"k", b"old", 8);
        // snapshot 15 pins "mid", snapshot 10 pins "old"; live snapshots
        // also keep every surviving sequence number intact
        let mut iter = Fixture::new().with_snapshots(vec![10, 15]).build(input);
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_value(b"k", b"new", 20),
                RowEntry::new_value(b"k", b"mid", 12),
                RowEntry::new_value(b"k", b"old", 8),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn destroy_all_filter_end_to_end() {
        // S1: filter removes marked values, survivor's seq is zeroed
        let input = TestIterator::new()
            .with_entry(b"key1", b"destroy", 3)
            .with_entry(b"key2", b"destroy", 4)
            .with_entry(b"key3", b"value3", 5)
            .with_entry(b"key4", b"destroy", 6);
        let mut fixture = Fixture::new();
        fixture.compaction_filter = Some(Box::new(DestroyValueFilter));
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"key3", b"value3", 0)]).await;
        assert_eq!(iter.iter_stats().num_filtered, 3);
    }

    #[tokio::test]
    async fn delete_survives_under_spanning_snapshot() {
        // S2: the snapshot at 15 separates the put from the delete; both
        // must survive with their sequence numbers intact
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_tombstone(b"k", 20))
            .with_entry(b"k", b"a", 10);
        let mut iter = Fixture::new().with_snapshots(vec![15]).build(input);
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_tombstone(b"k", 20),
                RowEntry::new_value(b"k", b"a", 10),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn delete_dropped_on_bottommost_without_snapshots() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_tombstone(b"k", 20))
            .with_entry(b"k", b"a", 10);
        let mut iter = Fixture::new().build(input);
        assert_iterator(&mut iter, vec![]).await;
        assert_eq!(iter.iter_stats().num_obsolete_tombstones, 1);
        assert_eq!(iter.iter_stats().num_records_hidden, 1);
    }

    #[tokio::test]
    async fn delete_kept_when_key_may_exist_below_output_level() {
        let input = TestIterator::new().with_row_entry(RowEntry::new_tombstone(b"k", 20));
        let mut iter = Fixture::new()
            .with_view(TestCompactionView::bottommost().with_key_beyond_output_level())
            .build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_tombstone(b"k", 20)]).await;
    }

    #[tokio::test]
    async fn delete_kept_under_ingest_behind() {
        let input = TestIterator::new().with_row_entry(RowEntry::new_tombstone(b"k", 20));
        let mut iter = Fixture::new()
            .with_view(TestCompactionView::bottommost().with_ingest_behind())
            .build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_tombstone(b"k", 20)]).await;
    }

    #[tokio::test]
    async fn preserved_deletes_are_emitted_verbatim() {
        let input = TestIterator::new().with_row_entry(RowEntry::new_tombstone(b"k", 20));
        let mut iter = Fixture::new()
            .with_view(TestCompactionView::bottommost().with_preserve_deletes(10))
            .build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_tombstone(b"k", 20)]).await;
    }

    #[tokio::test]
    async fn single_delete_annihilates_paired_put() {
        // S3
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_single_tombstone(b"k", 30))
            .with_entry(b"k", b"v", 25);
        let mut iter = Fixture::new().build(input);
        assert_iterator(&mut iter, vec![]).await;
        assert_eq!(iter.iter_stats().num_single_del_paired, 2);
    }

    #[tokio::test]
    async fn single_delete_floats_across_snapshot_boundary() {
        // the snapshot at 27 pins the put into an older stratum
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_single_tombstone(b"k", 30))
            .with_entry(b"k", b"v", 25);
        let mut iter = Fixture::new().with_snapshots(vec![27]).build(input);
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_single_tombstone(b"k", 30),
                RowEntry::new_value(b"k", b"v", 25),
            ],
        )
        .await;
        assert_eq!(iter.iter_stats().num_single_del_floating, 1);
    }

    #[tokio::test]
    async fn single_delete_floats_over_non_put() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_single_tombstone(b"k", 30))
            .with_row_entry(RowEntry::new_tombstone(b"k", 25));
        let mut iter = Fixture::new().build(input);
        // the single delete floats; the tombstone behind it is hidden by it
        // within the same stratum
        assert_iterator(&mut iter, vec![RowEntry::new_single_tombstone(b"k", 30)]).await;
    }

    #[tokio::test]
    async fn single_delete_above_write_conflict_snapshot_keeps_evidence() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_single_tombstone(b"k", 30))
            .with_entry(b"k", b"v", 25);
        let mut fixture = Fixture::new();
        fixture.earliest_write_conflict_snapshot = 20;
        let mut iter = fixture.build(input);
        // both records survive: the single delete as conflict evidence and
        // the put verbatim (zeroed, being bottommost above all snapshots)
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_single_tombstone(b"k", 30),
                RowEntry::new_value(b"k", b"v", 0),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn merge_chain_collapses_into_base_put() {
        // S4
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_merge(b"k", b"1", 5))
            .with_row_entry(RowEntry::new_merge(b"k", b"2", 4))
            .with_entry(b"k", b"10", 3);
        let mut fixture = Fixture::new();
        fixture.merge_operator = Some(Arc::new(IntAddMergeOperator));
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"k", b"13", 0)]).await;
        assert_eq!(iter.iter_stats().num_merge_operands, 2);
    }

    #[tokio::test]
    async fn merge_without_operator_is_fatal() {
        let input = TestIterator::new().with_row_entry(RowEntry::new_merge(b"k", b"1", 5));
        let mut iter = Fixture::new().build(input);
        iter.init().await.unwrap();
        let err = iter.next_entry().await.unwrap_err();
        assert!(matches!(err, BasaltError::MergeOperatorNotSupported));
    }

    #[tokio::test]
    async fn merge_does_not_collapse_across_snapshot_boundary() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_merge(b"k", b"1", 20))
            .with_row_entry(RowEntry::new_merge(b"k", b"2", 10));
        let mut fixture = Fixture::new().with_snapshots(vec![15]);
        fixture.merge_operator = Some(Arc::new(IntAddMergeOperator));
        let mut iter = fixture.build(input);
        // each stratum resolves separately; the lower one is a lone operand
        // at the bottommost level, so it becomes a full value
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_merge(b"k", b"1", 20),
                RowEntry::new_value(b"k", b"2", 10),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn range_tombstone_coverage() {
        // S6
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_range_tombstone(b"a", b"m", 50))
            .with_entry(b"g", b"x", 30)
            .with_entry(b"m", b"y", 31);
        let mut iter = Fixture::new().build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"m", b"y", 0)]).await;
        assert_eq!(iter.iter_stats().num_range_del_covered, 1);
        // bottommost with no snapshots: the tombstone itself is dropped
        assert!(iter
            .range_del_agg
            .lock()
            .tombstones_for_output(true)
            .is_empty());
    }

    #[tokio::test]
    async fn range_tombstone_does_not_cover_across_snapshot() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_range_tombstone(b"a", b"m", 50))
            .with_entry(b"g", b"x", 30);
        let mut iter = Fixture::new().with_snapshots(vec![40]).build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"g", b"x", 30)]).await;
    }

    #[tokio::test]
    async fn only_range_tombstones_is_a_valid_input() {
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_range_tombstone(b"a", b"f", 10))
            .with_row_entry(RowEntry::new_range_tombstone(b"g", b"p", 12));
        let mut iter = Fixture::new().with_snapshots(vec![5]).build(input);
        assert_iterator(&mut iter, vec![]).await;
        let tombstones = iter.range_del_agg.lock().tombstones_for_output(true);
        assert_eq!(tombstones.len(), 2);
    }

    #[tokio::test]
    async fn sequence_zeroing_requires_key_absent_below() {
        let input = TestIterator::new().with_entry(b"k", b"v", 9);
        let mut iter = Fixture::new()
            .with_view(TestCompactionView::bottommost().with_key_beyond_output_level())
            .build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"k", b"v", 9)]).await;
    }

    #[tokio::test]
    async fn no_zeroing_above_bottommost() {
        let input = TestIterator::new().with_entry(b"k", b"v", 9);
        let mut iter = Fixture::new()
            .with_view(TestCompactionView::intermediate())
            .build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"k", b"v", 9)]).await;
    }

    #[tokio::test]
    async fn end_key_bounds_the_subcompaction() {
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 1)
            .with_entry(b"m", b"2", 2)
            .with_entry(b"z", b"3", 3);
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.end_key = Some(Bytes::from_static(b"m"));
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"a", b"1", 1)]).await;
    }

    #[tokio::test]
    async fn shutdown_aborts_between_records() {
        let flag = Arc::new(AtomicBool::new(false));
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 1)
            .with_entry(b"b", b"2", 2);
        let mut fixture = Fixture::new();
        fixture.shutting_down = Some(flag.clone());
        let mut iter = fixture.build(input);
        iter.init().await.unwrap();
        assert!(iter.next_entry().await.unwrap().is_some());
        flag.store(true, atomic::Ordering::SeqCst);
        let err = iter.next_entry().await.unwrap_err();
        assert!(matches!(err, BasaltError::ShutdownInProgress));
    }

    #[tokio::test]
    async fn filter_sampling_passes_unsampled_records_through() {
        let input = TestIterator::new()
            .with_entry(b"a", b"destroy", 1)
            .with_entry(b"b", b"destroy", 2)
            .with_entry(b"c", b"destroy", 3)
            .with_entry(b"d", b"destroy", 4);
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.compaction_filter = Some(Box::new(DestroyValueFilter));
        fixture.filter_sample_interval = 2;
        let mut iter = fixture.build(input);
        // every other candidate skips the filter
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_value(b"b", b"destroy", 2),
                RowEntry::new_value(b"d", b"destroy", 4),
            ],
        )
        .await;
        assert_eq!(iter.iter_stats().num_filtered, 2);
    }

    #[tokio::test]
    async fn filter_never_sees_snapshot_pinned_records() {
        let input = TestIterator::new()
            .with_entry(b"a", b"destroy", 20)
            .with_entry(b"b", b"destroy", 5);
        let mut fixture = Fixture::new()
            .with_snapshots(vec![10])
            .with_view(TestCompactionView::intermediate());
        fixture.compaction_filter = Some(Box::new(DestroyValueFilter));
        let mut iter = fixture.build(input);
        // "a"@20 is above the snapshot and gets filtered; "b"@5 is pinned
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"b", b"destroy", 5)]).await;
    }

    struct SkipUntilFilter {
        skip_to: &'static [u8],
    }

    #[async_trait]
    impl CompactionFilter for SkipUntilFilter {
        async fn filter(
            &mut self,
            entry: &RowEntry,
        ) -> Result<CompactionFilterDecision, CompactionFilterError> {
            if entry.key.as_ref() == b"a" {
                Ok(CompactionFilterDecision::RemoveAndSkipUntil(
                    Bytes::from_static(self.skip_to),
                ))
            } else {
                Ok(CompactionFilterDecision::Keep)
            }
        }
    }

    #[tokio::test]
    async fn remove_and_skip_until_drops_the_gap() {
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 1)
            .with_entry(b"b", b"2", 2)
            .with_entry(b"c", b"3", 3)
            .with_entry(b"d", b"4", 4);
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.compaction_filter = Some(Box::new(SkipUntilFilter { skip_to: b"d" }));
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"d", b"4", 4)]).await;
    }

    #[tokio::test]
    async fn skip_until_past_end_finishes_cleanly() {
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 1)
            .with_entry(b"b", b"2", 2);
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.compaction_filter = Some(Box::new(SkipUntilFilter { skip_to: b"zzz" }));
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![]).await;
    }

    #[tokio::test]
    async fn separates_large_values_and_keeps_small_ones() {
        let separation = Arc::new(InMemorySeparation::new(100));
        let big = vec![b'x'; 4096];
        let input = TestIterator::new()
            .with_row_entry(RowEntry::new_value(b"big", &big, 7))
            .with_entry(b"small", b"tiny", 8);
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.separation = Some(separation.clone());
        fixture.blob_config = BlobConfig {
            blob_size: 1024,
            blob_large_key_ratio: 0.0,
        };
        let mut iter = fixture.build(input);
        iter.init().await.unwrap();

        let first = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(first.key.as_ref(), b"big");
        assert_eq!(first.seq, 7);
        let blob_ref = match &first.value {
            EntryValue::Put(LazyValue::Indirect(r)) => *r,
            other => panic!("expected separated value, got {other:?}"),
        };
        assert_eq!(blob_ref.len, 4096);
        assert_eq!(separation.stored(blob_ref).as_ref(), &big[..]);

        let second = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(second, RowEntry::new_value(b"small", b"tiny", 8));
        assert!(iter.next_entry().await.unwrap().is_none());
        assert_eq!(iter.iter_stats().num_values_separated, 1);
    }

    #[tokio::test]
    async fn combines_indirections_below_threshold() {
        let separation = Arc::new(InMemorySeparation::new(100));
        let blob_ref = separation.store(Bytes::from_static(b"was big"));
        let input = TestIterator::new().with_row_entry(RowEntry::new(
            Bytes::from_static(b"k"),
            9,
            EntryValue::Put(LazyValue::Indirect(blob_ref)),
        ));
        let mut fixture = Fixture::new().with_view(TestCompactionView::intermediate());
        fixture.separation = Some(separation);
        fixture.blob_config = BlobConfig {
            blob_size: 1024,
            blob_large_key_ratio: 0.0,
        };
        let mut iter = fixture.build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"k", b"was big", 9)]).await;
        assert_eq!(iter.iter_stats().num_values_combined, 1);
    }

    #[tokio::test]
    async fn rebuilds_indirections_from_the_rebuild_set() {
        let separation = Arc::new(InMemorySeparation::new(100));
        let big = Bytes::from(vec![b'y'; 2048]);
        let old_ref = separation.store(big.clone());
        let input = TestIterator::new().with_row_entry(RowEntry::new(
            Bytes::from_static(b"k"),
            9,
            EntryValue::Put(LazyValue::Indirect(old_ref)),
        ));
        let mut fixture = Fixture::new()
            .with_view(TestCompactionView::intermediate().with_separation(SeparationType::Rebuild));
        fixture.separation = Some(separation.clone());
        fixture.blob_config = BlobConfig {
            blob_size: 1024,
            blob_large_key_ratio: 0.0,
        };
        fixture.rebuild_blob_set.insert(old_ref.file_id);
        let mut iter = fixture.build(input);
        iter.init().await.unwrap();

        let entry = iter.next_entry().await.unwrap().unwrap();
        let new_ref = match &entry.value {
            EntryValue::Put(LazyValue::Indirect(r)) => *r,
            other => panic!("expected rebuilt indirection, got {other:?}"),
        };
        assert_ne!(new_ref.file_id, old_ref.file_id);
        assert_eq!(separation.stored(new_ref), big);
        assert_eq!(separation.inheritance(new_ref.file_id), vec![old_ref.file_id]);
    }

    #[tokio::test]
    async fn uncommitted_records_pass_through_untouched() {
        use crate::snapshot::{SnapshotCheck, SnapshotChecker};

        struct Below15Committed;
        impl SnapshotChecker for Below15Committed {
            fn check(&self, seq: u64, _snapshot: u64) -> SnapshotCheck {
                if seq <= 15 {
                    SnapshotCheck::InSnapshot
                } else {
                    SnapshotCheck::NotInSnapshot
                }
            }
        }

        let input = TestIterator::new()
            .with_entry(b"k", b"uncommitted", 30)
            .with_entry(b"k", b"committed", 10);
        let mut fixture = Fixture::new();
        fixture.snapshots = SnapshotVector::new(vec![], Some(Arc::new(Below15Committed)));
        let mut iter = fixture.build(input);
        // the uncommitted record survives verbatim and does not hide the
        // committed one below it
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_value(b"k", b"uncommitted", 30),
                RowEntry::new_value(b"k", b"committed", 0),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn emits_one_occurrence_per_user_key_group() {
        struct CountingListener {
            count: AtomicUsize,
        }
        impl KeyOccurrenceListener for CountingListener {
            fn on_key_occurrence(&self, _occurrence: KeyOccurrence) {
                self.count.fetch_add(1, atomic::Ordering::SeqCst);
            }
        }

        let listener = Arc::new(CountingListener {
            count: AtomicUsize::new(0),
        });
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 5)
            .with_entry(b"a", b"0", 2)
            .with_entry(b"b", b"1", 3);
        let mut fixture = Fixture::new();
        fixture.listener = Some(listener.clone());
        let mut iter = fixture.build(input);
        assert_iterator(
            &mut iter,
            vec![
                RowEntry::new_value(b"a", b"1", 0),
                RowEntry::new_value(b"b", b"1", 0),
            ],
        )
        .await;
        assert_eq!(listener.count.load(atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn many_versions_collapse_to_one_on_bottommost() {
        let mut input = TestIterator::new();
        for seq in (1..=200_000u64).rev() {
            input = input.with_row_entry(RowEntry::new_value(
                b"hot",
                seq.to_string().as_bytes(),
                seq,
            ));
        }
        let mut iter = Fixture::new().build(input);
        assert_iterator(&mut iter, vec![RowEntry::new_value(b"hot", b"200000", 0)]).await;
        assert_eq!(iter.iter_stats().num_records_hidden, 199_999);
    }

    #[tokio::test]
    async fn output_is_strictly_ordered() {
        let input = TestIterator::new()
            .with_entry(b"a", b"1", 9)
            .with_entry(b"a", b"0", 4)
            .with_row_entry(RowEntry::new_tombstone(b"b", 7))
            .with_entry(b"b", b"x", 3)
            .with_entry(b"c", b"y", 8);
        let mut iter = Fixture::new().with_snapshots(vec![5]).build(input);
        iter.init().await.unwrap();
        let mut previous: Option<RowEntry> = None;
        while let Some(entry) = iter.next_entry().await.unwrap() {
            if let Some(prev) = &previous {
                let ord = crate::comparator::cmp_internal(
                    &crate::comparator::BytewiseComparator,
                    prev,
                    &entry,
                );
                assert_eq!(ord, Ordering::Less, "output regressed: {prev:?} -> {entry:?}");
            }
            previous = Some(entry);
        }
    }
}
