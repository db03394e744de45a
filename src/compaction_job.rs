//! Compaction job orchestration.
//!
//! A [`CompactionJob`] takes one [`CompactionDescriptor`] through four
//! phases:
//!
//! 1. **prepare**: split the key range into parallel subcompactions along
//!    input file boundaries,
//! 2. **run**: drive each subcompaction's merged input through a
//!    [`crate::compaction_iterator::CompactionIterator`] into rolling output
//!    runs (and blob runs for separated values),
//! 3. **verify**: optionally re-read every output and check it against the
//!    builder's claims,
//! 4. **install**: apply one [`VersionEdit`] that swaps the inputs for the
//!    outputs.
//!
//! Any failure deletes everything the job wrote and leaves the version
//! untouched. A garbage-collection descriptor routes through the blob
//! rewrite path instead of the record pipeline.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::instrument;
use ulid::Ulid;

use crate::blob_format::{decode_blob_run, PlacementHint};
use crate::blob_store::{BlobSink, ValueSeparation};
use crate::clock::SystemClock;
use crate::compaction::{CompactionDescriptor, DescriptorView, GcMode, SeparationType};
use crate::compaction_filter::{CompactionFilterContext, CompactionFilterSupplier};
use crate::compaction_iterator::{CompactionIterator, CompactionIteratorParams};
use crate::comparator::{cmp_internal, ComparatorRef};
use crate::config::CompactionOptions;
use crate::error::BasaltError;
use crate::hotness::{HotnessOracle, KeyOccurrenceListener};
use crate::iter::EntryIterator;
use crate::merge_iterator::MergeIterator;
use crate::merge_operator::MergeOperatorType;
use crate::output_writer::OutputWriter;
use crate::range_del::{RangeDelAggregator, RangeTombstone};
use crate::run_format::{decode_data_run, RunIterator};
use crate::run_store::RunStore;
use crate::snapshot::SnapshotVector;
use crate::stats::job_stats::JobStats;
use crate::stats::CompactionIterationStats;
use crate::types::RowEntry;
use crate::version::{VersionEdit, VersionSet};

/// Messages the job sends about in-flight work.
#[derive(Debug)]
pub enum JobProgress {
    SubcompactionProgress {
        job_id: Ulid,
        subcompaction: usize,
        bytes_processed: u64,
    },
    SubcompactionFinished {
        job_id: Ulid,
        subcompaction: usize,
        result: Result<(), BasaltError>,
    },
}

/// Everything a finished (but not yet installed) job produced.
#[derive(Debug, Default, Clone)]
pub struct JobOutputs {
    pub runs: Vec<crate::version::RunFileMeta>,
    pub blobs: Vec<crate::blob_format::BlobFileMeta>,
    /// Blob runs fully rewritten by a GC job.
    pub deleted_blobs: Vec<u64>,
    pub iteration_stats: CompactionIterationStats,
}

pub struct CompactionJobParams {
    pub descriptor: Arc<CompactionDescriptor>,
    pub options: CompactionOptions,
    pub comparator: ComparatorRef,
    pub snapshots: SnapshotVector,
    pub earliest_write_conflict_snapshot: u64,
    pub merge_operator: Option<MergeOperatorType>,
    pub filter_supplier: Option<Arc<dyn CompactionFilterSupplier>>,
    pub versions: Arc<dyn VersionSet>,
    pub run_store: Arc<RunStore>,
    pub clock: Arc<dyn SystemClock>,
    pub stats: Arc<JobStats>,
    pub occurrence_listener: Option<Arc<dyn KeyOccurrenceListener>>,
    pub hotness_oracle: Option<Arc<dyn HotnessOracle>>,
    pub progress_tx: Option<UnboundedSender<JobProgress>>,
}

pub struct CompactionJob {
    job_id: Ulid,
    descriptor: Arc<CompactionDescriptor>,
    options: CompactionOptions,
    comparator: ComparatorRef,
    snapshots: SnapshotVector,
    earliest_write_conflict_snapshot: u64,
    merge_operator: Option<MergeOperatorType>,
    filter_supplier: Option<Arc<dyn CompactionFilterSupplier>>,
    versions: Arc<dyn VersionSet>,
    run_store: Arc<RunStore>,
    clock: Arc<dyn SystemClock>,
    stats: Arc<JobStats>,
    occurrence_listener: Option<Arc<dyn KeyOccurrenceListener>>,
    hotness_oracle: Option<Arc<dyn HotnessOracle>>,
    progress_tx: Option<UnboundedSender<JobProgress>>,
    shutting_down: Arc<AtomicBool>,
    boundaries: Vec<Bytes>,
}

impl CompactionJob {
    pub fn new(params: CompactionJobParams) -> Self {
        Self {
            job_id: Ulid::new(),
            descriptor: params.descriptor,
            options: params.options,
            comparator: params.comparator,
            snapshots: params.snapshots,
            earliest_write_conflict_snapshot: params.earliest_write_conflict_snapshot,
            merge_operator: params.merge_operator,
            filter_supplier: params.filter_supplier,
            versions: params.versions,
            run_store: params.run_store,
            clock: params.clock,
            stats: params.stats,
            occurrence_listener: params.occurrence_listener,
            hotness_oracle: params.hotness_oracle,
            progress_tx: params.progress_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            boundaries: Vec::new(),
        }
    }

    pub fn job_id(&self) -> Ulid {
        self.job_id
    }

    /// Requests cancellation; subcompactions abort at their next record
    /// boundary.
    pub fn cancel(&self) {
        self.shutting_down.store(true, AtomicOrdering::SeqCst);
    }

    /// Plans the parallel split of the key range.
    ///
    /// The subcompaction count follows the total input size divided by
    /// [`CompactionOptions::subcompaction_size_hint`], clamped to
    /// `max_subcompactions`. Boundaries are taken from input file smallest
    /// keys, so no user key is ever split across subcompactions. Output
    /// file numbers are allocated lazily from the version set as builders
    /// open.
    pub fn prepare(&mut self) {
        self.boundaries.clear();
        if self.descriptor.gc.is_some() {
            return;
        }
        let total_bytes = self.descriptor.total_input_bytes();
        let hint = self.options.subcompaction_size_hint.max(1);
        let desired = (total_bytes.div_ceil(hint) as usize).max(1);
        let wanted = desired.min(self.options.max_subcompactions.max(1));
        if wanted <= 1 {
            return;
        }

        let mut keys: Vec<Bytes> = self
            .descriptor
            .input_files()
            .map(|f| f.smallest_key.clone())
            .collect();
        keys.sort_by(|a, b| self.comparator.compare(a, b));
        keys.dedup();
        // the global minimum would make the first range empty
        if !keys.is_empty() {
            keys.remove(0);
        }
        if keys.is_empty() {
            return;
        }

        let splits = (wanted - 1).min(keys.len());
        for i in 1..=splits {
            let idx = i * keys.len() / (splits + 1);
            let boundary = keys[idx.min(keys.len() - 1)].clone();
            if self.boundaries.last() != Some(&boundary) {
                self.boundaries.push(boundary);
            }
        }
        debug!(
            "prepared compaction job [job={}, subcompactions={}, input_bytes={}]",
            self.job_id,
            self.boundaries.len() + 1,
            total_bytes
        );
    }

    fn subcompaction_ranges(&self) -> Vec<(Option<Bytes>, Option<Bytes>)> {
        let mut bounds: Vec<Option<Bytes>> = vec![None];
        bounds.extend(self.boundaries.iter().cloned().map(Some));
        bounds.push(None);
        bounds
            .windows(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Runs all subcompactions to completion. On any failure every object
    /// the job wrote is deleted and the first error is returned.
    #[instrument(level = "debug", skip_all, fields(job = %self.job_id))]
    pub async fn run(&self, handle: &tokio::runtime::Handle) -> Result<JobOutputs, BasaltError> {
        if let Some(mode) = self.descriptor.gc {
            return self.run_gc(mode).await;
        }

        let ranges = self.subcompaction_ranges();
        info!(
            "starting compaction job [job={}, output_level={}, inputs={}, subcompactions={}]",
            self.job_id,
            self.descriptor.output_level,
            self.descriptor.input_files().count(),
            ranges.len()
        );

        let mut tasks = Vec::with_capacity(ranges.len());
        for (index, (start_key, end_key)) in ranges.into_iter().enumerate() {
            let ctx = SubcompactionContext {
                job_id: self.job_id,
                index,
                start_key,
                end_key,
                descriptor: self.descriptor.clone(),
                options: self.options.clone(),
                comparator: self.comparator.clone(),
                snapshots: self.snapshots.clone(),
                earliest_write_conflict_snapshot: self.earliest_write_conflict_snapshot,
                merge_operator: self.merge_operator.clone(),
                filter_supplier: self.filter_supplier.clone(),
                versions: self.versions.clone(),
                run_store: self.run_store.clone(),
                clock: self.clock.clone(),
                shutting_down: self.shutting_down.clone(),
                occurrence_listener: self.occurrence_listener.clone(),
                progress_tx: self.progress_tx.clone(),
            };
            let stats = self.stats.clone();
            stats.running_subcompactions.inc();
            tasks.push(handle.spawn(async move {
                let outcome = execute_subcompaction(ctx).await;
                stats.running_subcompactions.dec();
                outcome
            }));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    // panics inside the subcompaction body are caught in
                    // execute_subcompaction (keeping its produced file ids);
                    // a join error only remains for an aborted task
                    let error = if join_err.is_panic() {
                        BasaltError::BackgroundTaskPanic(Arc::new(std::sync::Mutex::new(
                            join_err.into_panic(),
                        )))
                    } else {
                        BasaltError::ShutdownInProgress
                    };
                    outcomes.push(SubcompactionOutcome {
                        result: Err(error),
                        produced_runs: Vec::new(),
                        produced_blobs: Vec::new(),
                    });
                }
            }
        }

        if let Some(err) = outcomes
            .iter()
            .find_map(|o| o.result.as_ref().err())
            .cloned()
        {
            error!(
                "compaction job failed, deleting outputs [job={}, error={:?}]",
                self.job_id, err
            );
            self.delete_produced(&outcomes).await;
            return Err(err);
        }

        let mut outputs = JobOutputs::default();
        for outcome in outcomes {
            let sub = outcome.result.expect("errors handled above");
            outputs.runs.extend(sub.runs);
            outputs.blobs.extend(sub.blobs);
            outputs.iteration_stats.merge_from(&sub.stats);
        }
        outputs
            .runs
            .sort_by(|a, b| self.comparator.compare(&a.smallest_key, &b.smallest_key));

        // no output may point at a blob that is neither a job output nor
        // resolvable in the base version
        let produced: HashSet<u64> = outputs.blobs.iter().map(|b| b.file_id).collect();
        let base = self.versions.current();
        for run in &outputs.runs {
            for dep in &run.dependencies {
                if !produced.contains(dep) && !base.blob_resolves(*dep) {
                    let err = BasaltError::DanglingBlobReference { file_id: *dep };
                    self.delete_outputs(&outputs).await;
                    return Err(err);
                }
            }
        }
        Ok(outputs)
    }

    /// Garbage-collection variant: rewrites the blob runs in the rebuild
    /// set, carrying only live values forward, and leaves data runs alone.
    async fn run_gc(&self, mode: GcMode) -> Result<JobOutputs, BasaltError> {
        let mut gc_inputs: Vec<u64> = self.descriptor.rebuild_blob_set.iter().copied().collect();
        gc_inputs.sort_unstable();
        info!(
            "starting gc compaction [job={}, mode={:?}, blob_files={}]",
            self.job_id,
            mode,
            gc_inputs.len()
        );
        let sink = BlobSink::new(
            self.run_store.clone(),
            self.versions.clone(),
            self.options.target_blob_file_size,
        );
        match self.rewrite_blobs(mode, &gc_inputs, &sink).await {
            Ok(()) => {
                let blobs = sink.finalize().await?;
                Ok(JobOutputs {
                    runs: Vec::new(),
                    blobs,
                    deleted_blobs: gc_inputs,
                    iteration_stats: CompactionIterationStats::default(),
                })
            }
            Err(err) => {
                for file_id in sink.produced_file_ids() {
                    if let Err(delete_err) = self.run_store.delete_blob_run(file_id).await {
                        warn!(
                            "failed deleting gc output [file_id={}, error={:?}]",
                            file_id, delete_err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn rewrite_blobs(
        &self,
        mode: GcMode,
        gc_inputs: &[u64],
        sink: &BlobSink,
    ) -> Result<(), BasaltError> {
        // lookback: collect the blob refs the live version still points at
        let live_refs = match mode {
            GcMode::NonPartitionedLookback => {
                let mut refs = HashSet::new();
                let base = self.versions.current();
                for level in &base.levels {
                    for run in level {
                        if !run
                            .dependencies
                            .iter()
                            .any(|d| self.descriptor.rebuild_blob_set.contains(d))
                        {
                            continue;
                        }
                        let bytes = self.run_store.read_data_run(run.file_id).await?;
                        let decoded = decode_data_run(bytes)?;
                        for entry in decoded.entries {
                            if let crate::types::EntryValue::Put(lazy) = &entry.value {
                                if let Some(blob_ref) = lazy.blob_ref() {
                                    refs.insert(blob_ref);
                                }
                            }
                        }
                    }
                }
                Some(refs)
            }
            _ => None,
        };

        for &file_id in gc_inputs {
            if self.shutting_down.load(AtomicOrdering::Relaxed) {
                return Err(BasaltError::ShutdownInProgress);
            }
            let bytes = self.run_store.read_blob_run(file_id).await?;
            let (records, meta) = decode_blob_run(bytes, file_id)?;
            for record in records {
                if let Some(live_refs) = &live_refs {
                    if !live_refs.contains(&record.blob_ref) {
                        continue;
                    }
                }
                let hint = match mode {
                    GcMode::PartitionedTriaged => self
                        .hotness_oracle
                        .as_ref()
                        .map(|o| o.placement(&record.key))
                        .unwrap_or(meta.hint),
                    GcMode::PartitionedNoTriage => meta.hint,
                    // non-partitioned modes write a single output stream
                    GcMode::NonPartitionedLookback | GcMode::NonPartitionedNoLookback => {
                        PlacementHint::Default
                    }
                };
                sink.rebuild(&record.key, record.seq, record.value, hint, file_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Paranoid read-back of every output file.
    pub async fn verify(&self, outputs: &JobOutputs) -> Result<(), BasaltError> {
        if !self.options.paranoid_checks {
            return Ok(());
        }
        for meta in &outputs.runs {
            let bytes = self.run_store.read_data_run(meta.file_id).await?;
            if crc32fast::hash(&bytes) != meta.checksum {
                return Err(BasaltError::OutputVerificationFailed {
                    msg: format!("run {} checksum drifted after write", meta.file_id),
                });
            }
            let decoded = decode_data_run(bytes)?;
            if decoded.entries.len() as u64 != meta.entry_count {
                return Err(BasaltError::OutputVerificationFailed {
                    msg: format!("run {} entry count mismatch", meta.file_id),
                });
            }
            for pair in decoded.entries.windows(2) {
                if cmp_internal(self.comparator.as_ref(), &pair[0], &pair[1]) != Ordering::Less {
                    return Err(BasaltError::OutputVerificationFailed {
                        msg: format!("run {} is not sorted", meta.file_id),
                    });
                }
            }
            let within = |key: &Bytes| {
                self.comparator.compare(key, &meta.smallest_key) != Ordering::Less
                    && self.comparator.compare(key, &meta.largest_key) != Ordering::Greater
            };
            if !decoded.entries.iter().all(|e| within(&e.key)) {
                return Err(BasaltError::OutputVerificationFailed {
                    msg: format!("run {} has keys outside its claimed bounds", meta.file_id),
                });
            }
        }
        for blob in &outputs.blobs {
            let bytes = self.run_store.read_blob_run(blob.file_id).await?;
            let (_, decoded_meta) = decode_blob_run(bytes, blob.file_id)?;
            if decoded_meta.value_count != blob.value_count {
                return Err(BasaltError::OutputVerificationFailed {
                    msg: format!("blob {} value count mismatch", blob.file_id),
                });
            }
        }
        Ok(())
    }

    /// Applies the version edit making the outputs visible and the inputs
    /// obsolete.
    #[instrument(level = "debug", skip_all, fields(job = %self.job_id))]
    pub async fn install(&self, outputs: &JobOutputs) -> Result<(), BasaltError> {
        let deleted_runs = if self.descriptor.gc.is_some() {
            Vec::new()
        } else {
            self.descriptor
                .inputs
                .iter()
                .flat_map(|input| input.files.iter().map(move |f| (input.level, f.file_id)))
                .collect()
        };
        let edit = VersionEdit {
            deleted_runs,
            new_runs: outputs.runs.clone(),
            new_blobs: outputs.blobs.clone(),
            deleted_blobs: outputs.deleted_blobs.clone(),
        };
        self.versions.log_and_apply(edit).await?;

        let bytes_written: u64 = outputs.runs.iter().map(|r| r.size).sum();
        self.stats.bytes_compacted.add(bytes_written);
        self.stats
            .output_files_created
            .add(outputs.runs.len() as u64);
        self.stats
            .blob_files_created
            .add(outputs.blobs.len() as u64);
        let now: chrono::DateTime<chrono::Utc> = self.clock.now().into();
        self.stats.last_compaction_ts.set(now.timestamp());
        info!(
            "installed compaction [job={}, output_runs={}, output_blobs={}, bytes={}, \
             records_in={}, records_out={}]",
            self.job_id,
            outputs.runs.len(),
            outputs.blobs.len(),
            bytes_written,
            outputs.iteration_stats.num_input_records,
            outputs.iteration_stats.num_output_records,
        );
        Ok(())
    }

    /// All four phases with failure cleanup.
    pub async fn execute(
        &mut self,
        handle: &tokio::runtime::Handle,
    ) -> Result<JobOutputs, BasaltError> {
        self.prepare();
        let outputs = self.run(handle).await?;
        if let Err(err) = self.verify(&outputs).await {
            self.delete_outputs(&outputs).await;
            return Err(err);
        }
        if let Err(err) = self.install(&outputs).await {
            self.delete_outputs(&outputs).await;
            return Err(err);
        }
        Ok(outputs)
    }

    async fn delete_produced(&self, outcomes: &[SubcompactionOutcome]) {
        for outcome in outcomes {
            for &file_id in &outcome.produced_runs {
                if let Err(err) = self.run_store.delete_data_run(file_id).await {
                    warn!(
                        "failed deleting output run [file_id={}, error={:?}]",
                        file_id, err
                    );
                }
            }
            for &file_id in &outcome.produced_blobs {
                if let Err(err) = self.run_store.delete_blob_run(file_id).await {
                    warn!(
                        "failed deleting output blob [file_id={}, error={:?}]",
                        file_id, err
                    );
                }
            }
        }
    }

    async fn delete_outputs(&self, outputs: &JobOutputs) {
        let outcome = SubcompactionOutcome {
            result: Err(BasaltError::ShutdownInProgress),
            produced_runs: outputs.runs.iter().map(|r| r.file_id).collect(),
            produced_blobs: outputs.blobs.iter().map(|b| b.file_id).collect(),
        };
        self.delete_produced(std::slice::from_ref(&outcome)).await;
    }
}

struct SubcompactionOutputs {
    runs: Vec<crate::version::RunFileMeta>,
    blobs: Vec<crate::blob_format::BlobFileMeta>,
    stats: CompactionIterationStats,
}

struct SubcompactionOutcome {
    result: Result<SubcompactionOutputs, BasaltError>,
    produced_runs: Vec<u64>,
    produced_blobs: Vec<u64>,
}

struct SubcompactionContext {
    job_id: Ulid,
    index: usize,
    start_key: Option<Bytes>,
    end_key: Option<Bytes>,
    descriptor: Arc<CompactionDescriptor>,
    options: CompactionOptions,
    comparator: ComparatorRef,
    snapshots: SnapshotVector,
    earliest_write_conflict_snapshot: u64,
    merge_operator: Option<MergeOperatorType>,
    filter_supplier: Option<Arc<dyn CompactionFilterSupplier>>,
    versions: Arc<dyn VersionSet>,
    run_store: Arc<RunStore>,
    clock: Arc<dyn SystemClock>,
    shutting_down: Arc<AtomicBool>,
    occurrence_listener: Option<Arc<dyn KeyOccurrenceListener>>,
    progress_tx: Option<UnboundedSender<JobProgress>>,
}

impl SubcompactionContext {
    fn clamp_tombstone(&self, entry: &RowEntry) -> Option<RangeTombstone> {
        let crate::types::EntryValue::RangeTombstone { end_key } = &entry.value else {
            return None;
        };
        let mut start = entry.key.clone();
        let mut end = end_key.clone();
        if let Some(range_start) = &self.start_key {
            if self.comparator.compare(&start, range_start) == Ordering::Less {
                start = range_start.clone();
            }
        }
        if let Some(range_end) = &self.end_key {
            if self.comparator.compare(&end, range_end) == Ordering::Greater {
                end = range_end.clone();
            }
        }
        if self.comparator.compare(&start, &end) == Ordering::Less {
            Some(RangeTombstone {
                start_key: start,
                end_key: end,
                seq: entry.seq,
            })
        } else {
            None
        }
    }

    async fn run(
        &self,
        range_del_agg: &Arc<Mutex<RangeDelAggregator>>,
        sink: &Arc<BlobSink>,
        writer: &mut OutputWriter,
    ) -> Result<(CompactionIterationStats, Vec<crate::version::RunFileMeta>), BasaltError> {
        // build per-source iterators, seeding the aggregator with every
        // tombstone that straddles into this range
        let mut source_iters = Vec::new();
        for file in self.descriptor.input_files() {
            let bytes = self.run_store.read_data_run(file.file_id).await?;
            let decoded = decode_data_run(bytes)?;
            {
                let mut agg = range_del_agg.lock();
                for tombstone_entry in &decoded.range_tombstones {
                    if let Some(tombstone) = self.clamp_tombstone(tombstone_entry) {
                        agg.add_tombstone(tombstone);
                    }
                }
            }
            source_iters.push(RunIterator::new(decoded.entries, self.comparator.clone()));
        }

        let mut merged = MergeIterator::new(source_iters, self.comparator.clone());
        merged.init().await?;
        if let Some(start_key) = &self.start_key {
            merged.seek(start_key).await?;
        }

        let compaction_filter = match &self.filter_supplier {
            Some(supplier) => Some(
                supplier
                    .create_compaction_filter(&CompactionFilterContext {
                        output_level: self.descriptor.output_level,
                        bottommost_level: self.descriptor.bottommost_level,
                    })
                    .await
                    .map_err(BasaltError::from)?,
            ),
            None => None,
        };
        let separation = match self.descriptor.separation {
            SeparationType::None => None,
            SeparationType::Separate | SeparationType::Rebuild => {
                Some(sink.clone() as Arc<dyn ValueSeparation>)
            }
        };
        let view = Arc::new(DescriptorView::new(
            self.descriptor.clone(),
            self.versions.current(),
            self.comparator.clone(),
        ));

        let mut iter = CompactionIterator::new(
            merged,
            CompactionIteratorParams {
                comparator: self.comparator.clone(),
                snapshots: self.snapshots.clone(),
                earliest_write_conflict_snapshot: self.earliest_write_conflict_snapshot,
                view,
                range_del_agg: range_del_agg.clone(),
                merge_operator: self.merge_operator.clone(),
                compaction_filter,
                filter_sample_interval: self.options.filter_sample_interval,
                separation,
                blob_config: self.descriptor.blob_config,
                rebuild_blob_set: Arc::new(self.descriptor.rebuild_blob_set.clone()),
                end_key: self.end_key.clone(),
                shutting_down: Some(self.shutting_down.clone()),
                occurrence_listener: self.occurrence_listener.clone(),
            },
        );
        iter.init().await?;

        let mut last_report = self.clock.now();
        while let Some(entry) = iter.next_entry().await? {
            writer.add(entry).await?;
            if let Some(tx) = &self.progress_tx {
                let now = self.clock.now();
                let elapsed = now
                    .duration_since(last_report)
                    .unwrap_or_default();
                if elapsed >= self.options.progress_interval {
                    let _ = tx.send(JobProgress::SubcompactionProgress {
                        job_id: self.job_id,
                        subcompaction: self.index,
                        bytes_processed: iter.bytes_processed(),
                    });
                    last_report = now;
                }
            }
        }

        let runs = writer.finish().await?;
        Ok((iter.iter_stats().clone(), runs))
    }
}

async fn execute_subcompaction(ctx: SubcompactionContext) -> SubcompactionOutcome {
    let range_del_agg = Arc::new(Mutex::new(RangeDelAggregator::new(
        ctx.snapshots.clone(),
        ctx.comparator.clone(),
    )));
    let sink = Arc::new(BlobSink::new(
        ctx.run_store.clone(),
        ctx.versions.clone(),
        ctx.options.target_blob_file_size,
    ));
    let mut writer = OutputWriter::new(
        ctx.run_store.clone(),
        ctx.versions.clone(),
        ctx.comparator.clone(),
        ctx.descriptor.output_level,
        ctx.options.target_output_file_size,
        range_del_agg.clone(),
        ctx.descriptor.bottommost_level,
    );

    // Catch panics here rather than at the join boundary: `writer` and
    // `sink` must still be readable afterwards so everything this
    // subcompaction already uploaded gets deleted with the rest.
    let run_result = AssertUnwindSafe(ctx.run(&range_del_agg, &sink, &mut writer))
        .catch_unwind()
        .await;
    let result = match run_result {
        Ok(Ok((stats, runs))) => match sink.finalize().await {
            Ok(blobs) => Ok(SubcompactionOutputs { runs, blobs, stats }),
            Err(err) => Err(err),
        },
        Ok(Err(err)) => Err(err),
        Err(panic) => Err(BasaltError::BackgroundTaskPanic(Arc::new(
            std::sync::Mutex::new(panic),
        ))),
    };

    if let Some(tx) = &ctx.progress_tx {
        let _ = tx.send(JobProgress::SubcompactionFinished {
            job_id: ctx.job_id,
            subcompaction: ctx.index,
            result: result.as_ref().map(|_| ()).map_err(|e| e.clone()),
        });
    }

    let produced_runs = writer.produced_file_ids();
    let produced_blobs = sink.produced_file_ids();
    SubcompactionOutcome {
        result,
        produced_runs,
        produced_blobs,
    }
}
