use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use crate::comparator::ComparatorRef;
use crate::error::BasaltError;
use crate::range_del::{RangeDelAggregator, RangeTombstone};
use crate::run_format::DataRunBuilder;
use crate::run_store::RunStore;
use crate::types::RowEntry;
use crate::version::{RunFileMeta, VersionSet};

/// Streams a subcompaction's surviving records into rolling output data
/// runs.
///
/// The current builder rolls once it grows past the target file size; each
/// finished run embeds the range tombstones overlapping its key bounds, and
/// tombstones overlapping no run get one trailing run of their own so
/// nothing a reader needs is dropped. Builders open lazily on the first
/// record after a roll.
pub(crate) struct OutputWriter {
    run_store: Arc<RunStore>,
    versions: Arc<dyn VersionSet>,
    comparator: ComparatorRef,
    output_level: u32,
    target_file_size: u64,
    range_del_agg: Arc<Mutex<RangeDelAggregator>>,
    bottommost: bool,
    current: Option<DataRunBuilder>,
    finished: Vec<RunFileMeta>,
}

impl OutputWriter {
    pub(crate) fn new(
        run_store: Arc<RunStore>,
        versions: Arc<dyn VersionSet>,
        comparator: ComparatorRef,
        output_level: u32,
        target_file_size: u64,
        range_del_agg: Arc<Mutex<RangeDelAggregator>>,
        bottommost: bool,
    ) -> Self {
        Self {
            run_store,
            versions,
            comparator,
            output_level,
            target_file_size,
            range_del_agg,
            bottommost,
            current: None,
            finished: Vec::new(),
        }
    }

    pub(crate) async fn add(&mut self, entry: RowEntry) -> Result<(), BasaltError> {
        let builder = self.current.get_or_insert_with(|| {
            DataRunBuilder::new(
                self.versions.allocate_file_number(),
                self.output_level,
                self.comparator.clone(),
            )
        });
        builder.add(&entry)?;
        if builder.file_size() >= self.target_file_size {
            self.roll().await?;
        }
        Ok(())
    }

    fn output_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_del_agg
            .lock()
            .tombstones_for_output(self.bottommost)
    }

    fn overlaps_range(
        &self,
        tombstone: &RangeTombstone,
        smallest: &Bytes,
        largest: &Bytes,
    ) -> bool {
        self.comparator.compare(&tombstone.start_key, largest) != Ordering::Greater
            && self.comparator.compare(smallest, &tombstone.end_key) == Ordering::Less
    }

    /// Closes the current builder, embedding the tombstones relevant to its
    /// key range, and uploads the finished run.
    async fn roll(&mut self) -> Result<(), BasaltError> {
        let Some(mut builder) = self.current.take() else {
            return Ok(());
        };
        if builder.is_empty() {
            builder.abandon();
            return Ok(());
        }
        let smallest = builder.smallest_key().cloned().unwrap_or_default();
        let largest = builder.largest_key().cloned().unwrap_or_default();
        for tombstone in self.output_tombstones() {
            if self.overlaps_range(&tombstone, &smallest, &largest) {
                builder.add_range_tombstone(&tombstone);
            }
        }
        let (bytes, meta) = builder.finish();
        debug!(
            "finished output run [file_id={}, entries={}, size={}]",
            meta.file_id, meta.entry_count, meta.size
        );
        self.run_store.write_data_run(meta.file_id, bytes).await?;
        self.finished.push(meta);
        Ok(())
    }

    /// Flushes the last builder and gives leftover range tombstones a run of
    /// their own, so an input of nothing but tombstones still produces one
    /// output run.
    pub(crate) async fn finish(&mut self) -> Result<Vec<RunFileMeta>, BasaltError> {
        self.roll().await?;
        let leftovers: Vec<RangeTombstone> = self
            .output_tombstones()
            .into_iter()
            .filter(|t| {
                !self
                    .finished
                    .iter()
                    .any(|meta| self.overlaps_range(t, &meta.smallest_key, &meta.largest_key))
            })
            .collect();
        if !leftovers.is_empty() {
            let mut builder = DataRunBuilder::new(
                self.versions.allocate_file_number(),
                self.output_level,
                self.comparator.clone(),
            );
            for tombstone in &leftovers {
                builder.add_range_tombstone(tombstone);
            }
            let (bytes, meta) = builder.finish();
            self.run_store.write_data_run(meta.file_id, bytes).await?;
            self.finished.push(meta);
        }
        Ok(self.finished.clone())
    }

    /// File ids of every run uploaded so far, for failure cleanup.
    pub(crate) fn produced_file_ids(&self) -> Vec<u64> {
        self.finished.iter().map(|meta| meta.file_id).collect()
    }
}
