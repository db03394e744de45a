use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::comparator::ComparatorRef;
use crate::config::BlobConfig;
use crate::version::{RunFileMeta, Version};

/// How a compaction treats large values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationType {
    /// Values stay inline; existing indirections pass through.
    None,
    /// Values past the blob thresholds are separated into blob runs.
    Separate,
    /// Like `Separate`, and indirections into blobs listed in the rebuild
    /// set are rewritten into fresh blob runs regardless of size.
    Rebuild,
}

/// Input-reading discipline of a garbage-collection compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Re-check each indirection against the live version; drop dead ones.
    NonPartitionedLookback,
    /// Trust that every input indirection is live.
    NonPartitionedNoLookback,
    /// Split live values into Hot/Warm/Cold blob outputs by a hotness
    /// oracle.
    PartitionedTriaged,
    /// Partition by each record's existing placement hint only.
    PartitionedNoTriage,
}

/// One level's worth of compaction inputs.
#[derive(Debug, Clone)]
pub struct CompactionInput {
    pub level: u32,
    pub files: Vec<RunFileMeta>,
}

/// Everything a compaction was decided with: inputs, destination, and the
/// policy toggles the iterator consults. The scheduler that builds these is
/// not part of the core.
#[derive(Debug, Clone)]
pub struct CompactionDescriptor {
    pub inputs: Vec<CompactionInput>,
    pub output_level: u32,
    pub number_levels: u32,
    /// Whether the output level is the lowest at which this key range
    /// exists; records dropped here cannot reappear from below.
    pub bottommost_level: bool,
    /// Upper bound of user keys at the output level, when known.
    pub largest_user_key: Option<Bytes>,
    /// Reserves the bottommost level for externally ingested files; disables
    /// bottommost-only drops and sequence zeroing.
    pub allow_ingest_behind: bool,
    /// When set, tombstones at or above `preserve_deletes_seqnum` are
    /// emitted verbatim.
    pub preserve_deletes: bool,
    pub preserve_deletes_seqnum: u64,
    pub separation: SeparationType,
    pub blob_config: BlobConfig,
    /// Blob file ids whose values must be rewritten under
    /// [`SeparationType::Rebuild`].
    pub rebuild_blob_set: HashSet<u64>,
    /// Present for garbage-collection compactions, which bypass the record
    /// policy and rewrite blob runs only.
    pub gc: Option<GcMode>,
}

impl CompactionDescriptor {
    pub fn input_files(&self) -> impl Iterator<Item = &RunFileMeta> {
        self.inputs.iter().flat_map(|input| input.files.iter())
    }

    pub fn total_input_bytes(&self) -> u64 {
        self.input_files().map(|f| f.size).sum()
    }
}

/// The small slice of compaction metadata the iterator needs, behind a trait
/// so tests can fabricate it without building a whole descriptor and
/// version.
pub trait CompactionView: Send + Sync {
    fn separation_type(&self) -> SeparationType;
    fn level(&self) -> u32;
    fn bottommost_level(&self) -> bool;
    fn number_levels(&self) -> u32;
    fn largest_user_key(&self) -> Option<&Bytes>;
    fn allow_ingest_behind(&self) -> bool;
    fn preserve_deletes(&self) -> bool;
    fn preserve_deletes_seqnum(&self) -> u64;
    /// Whether `user_key` provably has no data below the output level.
    /// `level_ptrs` carries the per-level probe positions between calls.
    fn key_not_exists_beyond_output_level(
        &self,
        user_key: &[u8],
        level_ptrs: &mut [usize],
    ) -> bool;
}

/// Production view over a descriptor and the base version.
pub struct DescriptorView {
    descriptor: Arc<CompactionDescriptor>,
    base: Arc<Version>,
    comparator: ComparatorRef,
}

impl DescriptorView {
    pub fn new(
        descriptor: Arc<CompactionDescriptor>,
        base: Arc<Version>,
        comparator: ComparatorRef,
    ) -> Self {
        Self {
            descriptor,
            base,
            comparator,
        }
    }
}

impl CompactionView for DescriptorView {
    fn separation_type(&self) -> SeparationType {
        self.descriptor.separation
    }

    fn level(&self) -> u32 {
        self.descriptor.output_level
    }

    fn bottommost_level(&self) -> bool {
        self.descriptor.bottommost_level
    }

    fn number_levels(&self) -> u32 {
        self.descriptor.number_levels
    }

    fn largest_user_key(&self) -> Option<&Bytes> {
        self.descriptor.largest_user_key.as_ref()
    }

    fn allow_ingest_behind(&self) -> bool {
        self.descriptor.allow_ingest_behind
    }

    fn preserve_deletes(&self) -> bool {
        self.descriptor.preserve_deletes
    }

    fn preserve_deletes_seqnum(&self) -> u64 {
        self.descriptor.preserve_deletes_seqnum
    }

    fn key_not_exists_beyond_output_level(
        &self,
        user_key: &[u8],
        level_ptrs: &mut [usize],
    ) -> bool {
        self.base.key_not_exists_beyond_level(
            &self.comparator,
            user_key,
            self.descriptor.output_level,
            level_ptrs,
        )
    }
}
