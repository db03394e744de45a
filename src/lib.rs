//! basalt is the compaction core of an LSM key-value storage engine.
//!
//! The crate turns a merged, sequence-ordered stream of internal records
//! into the reduced stream a compaction must write out, preserving what
//! every live snapshot can see while discarding as much history as safely
//! possible. Two pieces carry the weight:
//!
//! - [`CompactionIterator`]: the per-subcompaction transducer applying
//!   snapshot visibility, tombstone suppression, single-delete pairing,
//!   merge-operand resolution, user filtering, and large-value separation.
//! - [`CompactionJob`]: the orchestrator that partitions the key range into
//!   parallel subcompactions, writes output runs and blob runs through an
//!   [`object_store::ObjectStore`], optionally verifies them, and installs
//!   the result as one atomic version edit.
//!
//! Choosing *what* to compact, the manifest, the write path, and the read
//! path all live outside this crate; they connect through [`VersionSet`],
//! [`EntryIterator`], and the filter/merge/snapshot seams re-exported
//! below.
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic, clippy::unwrap_used))]
#![allow(clippy::result_large_err, clippy::too_many_arguments)]

/// Re-export the bytes crate: keys and values surface as [`bytes::Bytes`].
pub use bytes;

/// Re-export the object store crate backing run and blob file IO.
pub use object_store;

pub use blob_format::{BlobFileMeta, PlacementHint};
pub use blob_store::{BlobStore, ValueSeparation};
pub use compaction::{
    CompactionDescriptor, CompactionInput, CompactionView, DescriptorView, GcMode, SeparationType,
};
pub use compaction_filter::{
    CompactionFilter, CompactionFilterContext, CompactionFilterDecision, CompactionFilterError,
    CompactionFilterSupplier,
};
pub use compaction_iterator::{CompactionIterator, CompactionIteratorParams};
pub use compaction_job::{CompactionJob, CompactionJobParams, JobOutputs, JobProgress};
pub use comparator::{bytewise, BytewiseComparator, Comparator, ComparatorRef};
pub use config::{BlobConfig, CompactionOptions};
pub use error::BasaltError;
pub use hotness::{HotnessOracle, KeyOccurrence, KeyOccurrenceListener};
pub use iter::EntryIterator;
pub use lazy_value::{BlobRef, LazyValue};
pub use merge_iterator::MergeIterator;
pub use merge_operator::{MergeOperator, MergeOperatorError, MergeOperatorType};
pub use range_del::{RangeDelAggregator, RangeDelMode, RangeTombstone};
pub use run_store::RunStore;
pub use snapshot::{SnapshotCheck, SnapshotChecker, SnapshotVector};
pub use types::{EntryValue, RowEntry, MAX_SEQUENCE_NUMBER};
pub use version::{InMemoryVersionSet, RunFileMeta, Version, VersionEdit, VersionSet};

pub mod clock;
pub mod config;
pub mod stats;

mod blob_format;
mod blob_store;
mod compaction;
mod compaction_filter;
mod compaction_iterator;
mod compaction_job;
mod comparator;
mod error;
mod hotness;
mod iter;
mod lazy_value;
mod merge_helper;
mod merge_iterator;
mod merge_operator;
mod output_writer;
mod peeking_iterator;
mod range_del;
mod row_codec;
mod run_format;
mod run_store;
mod snapshot;
#[cfg(test)]
mod test_utils;
mod types;
mod version;
