//! Compaction filter API for user-defined record filtering during
//! compaction.
//!
//! **Warning:** filters run below the snapshot machinery. A filter may drop
//! or rewrite records that an active snapshot expects to see; callers that
//! need strict snapshot consistency must account for this in their filter
//! logic. The iterator only consults the filter for records that are
//! committed and visible at the top reachable snapshot bucket.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::RowEntry;

/// Read-only facts about the compaction a filter instance runs inside.
#[derive(Debug, Clone)]
pub struct CompactionFilterContext {
    /// The level the compaction writes to.
    pub output_level: u32,
    /// Whether the output level is the bottommost for this key range.
    pub bottommost_level: bool,
}

/// Verdict returned by a compaction filter for a record.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionFilterDecision {
    /// Emit the record unchanged.
    Keep,
    /// Drop the record as if a deletion had occurred.
    ///
    /// WARNING: dropping leaves no tombstone behind. On any level other
    /// than the bottommost, older versions of the key below the output
    /// level become visible again.
    Remove,
    /// Emit a Put carrying the substituted value; separation thresholds are
    /// re-applied to the new bytes.
    ChangeValue(Bytes),
    /// Drop the record and every following record whose user key is below
    /// `skip_until`, then resume normal processing.
    RemoveAndSkipUntil(Bytes),
}

/// Errors surfaced by filter construction or invocation. Any of these abort
/// the compaction.
#[derive(Debug, Error)]
pub enum CompactionFilterError {
    #[error("filter creation failed: {0}")]
    CreationError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("filter error: {0}")]
    FilterError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Filter consulted for committed, visible Put records during compaction.
///
/// One instance is created per subcompaction and runs single-threaded on
/// that subcompaction's task, so implementations may keep mutable state
/// without synchronization. The filter must base its verdict only on the
/// record it is handed, never on iterator state.
#[async_trait]
pub trait CompactionFilter: Send + Sync {
    /// Returns the verdict for one record. The entry's value is always
    /// materialized inline before the filter sees it.
    async fn filter(
        &mut self,
        entry: &RowEntry,
    ) -> Result<CompactionFilterDecision, CompactionFilterError>;

    /// Called once after the subcompaction has consumed its entire input.
    /// Not invoked when compaction aborts early.
    async fn on_compaction_end(&mut self) -> Result<(), CompactionFilterError> {
        Ok(())
    }
}

/// Factory creating one [`CompactionFilter`] per subcompaction.
///
/// The supplier is shared across jobs and must be thread-safe; each filter
/// instance it creates is confined to a single subcompaction.
#[async_trait]
pub trait CompactionFilterSupplier: Send + Sync {
    async fn create_compaction_filter(
        &self,
        context: &CompactionFilterContext,
    ) -> Result<Box<dyn CompactionFilter>, CompactionFilterError>;
}
