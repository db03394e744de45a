use async_trait::async_trait;

use crate::error::BasaltError;
use crate::types::RowEntry;

/// Forward iterator over internal records.
///
/// Note: this is intentionally its own trait instead of `Iterator<Item=..>`
/// because `next_entry` must be async; inputs are sorted runs loaded from
/// object storage.
#[async_trait]
pub trait EntryIterator: Send + Sync {
    /// Performs any expensive initialization required before regular
    /// iteration.
    ///
    /// This method should be idempotent and can be called multiple times;
    /// only the first call should perform expensive operations.
    async fn init(&mut self) -> Result<(), BasaltError>;

    /// Returns the next entry in internal-key order, or `None` once the
    /// input is exhausted.
    ///
    /// NOTE: iterators are not initialized implicitly on `next_entry`; the
    /// caller must call [`EntryIterator::init`] first. This keeps eager
    /// initialization optimizations from being lost in refactors.
    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError>;

    /// Seek to the next entry whose user key is `>= next_key` (inclusive).
    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError>;
}

#[async_trait]
impl<'a> EntryIterator for Box<dyn EntryIterator + 'a> {
    async fn init(&mut self) -> Result<(), BasaltError> {
        self.as_mut().init().await
    }

    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        self.as_mut().next_entry().await
    }

    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError> {
        self.as_mut().seek(next_key).await
    }
}
