use std::any::Any;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::compaction_filter::CompactionFilterError;
use crate::merge_operator::MergeOperatorError;

#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum BasaltError {
    #[error("IO error: {0}")]
    IoError(#[from] Arc<std::io::Error>),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] Arc<object_store::Error>),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Corruption: {msg}")]
    Corruption { msg: String },

    #[error("Merge operand encountered but no merge operator is configured")]
    MergeOperatorNotSupported,

    #[error("Merge operator error: {0}")]
    MergeOperatorError(#[from] MergeOperatorError),

    #[error("Compaction filter error: {0}")]
    CompactionFilterError(Arc<CompactionFilterError>),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Incomplete: iteration stopped before the end of input")]
    Incomplete,

    #[error("Invalid record: {msg}")]
    InvalidRecord { msg: String },

    #[error("Iterator used before initialization")]
    IteratorNotInitialized,

    #[error("Output references blob file {file_id} which is neither a job output nor live")]
    DanglingBlobReference { file_id: u64 },

    #[error("Invalid compaction: {msg}")]
    InvalidCompaction { msg: String },

    #[error("Output run failed verification: {msg}")]
    OutputVerificationFailed { msg: String },

    #[error("background task panic'd")]
    // panic args are wrapped in Arc<Mutex<..>> so the error stays Clone + Sync
    BackgroundTaskPanic(Arc<Mutex<Box<dyn Any + Send>>>),
}

impl From<std::io::Error> for BasaltError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

impl From<object_store::Error> for BasaltError {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStoreError(Arc::new(value))
    }
}

impl From<CompactionFilterError> for BasaltError {
    fn from(value: CompactionFilterError) -> Self {
        Self::CompactionFilterError(Arc::new(value))
    }
}

impl BasaltError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption { msg: msg.into() }
    }
}
