use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum MergeOperatorError {
    #[error("merge operands could not be combined: {msg}")]
    OperandsIncompatible { msg: String },
}

/// User-supplied operator that folds merge operands into a value.
///
/// Merge records let applications skip the read/modify/write cycle for
/// computations expressible as an associative operator: counters, sums,
/// append-only buffers. Compaction folds chains of operands into a single
/// record whenever visibility rules allow.
///
/// # Associativity requirement
/// The operation MUST be associative: for any values a, b, and c,
/// `merge(merge(a, b), c) == merge(a, merge(b, c))`. Compaction may fold
/// partial chains (with no base value) in any grouping.
///
/// # Example
/// ```
/// use bytes::Bytes;
/// use basalt::{MergeOperator, MergeOperatorError};
///
/// struct CounterMergeOperator;
///
/// impl MergeOperator for CounterMergeOperator {
///     fn merge(
///         &self,
///         _key: &Bytes,
///         existing_value: Option<Bytes>,
///         operand: Bytes,
///     ) -> Result<Bytes, MergeOperatorError> {
///         let existing = existing_value
///             .map(|v| u64::from_le_bytes(v.as_ref().try_into().unwrap()))
///             .unwrap_or(0);
///         let increment = u64::from_le_bytes(operand.as_ref().try_into().unwrap());
///         Ok(Bytes::copy_from_slice(&(existing + increment).to_le_bytes()))
///     }
/// }
/// ```
pub trait MergeOperator {
    /// Merges the accumulated value (if any) with the next operand.
    ///
    /// `existing_value` is `None` when the chain has no base value (the
    /// partial-merge case); the operand then seeds the accumulator.
    fn merge(
        &self,
        key: &Bytes,
        existing_value: Option<Bytes>,
        operand: Bytes,
    ) -> Result<Bytes, MergeOperatorError>;
}

pub type MergeOperatorType = Arc<dyn MergeOperator + Send + Sync>;
