use std::cmp::Ordering;
use std::sync::Arc;

use crate::types::RowEntry;

/// Total order over user keys.
///
/// The compaction core never interprets key bytes itself; every key
/// comparison goes through the comparator supplied on the descriptor.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

pub type ComparatorRef = Arc<dyn Comparator>;

/// Lexicographic byte order, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

pub fn bytewise() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

/// Internal-key order: ascending user key, then descending sequence number,
/// then descending kind rank. For a given user key, newer records sort first.
pub(crate) fn cmp_internal(cmp: &dyn Comparator, a: &RowEntry, b: &RowEntry) -> Ordering {
    match cmp.compare(&a.key, &b.key) {
        Ordering::Equal => match b.seq.cmp(&a.seq) {
            Ordering::Equal => b.value.rank().cmp(&a.value.rank()),
            ord => ord,
        },
        ord => ord,
    }
}
