use bytes::Bytes;

use crate::blob_format::PlacementHint;

/// One observation of a user key during compaction, emitted when the
/// iterator enters a new user-key group.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyOccurrence {
    pub user_key: Bytes,
    /// The blob run holding the key's newest value, when that value is
    /// separated. Downstream hotness tracking uses this to attribute reads
    /// and rewrites to blob files.
    pub latest_valid_fileno: Option<u64>,
}

/// Observer for key occurrences. The iterator calls this once per user-key
/// group; consumers aggregate into whatever hotness model they maintain.
pub trait KeyOccurrenceListener: Send + Sync {
    fn on_key_occurrence(&self, occurrence: KeyOccurrence);
}

/// Decides where a value should be placed during a triaged GC compaction.
pub trait HotnessOracle: Send + Sync {
    fn placement(&self, user_key: &[u8]) -> PlacementHint;
}
