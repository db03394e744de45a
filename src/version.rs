use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::blob_format::BlobFileMeta;
use crate::comparator::ComparatorRef;
use crate::error::BasaltError;

/// Metadata describing one data run on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFileMeta {
    pub file_id: u64,
    pub level: u32,
    pub smallest_key: Bytes,
    pub largest_key: Bytes,
    pub size: u64,
    pub entry_count: u64,
    /// Blob file ids referenced by records in this run.
    pub dependencies: Vec<u64>,
    /// crc32 of the encoded file, recorded at build time and re-checked by
    /// the paranoid verify phase.
    pub checksum: u32,
}

/// An immutable view of the store's file tree: data runs per level plus the
/// live blob files.
///
/// The version set and manifest machinery live outside the core; compaction
/// only reads the current version and hands an edit back for installation.
#[derive(Debug, Clone, Default)]
pub struct Version {
    /// `levels[l]` holds level `l`'s runs sorted by smallest key; levels > 0
    /// are non-overlapping.
    pub levels: Vec<Vec<RunFileMeta>>,
    pub blob_files: HashMap<u64, BlobFileMeta>,
}

impl Version {
    pub fn new(number_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); number_levels],
            blob_files: HashMap::new(),
        }
    }

    pub fn blob_is_live(&self, file_id: u64) -> bool {
        self.blob_files.contains_key(&file_id)
    }

    /// Whether a dependency on `file_id` can still be satisfied: the blob is
    /// live directly, or a live blob absorbed its values during GC and lists
    /// it in its inheritance chain.
    pub fn blob_resolves(&self, file_id: u64) -> bool {
        self.blob_is_live(file_id)
            || self
                .blob_files
                .values()
                .any(|b| b.inheritance.contains(&file_id))
    }

    /// Whether `user_key` provably has no data in any level strictly below
    /// the output level.
    ///
    /// `level_ptrs[l]` remembers the last file probed in level `l`; user
    /// keys within a subcompaction only move forward, so each level's scan
    /// resumes where the previous call stopped instead of restarting.
    pub fn key_not_exists_beyond_level(
        &self,
        comparator: &ComparatorRef,
        user_key: &[u8],
        output_level: u32,
        level_ptrs: &mut [usize],
    ) -> bool {
        for (level, files) in self
            .levels
            .iter()
            .enumerate()
            .skip(output_level as usize + 1)
        {
            let ptr = &mut level_ptrs[level];
            while *ptr < files.len() {
                let file = &files[*ptr];
                if comparator.compare(user_key, &file.largest_key) == Ordering::Greater {
                    *ptr += 1;
                    continue;
                }
                if comparator.compare(user_key, &file.smallest_key) != Ordering::Less {
                    // key falls inside this file's range; it may exist there
                    return false;
                }
                break;
            }
        }
        true
    }
}

/// The delta a finished compaction applies to the version.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    /// `(level, file_id)` pairs of consumed input runs.
    pub deleted_runs: Vec<(u32, u64)>,
    pub new_runs: Vec<RunFileMeta>,
    pub new_blobs: Vec<BlobFileMeta>,
    /// Blob runs fully rewritten by a GC compaction.
    pub deleted_blobs: Vec<u64>,
}

/// The version-set seam the core installs into. Real engines put the
/// manifest behind this; tests use [`InMemoryVersionSet`].
#[async_trait]
pub trait VersionSet: Send + Sync {
    fn current(&self) -> Arc<Version>;

    /// Hands out the next output file number. Must be unique across data and
    /// blob runs.
    fn allocate_file_number(&self) -> u64;

    /// Atomically applies the edit, making the compaction's outputs visible.
    async fn log_and_apply(&self, edit: VersionEdit) -> Result<(), BasaltError>;
}

/// In-memory version set used by tests and embedders that manage durability
/// themselves.
pub struct InMemoryVersionSet {
    current: RwLock<Arc<Version>>,
    next_file_number: AtomicU64,
}

impl InMemoryVersionSet {
    pub fn new(version: Version, next_file_number: u64) -> Self {
        Self {
            current: RwLock::new(Arc::new(version)),
            next_file_number: AtomicU64::new(next_file_number),
        }
    }
}

#[async_trait]
impl VersionSet for InMemoryVersionSet {
    fn current(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    fn allocate_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, AtomicOrdering::SeqCst)
    }

    async fn log_and_apply(&self, edit: VersionEdit) -> Result<(), BasaltError> {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        for (level, file_id) in &edit.deleted_runs {
            let files = next.levels.get_mut(*level as usize).ok_or_else(|| {
                BasaltError::InvalidCompaction {
                    msg: format!("edit deletes from unknown level {level}"),
                }
            })?;
            files.retain(|f| f.file_id != *file_id);
        }
        for blob in edit.new_blobs {
            next.blob_files.insert(blob.file_id, blob);
        }
        for file_id in &edit.deleted_blobs {
            next.blob_files.remove(file_id);
        }
        for run in edit.new_runs {
            for dep in &run.dependencies {
                if !next.blob_resolves(*dep) {
                    return Err(BasaltError::DanglingBlobReference { file_id: *dep });
                }
            }
            let level = run.level as usize;
            if next.levels.len() <= level {
                next.levels.resize(level + 1, Vec::new());
            }
            let files = &mut next.levels[level];
            let pos = files.partition_point(|f| f.smallest_key < run.smallest_key);
            files.insert(pos, run);
        }
        *guard = Arc::new(next);
        Ok(())
    }
}
