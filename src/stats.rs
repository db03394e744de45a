use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

macro_rules! stat_name {
    ($prefix:expr, $suffix:expr) => {
        concat!("basalt/", $prefix, "/", $suffix)
    };
}

pub(crate) use stat_name;

/// A stat that can be read generically out of the registry.
pub trait ReadableStat: Send + Sync + std::fmt::Debug {
    fn get(&self) -> i64;
}

/// Registry of named stats. Components register their counters and gauges
/// here so operators can enumerate and scrape them.
#[derive(Debug)]
pub struct StatRegistry {
    stats: Mutex<BTreeMap<&'static str, Arc<dyn ReadableStat>>>,
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatRegistry {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, name: &'static str) -> Option<Arc<dyn ReadableStat>> {
        self.stats.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stats.lock().keys().copied().collect()
    }

    pub(crate) fn register(&self, name: &'static str, stat: Arc<dyn ReadableStat>) {
        self.stats.lock().insert(name, stat);
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) -> u64 {
        self.add(1)
    }

    pub fn add(&self, value: u64) -> u64 {
        self.value.fetch_add(value, Ordering::Relaxed) + value
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl ReadableStat for Counter {
    fn get(&self) -> i64 {
        self.value() as i64
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::Relaxed)
    }

    pub fn inc(&self) -> i64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec(&self) -> i64 {
        self.value.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl ReadableStat for Gauge {
    fn get(&self) -> i64 {
        self.value()
    }
}

/// Per-iterator record accounting, aggregated into job stats when a
/// subcompaction finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionIterationStats {
    pub num_input_records: u64,
    pub num_output_records: u64,
    /// Records dropped because a newer record in the same snapshot stratum
    /// shadows them.
    pub num_records_hidden: u64,
    /// Point tombstones dropped on the bottommost level.
    pub num_obsolete_tombstones: u64,
    /// Records dropped because a range tombstone covers them.
    pub num_range_del_covered: u64,
    /// Single-delete/put pairs annihilated together (counts both records).
    pub num_single_del_paired: u64,
    /// Single deletes that reached the output unpaired.
    pub num_single_del_floating: u64,
    /// Records dropped by the compaction filter.
    pub num_filtered: u64,
    pub num_merge_operands: u64,
    /// Values written to (or rewritten into) blob runs.
    pub num_values_separated: u64,
    /// Indirections materialized back inline.
    pub num_values_combined: u64,
}

impl CompactionIterationStats {
    pub(crate) fn merge_from(&mut self, other: &CompactionIterationStats) {
        self.num_input_records += other.num_input_records;
        self.num_output_records += other.num_output_records;
        self.num_records_hidden += other.num_records_hidden;
        self.num_obsolete_tombstones += other.num_obsolete_tombstones;
        self.num_range_del_covered += other.num_range_del_covered;
        self.num_single_del_paired += other.num_single_del_paired;
        self.num_single_del_floating += other.num_single_del_floating;
        self.num_filtered += other.num_filtered;
        self.num_merge_operands += other.num_merge_operands;
        self.num_values_separated += other.num_values_separated;
        self.num_values_combined += other.num_values_combined;
    }
}

pub mod job_stats {
    use super::*;

    pub const BYTES_COMPACTED: &str = stat_name!("compaction", "bytes_compacted");
    pub const RUNNING_SUBCOMPACTIONS: &str = stat_name!("compaction", "running_subcompactions");
    pub const LAST_COMPACTION_TS_SEC: &str =
        stat_name!("compaction", "last_compaction_timestamp_sec");
    pub const OUTPUT_FILES_CREATED: &str = stat_name!("compaction", "output_files_created");
    pub const BLOB_FILES_CREATED: &str = stat_name!("compaction", "blob_files_created");

    /// Job-level metrics registered once and shared by all jobs.
    #[derive(Debug)]
    pub struct JobStats {
        pub bytes_compacted: Arc<Counter>,
        pub running_subcompactions: Arc<Gauge>,
        pub last_compaction_ts: Arc<Gauge>,
        pub output_files_created: Arc<Counter>,
        pub blob_files_created: Arc<Counter>,
    }

    impl JobStats {
        pub fn new(registry: &StatRegistry) -> Self {
            let stats = Self {
                bytes_compacted: Arc::new(Counter::default()),
                running_subcompactions: Arc::new(Gauge::default()),
                last_compaction_ts: Arc::new(Gauge::default()),
                output_files_created: Arc::new(Counter::default()),
                blob_files_created: Arc::new(Counter::default()),
            };
            registry.register(BYTES_COMPACTED, stats.bytes_compacted.clone());
            registry.register(RUNNING_SUBCOMPACTIONS, stats.running_subcompactions.clone());
            registry.register(LAST_COMPACTION_TS_SEC, stats.last_compaction_ts.clone());
            registry.register(OUTPUT_FILES_CREATED, stats.output_files_created.clone());
            registry.register(BLOB_FILES_CREATED, stats.blob_files_created.clone());
            stats
        }
    }
}
