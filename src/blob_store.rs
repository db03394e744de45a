use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use crate::blob_format::{BlobFileMeta, BlobRunWriter, PlacementHint};
use crate::error::BasaltError;
use crate::lazy_value::BlobRef;
use crate::run_store::RunStore;
use crate::version::VersionSet;

/// Read side of value separation: materializes indirections.
pub struct BlobStore {
    run_store: Arc<RunStore>,
}

impl BlobStore {
    pub fn new(run_store: Arc<RunStore>) -> Self {
        Self { run_store }
    }

    pub async fn read(&self, blob_ref: BlobRef) -> Result<Bytes, BasaltError> {
        self.run_store.read_blob_range(blob_ref).await
    }
}

/// What the compaction iterator asks of value separation: write a value out
/// to a blob run, rewrite a value during blob rebuild, or pull an
/// indirection back inline.
#[async_trait]
pub trait ValueSeparation: Send + Sync {
    /// Writes `value` into the blob run for `hint` and returns the
    /// indirection to store in the data run.
    async fn separate(
        &self,
        key: &[u8],
        seq: u64,
        value: Bytes,
        hint: PlacementHint,
    ) -> Result<BlobRef, BasaltError>;

    /// Like [`ValueSeparation::separate`], but records `ancestor` in the new
    /// blob run's inheritance chain.
    async fn rebuild(
        &self,
        key: &[u8],
        seq: u64,
        value: Bytes,
        hint: PlacementHint,
        ancestor: u64,
    ) -> Result<BlobRef, BasaltError>;

    /// Materializes an indirection.
    async fn combine(&self, blob_ref: BlobRef) -> Result<Bytes, BasaltError>;
}

/// Per-subcompaction blob output: one in-flight [`BlobRunWriter`] per
/// placement hint, rolled at the target blob file size and uploaded on roll.
///
/// Subcompactions are single-tasked, so the mutexes only guard the `&self`
/// trait surface, never real contention.
pub(crate) struct BlobSink {
    run_store: Arc<RunStore>,
    versions: Arc<dyn VersionSet>,
    target_blob_file_size: u64,
    writers: Mutex<HashMap<PlacementHint, BlobRunWriter>>,
    finished: Mutex<Vec<BlobFileMeta>>,
}

impl BlobSink {
    pub(crate) fn new(
        run_store: Arc<RunStore>,
        versions: Arc<dyn VersionSet>,
        target_blob_file_size: u64,
    ) -> Self {
        Self {
            run_store,
            versions,
            target_blob_file_size,
            writers: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    fn append(
        &self,
        key: &[u8],
        seq: u64,
        value: &[u8],
        hint: PlacementHint,
        ancestor: Option<u64>,
    ) -> (BlobRef, Option<BlobRunWriter>) {
        let mut writers = self.writers.lock();
        let writer = writers.entry(hint).or_insert_with(|| {
            BlobRunWriter::new(self.versions.allocate_file_number(), hint)
        });
        let blob_ref = writer.append(key, seq, value);
        if let Some(ancestor) = ancestor {
            writer.add_inheritance(ancestor);
        }
        let rolled = if writer.file_size() >= self.target_blob_file_size {
            writers.remove(&hint)
        } else {
            None
        };
        (blob_ref, rolled)
    }

    async fn upload(&self, writer: BlobRunWriter) -> Result<(), BasaltError> {
        let (encoded, meta) = writer.finish();
        debug!(
            "finished blob run [file_id={}, values={}, size={}]",
            meta.file_id, meta.value_count, meta.size
        );
        self.run_store.write_blob_run(meta.file_id, encoded).await?;
        self.finished.lock().push(meta);
        Ok(())
    }

    /// Finishes and uploads every in-flight writer, returning the metadata
    /// of all blob runs this sink produced.
    pub(crate) async fn finalize(&self) -> Result<Vec<BlobFileMeta>, BasaltError> {
        let writers: Vec<BlobRunWriter> = {
            let mut guard = self.writers.lock();
            guard.drain().map(|(_, w)| w).collect()
        };
        for writer in writers {
            if !writer.is_empty() {
                self.upload(writer).await?;
            }
        }
        Ok(self.finished.lock().clone())
    }

    /// File ids of every blob run this sink has started or finished.
    pub(crate) fn produced_file_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.finished.lock().iter().map(|m| m.file_id).collect();
        ids.extend(self.writers.lock().values().map(|w| w.file_id()));
        ids
    }
}

#[async_trait]
impl ValueSeparation for BlobSink {
    async fn separate(
        &self,
        key: &[u8],
        seq: u64,
        value: Bytes,
        hint: PlacementHint,
    ) -> Result<BlobRef, BasaltError> {
        let (blob_ref, rolled) = self.append(key, seq, &value, hint, None);
        if let Some(writer) = rolled {
            self.upload(writer).await?;
        }
        Ok(blob_ref)
    }

    async fn rebuild(
        &self,
        key: &[u8],
        seq: u64,
        value: Bytes,
        hint: PlacementHint,
        ancestor: u64,
    ) -> Result<BlobRef, BasaltError> {
        let (blob_ref, rolled) = self.append(key, seq, &value, hint, Some(ancestor));
        if let Some(writer) = rolled {
            self.upload(writer).await?;
        }
        Ok(blob_ref)
    }

    async fn combine(&self, blob_ref: BlobRef) -> Result<Bytes, BasaltError> {
        self.run_store.read_blob_range(blob_ref).await
    }
}
