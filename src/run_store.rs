use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};

use crate::error::BasaltError;
use crate::lazy_value::BlobRef;

/// Object-store-backed access to run and blob files.
///
/// Files are immutable: written once with a durable put (the put is the
/// fsync barrier install relies on), then only read or deleted.
pub struct RunStore {
    object_store: Arc<dyn ObjectStore>,
    root: Path,
}

impl RunStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { object_store, root }
    }

    fn data_path(&self, file_id: u64) -> Path {
        self.root.child("runs").child(format!("{file_id:020}.run"))
    }

    fn blob_path(&self, file_id: u64) -> Path {
        self.root
            .child("blobs")
            .child(format!("{file_id:020}.blob"))
    }

    pub(crate) async fn write_data_run(&self, file_id: u64, data: Bytes) -> Result<(), BasaltError> {
        self.object_store
            .put(&self.data_path(file_id), PutPayload::from_bytes(data))
            .await?;
        Ok(())
    }

    pub(crate) async fn write_blob_run(&self, file_id: u64, data: Bytes) -> Result<(), BasaltError> {
        self.object_store
            .put(&self.blob_path(file_id), PutPayload::from_bytes(data))
            .await?;
        Ok(())
    }

    pub(crate) async fn read_data_run(&self, file_id: u64) -> Result<Bytes, BasaltError> {
        let result = self.object_store.get(&self.data_path(file_id)).await?;
        Ok(result.bytes().await?)
    }

    pub(crate) async fn read_blob_run(&self, file_id: u64) -> Result<Bytes, BasaltError> {
        let result = self.object_store.get(&self.blob_path(file_id)).await?;
        Ok(result.bytes().await?)
    }

    /// Reads the exact byte range a blob reference points at.
    pub(crate) async fn read_blob_range(&self, blob_ref: BlobRef) -> Result<Bytes, BasaltError> {
        let range = blob_ref.offset..blob_ref.offset + blob_ref.len as u64;
        Ok(self
            .object_store
            .get_range(&self.blob_path(blob_ref.file_id), range)
            .await?)
    }

    pub(crate) async fn delete_data_run(&self, file_id: u64) -> Result<(), BasaltError> {
        self.object_store.delete(&self.data_path(file_id)).await?;
        Ok(())
    }

    pub(crate) async fn delete_blob_run(&self, file_id: u64) -> Result<(), BasaltError> {
        self.object_store.delete(&self.blob_path(file_id)).await?;
        Ok(())
    }
}
