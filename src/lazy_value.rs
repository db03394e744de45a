use bytes::Bytes;

/// Location of a value that was separated out of the main sorted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    /// File number of the blob run holding the value.
    pub file_id: u64,
    /// Byte offset of the value record within the blob run.
    pub offset: u64,
    /// Length of the value bytes.
    pub len: u32,
}

/// A value cell that is either inline bytes or an indirection into a blob
/// run.
///
/// Many records pass through compaction without their value bytes ever being
/// inspected, so an indirection is carried as-is and only materialized (via
/// [`crate::blob_store::BlobStore::read`]) when a consumer needs the bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyValue {
    Inline(Bytes),
    Indirect(BlobRef),
}

#[allow(clippy::len_without_is_empty)]
impl LazyValue {
    pub fn inline(bytes: Bytes) -> Self {
        LazyValue::Inline(bytes)
    }

    pub fn indirect(file_id: u64, offset: u64, len: u32) -> Self {
        LazyValue::Indirect(BlobRef {
            file_id,
            offset,
            len,
        })
    }

    /// Length of the value bytes, known without materialization.
    pub fn len(&self) -> usize {
        match self {
            LazyValue::Inline(b) => b.len(),
            LazyValue::Indirect(r) => r.len as usize,
        }
    }

    /// Returns the inline bytes, or `None` for an indirection.
    pub fn as_inline(&self) -> Option<&Bytes> {
        match self {
            LazyValue::Inline(b) => Some(b),
            LazyValue::Indirect(_) => None,
        }
    }

    /// Returns the blob reference, or `None` for inline bytes.
    pub fn blob_ref(&self) -> Option<BlobRef> {
        match self {
            LazyValue::Inline(_) => None,
            LazyValue::Indirect(r) => Some(*r),
        }
    }
}
