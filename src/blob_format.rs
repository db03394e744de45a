use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BasaltError;
use crate::lazy_value::BlobRef;

pub(crate) const BLOB_FORMAT_VERSION: u16 = 1;
pub(crate) const BLOB_MAGIC: u64 = 0x62_61_73_61_6c_74_62_31; // "basaltb1"

/// Where a blob run should land, for devices and stores that tier storage by
/// expected access temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlacementHint {
    #[default]
    Default,
    Hot,
    Warm,
    Cold,
}

impl PlacementHint {
    pub(crate) fn encode(&self) -> u8 {
        match self {
            PlacementHint::Default => 0,
            PlacementHint::Hot => 1,
            PlacementHint::Warm => 2,
            PlacementHint::Cold => 3,
        }
    }

    pub(crate) fn decode(v: u8) -> Result<Self, BasaltError> {
        match v {
            0 => Ok(PlacementHint::Default),
            1 => Ok(PlacementHint::Hot),
            2 => Ok(PlacementHint::Warm),
            3 => Ok(PlacementHint::Cold),
            unknown => Err(BasaltError::corruption(format!(
                "unknown placement hint {unknown}"
            ))),
        }
    }
}

/// Metadata describing one finished blob run.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobFileMeta {
    pub file_id: u64,
    pub size: u64,
    pub value_count: u64,
    /// Ancestor blob file ids whose live values this run absorbed; GC uses
    /// the chain to establish provenance.
    pub inheritance: Vec<u64>,
    pub hint: PlacementHint,
}

/// One decoded value record from a blob run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlobRecord {
    pub(crate) key: Bytes,
    pub(crate) seq: u64,
    pub(crate) value: Bytes,
    pub(crate) blob_ref: BlobRef,
}

/// Accumulates self-describing value records for one blob run.
///
/// Records are buffered in memory and uploaded as a single object on finish;
/// the durable put doubles as the fsync barrier required before install.
pub(crate) struct BlobRunWriter {
    file_id: u64,
    hint: PlacementHint,
    buf: BytesMut,
    value_count: u64,
    inheritance: Vec<u64>,
}

impl BlobRunWriter {
    pub(crate) fn new(file_id: u64, hint: PlacementHint) -> Self {
        Self {
            file_id,
            hint,
            buf: BytesMut::new(),
            value_count: 0,
            inheritance: Vec::new(),
        }
    }

    pub(crate) fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Appends one value record and returns the indirection pointing at the
    /// value bytes.
    pub(crate) fn append(&mut self, key: &[u8], seq: u64, value: &[u8]) -> BlobRef {
        self.buf.put_u16(key.len() as u16);
        self.buf.put_slice(key);
        self.buf.put_u64(seq);
        self.buf.put_u32(value.len() as u32);
        let offset = self.buf.len() as u64;
        self.buf.put_slice(value);
        self.value_count += 1;
        BlobRef {
            file_id: self.file_id,
            offset,
            len: value.len() as u32,
        }
    }

    pub(crate) fn add_inheritance(&mut self, ancestor: u64) {
        if !self.inheritance.contains(&ancestor) {
            self.inheritance.push(ancestor);
        }
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.buf.len() as u64
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.value_count == 0
    }

    pub(crate) fn finish(self) -> (Bytes, BlobFileMeta) {
        let mut buf = self.buf;
        let footer_off = buf.len() as u64;
        buf.put_u32(self.value_count as u32);
        buf.put_u32(self.inheritance.len() as u32);
        for id in &self.inheritance {
            buf.put_u64(*id);
        }
        buf.put_u8(self.hint.encode());
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf.put_u64(footer_off);
        buf.put_u16(BLOB_FORMAT_VERSION);
        buf.put_u64(BLOB_MAGIC);
        let encoded = buf.freeze();
        let meta = BlobFileMeta {
            file_id: self.file_id,
            size: encoded.len() as u64,
            value_count: self.value_count,
            inheritance: self.inheritance,
            hint: self.hint,
        };
        (encoded, meta)
    }
}

// footer tail: checksum (u32) + footer_off (u64) + version (u16) + magic (u64)
const BLOB_TAIL_LEN: usize = 4 + 8 + 2 + 8;

/// Decodes a whole blob run, returning its records and metadata.
pub(crate) fn decode_blob_run(
    data: Bytes,
    file_id: u64,
) -> Result<(Vec<BlobRecord>, BlobFileMeta), BasaltError> {
    if data.len() < BLOB_TAIL_LEN {
        return Err(BasaltError::corruption("blob run shorter than footer"));
    }
    let mut tail = data.slice(data.len() - BLOB_TAIL_LEN..);
    let checksum = tail.get_u32();
    let footer_off = tail.get_u64() as usize;
    let version = tail.get_u16();
    let magic = tail.get_u64();
    if magic != BLOB_MAGIC {
        return Err(BasaltError::corruption("bad blob run magic"));
    }
    if version != BLOB_FORMAT_VERSION {
        return Err(BasaltError::corruption(format!(
            "unsupported blob run version {version}"
        )));
    }
    let checksum_off = data.len() - BLOB_TAIL_LEN;
    if checksum != crc32fast::hash(&data[..checksum_off]) {
        return Err(BasaltError::ChecksumMismatch);
    }
    if footer_off > checksum_off {
        return Err(BasaltError::corruption("blob footer offset out of range"));
    }

    let mut footer = data.slice(footer_off..checksum_off);
    if footer.remaining() < 8 {
        return Err(BasaltError::corruption("truncated blob footer"));
    }
    let value_count = footer.get_u32() as u64;
    let inheritance_count = footer.get_u32() as usize;
    if footer.remaining() < inheritance_count * 8 + 1 {
        return Err(BasaltError::corruption("truncated blob inheritance list"));
    }
    let inheritance = (0..inheritance_count).map(|_| footer.get_u64()).collect();
    let hint = PlacementHint::decode(footer.get_u8())?;

    let mut records = Vec::with_capacity(value_count as usize);
    let mut cursor = data.slice(..footer_off);
    let mut consumed = 0u64;
    for _ in 0..value_count {
        if cursor.remaining() < 2 {
            return Err(BasaltError::corruption("truncated blob record"));
        }
        let key_len = cursor.get_u16() as usize;
        if cursor.remaining() < key_len + 12 {
            return Err(BasaltError::corruption("truncated blob record"));
        }
        let key = cursor.split_to(key_len);
        let seq = cursor.get_u64();
        let value_len = cursor.get_u32() as usize;
        consumed += 2 + key_len as u64 + 12;
        let offset = consumed;
        if cursor.remaining() < value_len {
            return Err(BasaltError::corruption("truncated blob value"));
        }
        let value = cursor.split_to(value_len);
        consumed += value_len as u64;
        records.push(BlobRecord {
            key,
            seq,
            value,
            blob_ref: BlobRef {
                file_id,
                offset,
                len: value_len as u32,
            },
        });
    }

    let meta = BlobFileMeta {
        file_id,
        size: data.len() as u64,
        value_count,
        inheritance,
        hint,
    };
    Ok((records, meta))
}
