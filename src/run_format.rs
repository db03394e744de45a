use std::cmp::Ordering;
use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comparator::ComparatorRef;
use crate::error::BasaltError;
use crate::range_del::RangeTombstone;
use crate::row_codec::{decode_entry, encode_entry};
use crate::types::{EntryValue, RowEntry};
use crate::version::RunFileMeta;

pub(crate) const RUN_FORMAT_VERSION: u16 = 1;
pub(crate) const RUN_MAGIC: u64 = 0x62_61_73_61_6c_74_72_31; // "basaltr1"

/// Builds one output data run: sorted records, an optional range-tombstone
/// section, and the dependency list of blob runs the records reference.
///
/// The builder owns block formatting only at this granularity; index and
/// filter construction belong to the table subsystem and are out of scope.
pub(crate) struct DataRunBuilder {
    file_id: u64,
    level: u32,
    comparator: ComparatorRef,
    records: BytesMut,
    tombstones: BytesMut,
    record_count: u64,
    tombstone_count: u64,
    dependencies: BTreeSet<u64>,
    smallest_key: Option<Bytes>,
    largest_key: Option<Bytes>,
}

impl DataRunBuilder {
    pub(crate) fn new(file_id: u64, level: u32, comparator: ComparatorRef) -> Self {
        Self {
            file_id,
            level,
            comparator,
            records: BytesMut::new(),
            tombstones: BytesMut::new(),
            record_count: 0,
            tombstone_count: 0,
            dependencies: BTreeSet::new(),
            smallest_key: None,
            largest_key: None,
        }
    }

    pub(crate) fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Appends one record. Records must arrive in internal-key order.
    pub(crate) fn add(&mut self, entry: &RowEntry) -> Result<(), BasaltError> {
        if let EntryValue::RangeTombstone { .. } = entry.value {
            return Err(BasaltError::InvalidRecord {
                msg: "range tombstones go through add_range_tombstone".to_string(),
            });
        }
        if let Some(blob_ref) = match &entry.value {
            EntryValue::Put(v) => v.blob_ref(),
            _ => None,
        } {
            self.dependencies.insert(blob_ref.file_id);
        }
        self.extend_bounds(&entry.key, &entry.key);
        encode_entry(&mut self.records, entry);
        self.record_count += 1;
        Ok(())
    }

    /// Embeds a range tombstone; tombstones extend the run's key bounds.
    pub(crate) fn add_range_tombstone(&mut self, tombstone: &RangeTombstone) {
        self.extend_bounds(&tombstone.start_key, &tombstone.end_key);
        encode_entry(&mut self.tombstones, &tombstone.to_entry());
        self.tombstone_count += 1;
    }

    fn extend_bounds(&mut self, low: &Bytes, high: &Bytes) {
        let replace_small = match &self.smallest_key {
            None => true,
            Some(s) => self.comparator.compare(low, s) == Ordering::Less,
        };
        if replace_small {
            self.smallest_key = Some(low.clone());
        }
        let replace_large = match &self.largest_key {
            None => true,
            Some(l) => self.comparator.compare(high, l) == Ordering::Greater,
        };
        if replace_large {
            self.largest_key = Some(high.clone());
        }
    }

    pub(crate) fn file_size(&self) -> u64 {
        (self.records.len() + self.tombstones.len()) as u64
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.record_count == 0 && self.tombstone_count == 0
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.record_count
    }

    pub(crate) fn smallest_key(&self) -> Option<&Bytes> {
        self.smallest_key.as_ref()
    }

    pub(crate) fn largest_key(&self) -> Option<&Bytes> {
        self.largest_key.as_ref()
    }

    /// Finalizes the run, returning the encoded file and its metadata.
    pub(crate) fn finish(self) -> (Bytes, RunFileMeta) {
        let records_len = self.records.len() as u64;
        let tombstones_len = self.tombstones.len() as u64;
        let mut buf = self.records;
        buf.extend_from_slice(&self.tombstones);
        buf.put_u32(self.dependencies.len() as u32);
        for id in &self.dependencies {
            buf.put_u64(*id);
        }
        let footer_off = buf.len() as u64;
        buf.put_u32(self.record_count as u32);
        buf.put_u32(self.tombstone_count as u32);
        buf.put_u64(records_len);
        buf.put_u64(tombstones_len);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf.put_u64(footer_off);
        buf.put_u16(RUN_FORMAT_VERSION);
        buf.put_u64(RUN_MAGIC);
        let encoded = buf.freeze();
        let meta = RunFileMeta {
            file_id: self.file_id,
            level: self.level,
            smallest_key: self.smallest_key.unwrap_or_default(),
            largest_key: self.largest_key.unwrap_or_default(),
            size: encoded.len() as u64,
            entry_count: self.record_count,
            dependencies: self.dependencies.into_iter().collect(),
            checksum: crc32fast::hash(&encoded),
        };
        (encoded, meta)
    }

    /// Discards the partially built run.
    pub(crate) fn abandon(self) {}
}

/// A fully decoded data run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodedRun {
    pub(crate) entries: Vec<RowEntry>,
    pub(crate) range_tombstones: Vec<RowEntry>,
    pub(crate) dependencies: Vec<u64>,
}

// tail: checksum (u32) + footer_off (u64) + version (u16) + magic (u64)
const RUN_TAIL_LEN: usize = 4 + 8 + 2 + 8;

pub(crate) fn decode_data_run(data: Bytes) -> Result<DecodedRun, BasaltError> {
    if data.len() < RUN_TAIL_LEN {
        return Err(BasaltError::corruption("data run shorter than footer"));
    }
    let mut tail = data.slice(data.len() - RUN_TAIL_LEN..);
    let checksum = tail.get_u32();
    let footer_off = tail.get_u64() as usize;
    let version = tail.get_u16();
    let magic = tail.get_u64();
    if magic != RUN_MAGIC {
        return Err(BasaltError::corruption("bad data run magic"));
    }
    if version != RUN_FORMAT_VERSION {
        return Err(BasaltError::corruption(format!(
            "unsupported data run version {version}"
        )));
    }
    let checksum_off = data.len() - RUN_TAIL_LEN;
    if checksum != crc32fast::hash(&data[..checksum_off]) {
        return Err(BasaltError::ChecksumMismatch);
    }
    if footer_off + 24 != checksum_off {
        return Err(BasaltError::corruption("data run footer offset mismatch"));
    }

    let mut footer = data.slice(footer_off..checksum_off);
    let record_count = footer.get_u32() as usize;
    let tombstone_count = footer.get_u32() as usize;
    let records_len = footer.get_u64() as usize;
    let tombstones_len = footer.get_u64() as usize;
    if records_len + tombstones_len > footer_off {
        return Err(BasaltError::corruption("data run section overflow"));
    }

    let mut records = data.slice(..records_len);
    let mut entries = Vec::with_capacity(record_count);
    for _ in 0..record_count {
        entries.push(decode_entry(&mut records)?);
    }
    let mut tombstones = data.slice(records_len..records_len + tombstones_len);
    let mut range_tombstones = Vec::with_capacity(tombstone_count);
    for _ in 0..tombstone_count {
        range_tombstones.push(decode_entry(&mut tombstones)?);
    }
    let mut deps = data.slice(records_len + tombstones_len..footer_off);
    if deps.remaining() < 4 {
        return Err(BasaltError::corruption("truncated dependency list"));
    }
    let dep_count = deps.get_u32() as usize;
    if deps.remaining() < dep_count * 8 {
        return Err(BasaltError::corruption("truncated dependency list"));
    }
    let dependencies = (0..dep_count).map(|_| deps.get_u64()).collect();

    Ok(DecodedRun {
        entries,
        range_tombstones,
        dependencies,
    })
}

/// Forward iterator over one decoded run's point records.
///
/// Range tombstones are not streamed; the job seeds them into the
/// subcompaction's aggregator directly from the decoded section.
pub(crate) struct RunIterator {
    entries: Vec<RowEntry>,
    comparator: ComparatorRef,
    pos: usize,
}

impl RunIterator {
    pub(crate) fn new(entries: Vec<RowEntry>, comparator: ComparatorRef) -> Self {
        Self {
            entries,
            comparator,
            pos: 0,
        }
    }
}

#[async_trait::async_trait]
impl crate::iter::EntryIterator for RunIterator {
    async fn init(&mut self) -> Result<(), BasaltError> {
        Ok(())
    }

    async fn next_entry(&mut self) -> Result<Option<RowEntry>, BasaltError> {
        if self.pos < self.entries.len() {
            let entry = self.entries[self.pos].clone();
            self.pos += 1;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    async fn seek(&mut self, next_key: &[u8]) -> Result<(), BasaltError> {
        while self.pos < self.entries.len()
            && self
                .comparator
                .compare(&self.entries[self.pos].key, next_key)
                == Ordering::Less
        {
            self.pos += 1;
        }
        Ok(())
    }
}
