use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BasaltError;
use crate::lazy_value::LazyValue;
use crate::types::{EntryValue, RowEntry, MAX_SEQUENCE_NUMBER};

// Wire tags for the entry kind. The sequence number and tag share one u64:
// seq in the upper 56 bits, tag in the low byte.
const TAG_PUT_INLINE: u8 = 1;
const TAG_PUT_INDIRECT: u8 = 2;
const TAG_MERGE: u8 = 3;
const TAG_TOMBSTONE: u8 = 4;
const TAG_SINGLE_TOMBSTONE: u8 = 5;
const TAG_RANGE_TOMBSTONE: u8 = 6;

/// Encodes one [`RowEntry`] into `buf`.
///
/// Layout: `key_len (u16) | key | seq_and_tag (u64) | payload`, where the
/// payload depends on the tag.
pub(crate) fn encode_entry(buf: &mut BytesMut, entry: &RowEntry) {
    debug_assert!(entry.seq <= MAX_SEQUENCE_NUMBER);
    buf.put_u16(entry.key.len() as u16);
    buf.put_slice(&entry.key);
    let tag = match &entry.value {
        EntryValue::Put(LazyValue::Inline(_)) => TAG_PUT_INLINE,
        EntryValue::Put(LazyValue::Indirect(_)) => TAG_PUT_INDIRECT,
        EntryValue::Merge(_) => TAG_MERGE,
        EntryValue::Tombstone => TAG_TOMBSTONE,
        EntryValue::SingleTombstone => TAG_SINGLE_TOMBSTONE,
        EntryValue::RangeTombstone { .. } => TAG_RANGE_TOMBSTONE,
    };
    buf.put_u64(entry.seq << 8 | tag as u64);
    match &entry.value {
        EntryValue::Put(LazyValue::Inline(v)) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        EntryValue::Put(LazyValue::Indirect(r)) => {
            buf.put_u64(r.file_id);
            buf.put_u64(r.offset);
            buf.put_u32(r.len);
        }
        EntryValue::Merge(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        EntryValue::Tombstone | EntryValue::SingleTombstone => {}
        EntryValue::RangeTombstone { end_key } => {
            buf.put_u32(end_key.len() as u32);
            buf.put_slice(end_key);
        }
    }
}

/// Decodes one entry from the front of `data`, advancing it.
pub(crate) fn decode_entry(data: &mut Bytes) -> Result<RowEntry, BasaltError> {
    if data.remaining() < 2 {
        return Err(BasaltError::corruption("truncated entry header"));
    }
    let key_len = data.get_u16() as usize;
    if data.remaining() < key_len + 8 {
        return Err(BasaltError::corruption("truncated entry key"));
    }
    let key = data.split_to(key_len);
    let seq_and_tag = data.get_u64();
    let seq = seq_and_tag >> 8;
    let tag = (seq_and_tag & 0xff) as u8;
    let value = match tag {
        TAG_PUT_INLINE => {
            let value = decode_len_prefixed(data)?;
            EntryValue::Put(LazyValue::Inline(value))
        }
        TAG_PUT_INDIRECT => {
            if data.remaining() < 20 {
                return Err(BasaltError::corruption("truncated blob reference"));
            }
            let file_id = data.get_u64();
            let offset = data.get_u64();
            let len = data.get_u32();
            EntryValue::Put(LazyValue::indirect(file_id, offset, len))
        }
        TAG_MERGE => EntryValue::Merge(decode_len_prefixed(data)?),
        TAG_TOMBSTONE => EntryValue::Tombstone,
        TAG_SINGLE_TOMBSTONE => EntryValue::SingleTombstone,
        TAG_RANGE_TOMBSTONE => EntryValue::RangeTombstone {
            end_key: decode_len_prefixed(data)?,
        },
        unknown => {
            return Err(BasaltError::corruption(format!(
                "unknown entry tag {unknown}"
            )))
        }
    };
    Ok(RowEntry::new(key, seq, value))
}

fn decode_len_prefixed(data: &mut Bytes) -> Result<Bytes, BasaltError> {
    if data.remaining() < 4 {
        return Err(BasaltError::corruption("truncated length prefix"));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(BasaltError::corruption("truncated payload"));
    }
    Ok(data.split_to(len))
}
