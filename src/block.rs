//! Block codec: reads and writes one typed, self-delimiting block.
//!
//! ## Block Layout
//!
//! ```text
//! +---------------------------+
//! | type (1B) | length (u24)  |
//! +---------------------------+
//! | prefix-compressed records |
//! +---------------------------+
//! | restart offsets (u24 × N) |
//! | restart count (u16)       |
//! +---------------------------+
//! ```
//!
//! Every `restart_interval` records a restart point stores its key in full
//! and its block-relative offset in the trailer, enabling binary search.
//! Log blocks deflate everything after the 4-byte header; the stored length
//! is the on-disk (compressed) length.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::encoding::{read_varint, varint_len, write_varint};
use crate::errformat;
use crate::error::{Error, Result};
use crate::record::{decode_payload, BlockType, Payload, BLOCK_HEADER_LEN, MAX_BLOCK_LEN};

pub struct Builder {
    block_type: BlockType,
    limit: usize,
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new(block_type: BlockType, limit: usize, restart_interval: usize) -> Self {
        Self {
            block_type,
            limit,
            restart_interval,
            buffer: vec![0u8; BLOCK_HEADER_LEN],
            restarts: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends a record, returning false when it would push the block past
    /// its limit. A false return on an empty block means the record can
    /// never fit at this block size.
    pub fn add(&mut self, key: &[u8], vtype: u8, value: &[u8]) -> bool {
        let restart = self.entry_count % self.restart_interval == 0;
        if restart && self.restarts.len() >= u16::MAX as usize {
            return false;
        }
        let shared = if restart {
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let suffix = key.len() - shared;

        let entry_len = varint_len(shared as u64)
            + varint_len(((suffix as u64) << 3) | u64::from(vtype))
            + suffix
            + value.len();
        let restarts_after = self.restarts.len() + usize::from(restart);
        if self.buffer.len() + entry_len + 3 * restarts_after + 2 > self.limit {
            return false;
        }

        if restart {
            self.restarts.push(self.buffer.len() as u32);
        }
        write_varint(&mut self.buffer, shared as u64);
        write_varint(&mut self.buffer, ((suffix as u64) << 3) | u64::from(vtype));
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        true
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Bytes the finished block would occupy before compression.
    pub fn estimated_len(&self) -> usize {
        self.buffer.len() + 3 * self.restarts.len() + 2
    }

    pub fn finish(mut self, compress: bool) -> Result<Vec<u8>> {
        for pos in &self.restarts {
            self.buffer.write_u24::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u16::<BigEndian>(self.restarts.len() as u16)
            .unwrap();

        let mut out = self.buffer;
        if compress {
            let mut encoder =
                ZlibEncoder::new(Vec::with_capacity(out.len()), Compression::default());
            encoder.write_all(&out[BLOCK_HEADER_LEN..])?;
            let body = encoder.finish()?;
            out.truncate(BLOCK_HEADER_LEN);
            out.extend_from_slice(&body);
        }
        if out.len() > MAX_BLOCK_LEN {
            return errformat!(
                "block of {} bytes exceeds the 24-bit length limit",
                out.len()
            );
        }
        out[0] = self.block_type.as_byte();
        let len_bytes = (out.len() as u32).to_be_bytes();
        out[1..4].copy_from_slice(&len_bytes[1..4]);
        Ok(out)
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// A decoded block, held behind an `Arc` so any number of iterators can
/// walk it without copying.
pub struct Block {
    block_type: BlockType,
    data: Vec<u8>,
    restarts: Vec<u32>,
    records_end: usize,
}

impl Block {
    /// Decodes the exact on-disk bytes of one block, inflating log payloads.
    pub fn decode(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_LEN + 2 {
            return errformat!("block of {} bytes is too short", bytes.len());
        }
        let block_type = BlockType::from_byte(bytes[0])
            .ok_or_else(|| Error::Format(format!("unknown block type 0x{:02x}", bytes[0])))?;
        let stored_len = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
        if stored_len != bytes.len() {
            return errformat!(
                "block length field {stored_len} does not match {} bytes read",
                bytes.len()
            );
        }

        // The first byte of an uncompressed body is always the zero
        // shared-prefix varint of the first record, so a nonzero byte marks
        // a deflated log block.
        let data = if block_type == BlockType::Log && bytes[BLOCK_HEADER_LEN] != 0 {
            let mut inflated = bytes[..BLOCK_HEADER_LEN].to_vec();
            let mut decoder = ZlibDecoder::new(&bytes[BLOCK_HEADER_LEN..]);
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| Error::Format(format!("log block inflate: {e}")))?;
            inflated
        } else {
            bytes
        };
        if data.len() < BLOCK_HEADER_LEN + 2 {
            return errformat!("block body of {} bytes is too short", data.len());
        }

        let count =
            u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]) as usize;
        let table_len = 3 * count + 2;
        if data.len() < BLOCK_HEADER_LEN + table_len {
            return errformat!("restart table of {count} entries overruns block");
        }
        let records_end = data.len() - table_len;

        let mut restarts = Vec::with_capacity(count);
        let mut cursor = Cursor::new(&data[records_end..data.len() - 2]);
        for _ in 0..count {
            restarts.push(cursor.read_u24::<BigEndian>()?);
        }
        for &offset in &restarts {
            let offset = offset as usize;
            if offset < BLOCK_HEADER_LEN || offset >= records_end {
                return errformat!("restart offset {offset} out of range");
            }
        }
        for pair in restarts.windows(2) {
            if pair[0] >= pair[1] {
                return errformat!("restart offsets not ascending");
            }
        }

        Ok(Self {
            block_type,
            data,
            restarts,
            records_end,
        })
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator {
            block: Arc::clone(self),
            pos: BLOCK_HEADER_LEN,
            last_key: Vec::new(),
        }
    }

    /// Reads the full key stored at a restart point.
    fn restart_key(&self, index: usize) -> Result<Vec<u8>> {
        let offset = self.restarts[index] as usize;
        let mut cursor = Cursor::new(&self.data[offset..self.records_end]);
        let shared = read_varint(&mut cursor)?;
        if shared != 0 {
            return errformat!("restart point at {offset} has a shared prefix");
        }
        let suffix_len = (read_varint(&mut cursor)? >> 3) as usize;
        let start = offset + cursor.position() as usize;
        if start + suffix_len > self.records_end {
            return errformat!("restart key at {offset} overruns block");
        }
        Ok(self.data[start..start + suffix_len].to_vec())
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    pos: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.block.records_end
    }

    /// Positions the iterator so the next record returned is the first one
    /// whose key is >= `target`; exhausts it if no such record exists.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Greatest restart point whose key is <= target.
        let restarts = &self.block.restarts;
        let mut left = 0;
        let mut right = restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.block.restart_key(mid)?.as_slice() <= target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        let start = left.saturating_sub(1);
        self.pos = restarts
            .get(start)
            .map_or(self.block.records_end, |&p| p as usize);
        self.last_key.clear();

        loop {
            let save_pos = self.pos;
            let save_key = self.last_key.clone();
            match self.next() {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok((key, _))) => {
                    if key.as_slice() >= target {
                        self.pos = save_pos;
                        self.last_key = save_key;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn read_record(&mut self) -> Result<(Vec<u8>, Payload)> {
        let data = &self.block.data[..self.block.records_end];
        let mut cursor = Cursor::new(&data[self.pos..]);

        let shared = read_varint(&mut cursor)? as usize;
        let suffix_varint = read_varint(&mut cursor)?;
        let vtype = (suffix_varint & 7) as u8;
        let suffix_len = (suffix_varint >> 3) as usize;

        if shared > self.last_key.len() {
            return errformat!("shared prefix of {shared} bytes exceeds previous key");
        }
        let start = cursor.position() as usize;
        let slice = *cursor.get_ref();
        if start + suffix_len > slice.len() {
            return errformat!("record suffix overruns block");
        }
        let mut key = Vec::with_capacity(shared + suffix_len);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&slice[start..start + suffix_len]);
        cursor.set_position((start + suffix_len) as u64);

        let payload = decode_payload(self.block.block_type, vtype, &mut cursor)?;

        self.pos += cursor.position() as usize;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);
        Ok((key, payload))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Payload)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.block.records_end {
            return None;
        }
        match self.read_record() {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                // A malformed record poisons the rest of the block.
                self.pos = self.block.records_end;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        encode_index_payload, encode_log_payload, encode_ref_payload, LOG_VALUE_UPDATE,
    };
    use crate::types::{LogEntry, ObjectId, RefValue, Signature};

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_raw([byte; 20])
    }

    fn ref_block(names: &[&str], limit: usize, interval: usize) -> Vec<u8> {
        let mut builder = Builder::new(BlockType::Ref, limit, interval);
        for (i, name) in names.iter().enumerate() {
            let mut value = Vec::new();
            let vtype =
                encode_ref_payload(&mut value, name, 0, &RefValue::Direct(oid(i as u8 + 1)))
                    .expect("encode");
            assert!(builder.add(name.as_bytes(), vtype, &value), "block overflow");
        }
        builder.finish(false).expect("finish")
    }

    #[test]
    fn test_builder_and_iterator_roundtrip() {
        let names = [
            "refs/heads/main",
            "refs/heads/maint",
            "refs/heads/next",
            "refs/tags/v1.0",
            "refs/tags/v1.1",
        ];
        let bytes = ref_block(&names, 4096, 16);
        assert_eq!(bytes[0], b'r');

        let block = Arc::new(Block::decode(bytes).expect("decode"));
        let mut seen = Vec::new();
        for record in block.iter() {
            let (key, payload) = record.expect("record");
            seen.push(String::from_utf8(key).expect("utf8"));
            assert!(matches!(payload, Payload::Ref { .. }));
        }
        assert_eq!(seen, names);
    }

    #[test]
    fn test_prefix_compression_shrinks_shared_keys() {
        let shared = ref_block(&["refs/heads/branch-a", "refs/heads/branch-b"], 4096, 16);
        let distinct = ref_block(&["aaaaaaaaaaaaaaaaaaa", "refs/heads/branch-b"], 4096, 16);
        assert!(shared.len() < distinct.len());
    }

    #[test]
    fn test_restart_interval_one_disables_compression() {
        let names = ["refs/heads/aa", "refs/heads/ab", "refs/heads/ac"];
        let bytes = ref_block(&names, 4096, 1);
        let block = Arc::new(Block::decode(bytes).expect("decode"));
        assert_eq!(block.restarts.len(), 3);
        for (i, record) in block.iter().enumerate() {
            let (key, _) = record.expect("record");
            assert_eq!(key, names[i].as_bytes());
        }
    }

    #[test]
    fn test_seek() {
        let names = [
            "refs/heads/apple",
            "refs/heads/application",
            "refs/heads/banana",
            "refs/heads/band",
            "refs/heads/bandana",
        ];
        // Interval of 2 forces several restart points.
        let block = Arc::new(Block::decode(ref_block(&names, 4096, 2)).expect("decode"));

        // Exact match.
        let mut iter = block.iter();
        iter.seek(b"refs/heads/band").expect("seek");
        let (key, _) = iter.next().expect("some").expect("record");
        assert_eq!(key, b"refs/heads/band");

        // Between keys lands on the next one.
        let mut iter = block.iter();
        iter.seek(b"refs/heads/bana").expect("seek");
        let (key, _) = iter.next().expect("some").expect("record");
        assert_eq!(key, b"refs/heads/banana");

        // Before all keys lands on the first.
        let mut iter = block.iter();
        iter.seek(b"").expect("seek");
        let (key, _) = iter.next().expect("some").expect("record");
        assert_eq!(key, b"refs/heads/apple");

        // Past all keys exhausts.
        let mut iter = block.iter();
        iter.seek(b"refs/heads/zzz").expect("seek");
        assert!(iter.is_exhausted());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_block_limit_refuses_overflow() {
        let mut builder = Builder::new(BlockType::Ref, 64, 16);
        let mut value = Vec::new();
        let vtype = encode_ref_payload(&mut value, "a", 0, &RefValue::Direct(oid(1)))
            .expect("encode");
        assert!(builder.add(b"refs/heads/a", vtype, &value));
        // The next record does not fit in the 64-byte budget.
        assert!(!builder.add(b"refs/heads/b", vtype, &value));
        assert_eq!(builder.entry_count(), 1);
    }

    fn log_record(name: &str, index: u64, message: &str) -> (Vec<u8>, Vec<u8>) {
        let entry = LogEntry {
            old_id: ObjectId::zero(),
            new_id: oid(1),
            who: Signature::new("Log", "log@example.com", 1_500_079_709, -480),
            message: message.to_string(),
        };
        let mut value = Vec::new();
        let vtype = encode_log_payload(&mut value, Some(&entry));
        assert_eq!(vtype, LOG_VALUE_UPDATE);
        (crate::record::log_key(name.as_bytes(), index), value)
    }

    #[test]
    fn test_log_block_compression_roundtrip() {
        let mut builder = Builder::new(BlockType::Log, 4096, 16);
        let mut keys = Vec::new();
        for i in (1..=8).rev() {
            let (key, value) = log_record("refs/heads/main", i, &format!("update {i}"));
            assert!(builder.add(&key, LOG_VALUE_UPDATE, &value));
            keys.push(key);
        }
        let bytes = builder.finish(true).expect("finish");
        assert_eq!(bytes[0], b'g');
        // A zlib stream never begins with a zero byte.
        assert_ne!(bytes[BLOCK_HEADER_LEN], 0);

        let block = Arc::new(Block::decode(bytes).expect("decode"));
        let decoded: Vec<_> = block
            .iter()
            .map(|r| r.expect("record").0)
            .collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn test_uncompressed_log_block_roundtrip() {
        let mut builder = Builder::new(BlockType::Log, 4096, 16);
        let (key, value) = log_record("refs/heads/main", 1, "msg");
        assert!(builder.add(&key, LOG_VALUE_UPDATE, &value));
        let bytes = builder.finish(false).expect("finish");
        assert_eq!(bytes[BLOCK_HEADER_LEN], 0);

        let block = Arc::new(Block::decode(bytes).expect("decode"));
        assert_eq!(block.iter().count(), 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Unknown type byte.
        let mut builder = Builder::new(BlockType::Index, 4096, 16);
        let mut value = Vec::new();
        let vtype = encode_index_payload(&mut value, 24);
        assert!(builder.add(b"refs/heads/main", vtype, &value));
        let good = builder.finish(false).expect("finish");

        let mut bad_type = good.clone();
        bad_type[0] = b'x';
        assert!(matches!(Block::decode(bad_type), Err(Error::Format(_))));

        // Length field disagreeing with the buffer.
        let mut bad_len = good.clone();
        bad_len[3] ^= 1;
        assert!(matches!(Block::decode(bad_len), Err(Error::Format(_))));

        // Restart count pointing outside the block.
        let mut bad_count = good.clone();
        let end = bad_count.len();
        bad_count[end - 1] = 0xff;
        bad_count[end - 2] = 0xff;
        assert!(matches!(Block::decode(bad_count), Err(Error::Format(_))));

        // Too short to hold a header.
        assert!(matches!(Block::decode(vec![b'r', 0, 0]), Err(Error::Format(_))));
    }
}
