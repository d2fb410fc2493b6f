//! Canonical byte layouts of the table framing and the four record kinds.
//!
//! ## File framing
//!
//! ```text
//! +--------------------+
//! | Header (24 bytes)  |  "REFT" magic, version, block size, min/max index
//! +--------------------+
//! | Ref blocks         |
//! | Ref index blocks?  |
//! | Obj blocks?        |
//! | Obj index blocks?  |
//! | Log blocks?        |
//! | Log index blocks?  |
//! +--------------------+
//! | Footer (68 bytes)  |  header copy, index roots, CRC32
//! +--------------------+
//! ```
//!
//! ## Record encoding
//!
//! Records are prefix-compressed against the previous key in the block:
//!
//! ```text
//! varint( shared_prefix_len )
//! varint( (suffix_len << 3) | value_type )
//! suffix bytes
//! value bytes
//! ```
//!
//! The low three bits of the second varint carry a per-section value type:
//! ref records use 0 tombstone / 1 id / 2 id+peeled / 3 symbolic, log
//! records use 0 tombstone / 1 update, obj records use them as a small
//! position count, index records leave them zero.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::encoding::{read_varint, write_varint};
use crate::error::{Error, Result};
use crate::types::{LogEntry, ObjectId, RefValue, Signature, OBJECT_ID_LEN};
use crate::{errcontract, errformat};

/// File magic, present at offset 0 and again at the start of the footer.
pub const MAGIC: [u8; 4] = *b"REFT";
/// Format version written and accepted by this crate.
pub const VERSION: u8 = 1;
/// Size of the file header.
pub const FILE_HEADER_LEN: usize = 24;
/// Size of the file footer.
pub const FOOTER_LEN: usize = 68;
/// Size of a block header: one type byte plus a 24-bit length.
pub const BLOCK_HEADER_LEN: usize = 4;
/// Largest encodable block, bounded by the 24-bit length field.
pub const MAX_BLOCK_LEN: usize = 0xff_ffff;

/// CRC-32 (IEEE polynomial) protecting the footer.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const REF_VALUE_DELETION: u8 = 0;
pub const REF_VALUE_ID: u8 = 1;
pub const REF_VALUE_TAG: u8 = 2;
pub const REF_VALUE_SYMBOLIC: u8 = 3;

pub const LOG_VALUE_DELETION: u8 = 0;
pub const LOG_VALUE_UPDATE: u8 = 1;

/// The kind of payload a block carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockType {
    Ref,
    Obj,
    Log,
    Index,
}

impl BlockType {
    pub fn as_byte(self) -> u8 {
        match self {
            BlockType::Ref => b'r',
            BlockType::Obj => b'o',
            BlockType::Log => b'g',
            BlockType::Index => b'i',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'r' => Some(BlockType::Ref),
            b'o' => Some(BlockType::Obj),
            b'g' => Some(BlockType::Log),
            b'i' => Some(BlockType::Index),
            _ => None,
        }
    }
}

/// The fixed 24-byte header at the start of every table.
#[derive(Clone, Debug, PartialEq)]
pub struct FileHeader {
    pub block_size: u32,
    pub min_update_index: u64,
    pub max_update_index: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5..8].copy_from_slice(&self.block_size.to_be_bytes()[1..4]);
        buf[8..16].copy_from_slice(&self.min_update_index.to_be_bytes());
        buf[16..24].copy_from_slice(&self.max_update_index.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN {
            return Err(Error::Integrity(format!(
                "file header truncated at {} bytes",
                buf.len()
            )));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::Integrity("bad file magic".to_string()));
        }
        if buf[4] != VERSION {
            return Err(Error::Integrity(format!(
                "unsupported format version {}",
                buf[4]
            )));
        }
        let mut cursor = Cursor::new(&buf[5..]);
        let block_size = cursor.read_u24::<BigEndian>()?;
        let min_update_index = cursor.read_u64::<BigEndian>()?;
        let max_update_index = cursor.read_u64::<BigEndian>()?;
        Ok(Self {
            block_size,
            min_update_index,
            max_update_index,
        })
    }
}

/// The fixed 68-byte footer at the end of every table. Repeats the header so
/// a table can be recognized from either end, then points at the index roots.
/// A root offset of zero means the section has no index.
#[derive(Clone, Debug, PartialEq)]
pub struct Footer {
    pub header: FileHeader,
    pub ref_index_root: u64,
    pub obj_index_root: u64,
    pub obj_id_len: u8,
    pub log_index_root: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[0..24].copy_from_slice(&self.header.encode());
        buf[24..32].copy_from_slice(&self.ref_index_root.to_be_bytes());
        let obj_word = (self.obj_index_root << 5) | u64::from(self.obj_id_len & 0x1f);
        buf[32..40].copy_from_slice(&obj_word.to_be_bytes());
        buf[40..48].copy_from_slice(&self.log_index_root.to_be_bytes());
        // bytes 48..64 reserved, zero
        let crc = CRC32.checksum(&buf[0..64]);
        buf[64..68].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_LEN {
            return Err(Error::Integrity(format!(
                "footer must be {FOOTER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&buf[64..68]);
        let expected = u32::from_be_bytes(crc_bytes);
        let actual = CRC32.checksum(&buf[0..64]);
        if expected != actual {
            return Err(Error::Integrity(format!(
                "footer CRC mismatch, stored {expected:08x} computed {actual:08x}"
            )));
        }
        let header = FileHeader::decode(&buf[0..24])?;
        let mut cursor = Cursor::new(&buf[24..]);
        let ref_index_root = cursor.read_u64::<BigEndian>()?;
        let obj_word = cursor.read_u64::<BigEndian>()?;
        let log_index_root = cursor.read_u64::<BigEndian>()?;
        Ok(Self {
            header,
            ref_index_root,
            obj_index_root: obj_word >> 5,
            obj_id_len: (obj_word & 0x1f) as u8,
            log_index_root,
        })
    }
}

/// Builds the composite key of a log record. The update index is
/// bit-inverted so newer entries for the same ref sort first.
pub fn log_key(name: &[u8], update_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 8);
    key.extend_from_slice(name);
    key.extend_from_slice(&(!update_index).to_be_bytes());
    key
}

/// Splits a log key back into its ref name and update index.
pub fn split_log_key(key: &[u8]) -> Result<(&[u8], u64)> {
    if key.len() < 9 {
        return errformat!("log key of {} bytes is too short", key.len());
    }
    let (name, inverted) = key.split_at(key.len() - 8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(inverted);
    Ok((name, !u64::from_be_bytes(raw)))
}

/// A decoded record payload. The variant always matches the block type the
/// record was read from.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Ref { update_delta: u64, value: RefValue },
    Obj { positions: Vec<u64> },
    Log(Option<LogEntry>),
    Index { offset: u64 },
}

/// Serializes a ref record's value bytes and returns the value type for the
/// record's suffix varint. `name` is only used for error reporting.
pub fn encode_ref_payload(
    buf: &mut Vec<u8>,
    name: &str,
    update_delta: u64,
    value: &RefValue,
) -> Result<u8> {
    write_varint(buf, update_delta);
    match value {
        RefValue::Deletion => Ok(REF_VALUE_DELETION),
        RefValue::Direct(id) => {
            buf.extend_from_slice(id.as_bytes());
            Ok(REF_VALUE_ID)
        }
        RefValue::Tag { id, peeled } => {
            buf.extend_from_slice(id.as_bytes());
            buf.extend_from_slice(peeled.as_bytes());
            Ok(REF_VALUE_TAG)
        }
        RefValue::Symbolic(target) => {
            write_varint(buf, target.len() as u64);
            buf.extend_from_slice(target.as_bytes());
            Ok(REF_VALUE_SYMBOLIC)
        }
        RefValue::Unpeeled(_) => Err(Error::PeeledRefRequired(name.to_string())),
    }
}

/// Serializes a log record's value bytes. `None` is the log tombstone and
/// has no value bytes at all.
pub fn encode_log_payload(buf: &mut Vec<u8>, entry: Option<&LogEntry>) -> u8 {
    let entry = match entry {
        None => return LOG_VALUE_DELETION,
        Some(entry) => entry,
    };
    buf.extend_from_slice(entry.old_id.as_bytes());
    buf.extend_from_slice(entry.new_id.as_bytes());
    write_varint(buf, entry.who.name.len() as u64);
    buf.extend_from_slice(entry.who.name.as_bytes());
    write_varint(buf, entry.who.email.len() as u64);
    buf.extend_from_slice(entry.who.email.as_bytes());
    write_varint(buf, entry.who.time as u64);
    buf.extend_from_slice(&entry.who.tz_offset.to_be_bytes());
    write_varint(buf, entry.message.len() as u64);
    buf.extend_from_slice(entry.message.as_bytes());
    LOG_VALUE_UPDATE
}

/// Serializes an obj record's value bytes: the sorted ref-block positions,
/// delta-encoded. Small counts ride in the value type, larger ones spill
/// into a leading varint.
pub fn encode_obj_payload(buf: &mut Vec<u8>, positions: &[u64]) -> u8 {
    let vtype = if positions.len() < 8 {
        positions.len() as u8
    } else {
        0
    };
    if vtype == 0 {
        write_varint(buf, positions.len() as u64);
    }
    let mut prev = 0u64;
    for (i, &pos) in positions.iter().enumerate() {
        if i == 0 {
            write_varint(buf, pos);
        } else {
            write_varint(buf, pos - prev);
        }
        prev = pos;
    }
    vtype
}

pub fn encode_index_payload(buf: &mut Vec<u8>, offset: u64) -> u8 {
    write_varint(buf, offset);
    0
}

/// Decodes the value bytes of a record, consuming exactly the payload from
/// the cursor. The caller supplies the block type and the value type bits
/// carried by the record's suffix varint.
pub fn decode_payload(
    block_type: BlockType,
    vtype: u8,
    cursor: &mut Cursor<&[u8]>,
) -> Result<Payload> {
    match block_type {
        BlockType::Ref => {
            let update_delta = read_varint(cursor)?;
            let value = match vtype {
                REF_VALUE_DELETION => RefValue::Deletion,
                REF_VALUE_ID => RefValue::Direct(read_object_id(cursor)?),
                REF_VALUE_TAG => RefValue::Tag {
                    id: read_object_id(cursor)?,
                    peeled: read_object_id(cursor)?,
                },
                REF_VALUE_SYMBOLIC => {
                    let len = read_varint(cursor)? as usize;
                    RefValue::Symbolic(read_string(cursor, len)?)
                }
                _ => return errformat!("unknown ref value type {vtype}"),
            };
            Ok(Payload::Ref { update_delta, value })
        }
        BlockType::Obj => {
            let count = if vtype == 0 {
                read_varint(cursor)? as usize
            } else {
                vtype as usize
            };
            let mut positions = Vec::with_capacity(count.min(1024));
            let mut pos = 0u64;
            for i in 0..count {
                let delta = read_varint(cursor)?;
                pos = if i == 0 { delta } else { pos + delta };
                positions.push(pos);
            }
            Ok(Payload::Obj { positions })
        }
        BlockType::Log => match vtype {
            LOG_VALUE_DELETION => Ok(Payload::Log(None)),
            LOG_VALUE_UPDATE => {
                let old_id = read_object_id(cursor)?;
                let new_id = read_object_id(cursor)?;
                let name_len = read_varint(cursor)? as usize;
                let name = read_string(cursor, name_len)?;
                let email_len = read_varint(cursor)? as usize;
                let email = read_string(cursor, email_len)?;
                let time = read_varint(cursor)? as i64;
                let tz_offset = cursor
                    .read_i16::<BigEndian>()
                    .map_err(|_| Error::Format("truncated log timezone".to_string()))?;
                let msg_len = read_varint(cursor)? as usize;
                let message = read_string(cursor, msg_len)?;
                Ok(Payload::Log(Some(LogEntry {
                    old_id,
                    new_id,
                    who: Signature {
                        name,
                        email,
                        time,
                        tz_offset,
                    },
                    message,
                })))
            }
            _ => errformat!("unknown log value type {vtype}"),
        },
        BlockType::Index => {
            let offset = read_varint(cursor)?;
            Ok(Payload::Index { offset })
        }
    }
}

fn read_object_id(cursor: &mut Cursor<&[u8]>) -> Result<ObjectId> {
    let mut raw = [0u8; OBJECT_ID_LEN];
    cursor
        .read_exact(&mut raw)
        .map_err(|_| Error::Format("truncated object id".to_string()))?;
    Ok(ObjectId::from_raw(raw))
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return errformat!("string of {len} bytes overruns record");
    }
    let mut raw = vec![0u8; len];
    cursor
        .read_exact(&mut raw)
        .map_err(|_| Error::Format("truncated string".to_string()))?;
    String::from_utf8(raw).map_err(|_| Error::Format("string is not valid UTF-8".to_string()))
}

/// Validates a reference name at the API boundary.
pub fn check_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return errcontract!("reference name must not be empty");
    }
    if name.as_bytes().contains(&0) {
        return errcontract!("reference name {name:?} contains NUL");
    }
    if name.ends_with('/') {
        return errcontract!("reference name {name} must not end with '/'");
    }
    Ok(())
}

/// Validates a reference name decoded from a block; the same violations the
/// writer refuses are corruption when found on disk.
pub fn check_stored_ref_name(name: &[u8]) -> Result<&str> {
    if name.contains(&0) {
        return Err(Error::Integrity(
            "stored reference name contains NUL".to_string(),
        ));
    }
    let name = std::str::from_utf8(name)
        .map_err(|_| Error::Format("stored reference name is not valid UTF-8".to_string()))?;
    if name.is_empty() {
        return Err(Error::Integrity("stored reference name is empty".to_string()));
    }
    Ok(name)
}
