//! Variable-length integer encoding shared by all record codecs.
//!
//! Varints are little-endian base-128: each byte carries seven value bits,
//! the high bit marks continuation. A `u64` occupies at most ten bytes.
//! Fixed-width fields elsewhere in the format use big-endian `byteorder`
//! encoding; only the varint primitives live here.

use std::io::Cursor;

use byteorder::ReadBytesExt;

use crate::error::Result;
use crate::errformat;

/// Appends `v` to `buf` as a varint.
pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Reads a varint from the cursor, advancing it past the encoded bytes.
pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = cursor
            .read_u8()
            .map_err(|_| crate::error::Error::Format("truncated varint".to_string()))?;
        if shift == 63 && byte > 1 {
            return errformat!("varint exceeds 64 bits");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return errformat!("varint exceeds 64 bits");
        }
    }
}

/// Number of bytes `v` occupies as a varint.
pub fn varint_len(v: u64) -> usize {
    if v == 0 {
        return 1;
    }
    (64 - v.leading_zeros() as usize).div_ceil(7)
}
