//! 7-bit continuation-bit varint, little-endian group order.
//!
//! Two decoders share one wire format: [`read_varint`] for lengths and
//! counts, bounded to `[0, 2^31)`, and [`read_varint_u64`] for full-range
//! correlation numbers. Both reject over-long encodings so every value has
//! exactly one wire form.

use crate::traits::error::{Result, ServiceLinkError};
use bytes::BufMut;

/// Maximum bytes a length prefix may occupy (5 * 7 bits > 31 bits)
pub const MAX_PREFIX_LEN: usize = 5;

/// Maximum bytes a full-range u64 varint may occupy (10 * 7 bits > 64 bits)
pub const MAX_U64_LEN: usize = 10;

/// Largest value a length prefix may carry
pub const MAX_VALUE: u64 = i32::MAX as u64;

/// Append the varint encoding of `value` to `dst`
pub fn write_varint(mut value: u64, dst: &mut impl BufMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            dst.put_u8(byte | 0x80);
        } else {
            dst.put_u8(byte);
            break;
        }
    }
}

/// Number of bytes `write_varint` will produce for `value`
pub fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Try to decode a varint from the front of `src`
///
/// # Returns
/// * `Ok(Some((value, consumed)))` - a complete varint was present
/// * `Ok(None)` - more bytes are needed
/// * `Err(_)` - the encoding is over-long or exceeds the length bound
pub fn read_varint(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        if i >= MAX_PREFIX_LEN {
            return Err(ServiceLinkError::Protocol(
                "varint length prefix exceeds 5 bytes".into(),
            ));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i as u32);
        if byte & 0x80 == 0 {
            // A trailing zero group means the same value fits in fewer bytes
            if byte == 0 && i > 0 {
                return Err(ServiceLinkError::Protocol(
                    "over-long varint encoding".into(),
                ));
            }
            if value > MAX_VALUE {
                return Err(ServiceLinkError::Protocol(format!(
                    "varint value {} exceeds length bound",
                    value
                )));
            }
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Try to decode a full-range u64 varint from the front of `src`
///
/// Same wire format and return convention as [`read_varint`], without the
/// length bound. Used for tracing-id correlation numbers, which span the
/// whole u64 range.
pub fn read_varint_u64(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        if i >= MAX_U64_LEN {
            return Err(ServiceLinkError::Protocol(
                "varint exceeds 10 bytes".into(),
            ));
        }
        // The tenth group holds only the top bit of a u64
        if i == MAX_U64_LEN - 1 && byte > 0x01 {
            return Err(ServiceLinkError::Protocol(
                "varint overflows u64".into(),
            ));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i as u32);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return Err(ServiceLinkError::Protocol(
                    "over-long varint encoding".into(),
                ));
            }
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
