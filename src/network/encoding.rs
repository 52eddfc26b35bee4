//! Consensus byte encoding
//!
//! Little-endian integers, CompactSize length prefixes and the primitives the
//! message payloads and chain types are built from. Decoding reads from a
//! `&mut &[u8]` cursor and never reads past the slice; every shortfall is a
//! [`DecodeError::Truncated`].

use bytes::{Buf, BufMut};

use crate::network::error::DecodeError;

/// Largest CompactSize value accepted for a length prefix (32 MiB)
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Types with a consensus wire encoding
pub trait Encodable {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B);

    /// Encoded size in bytes
    fn encoded_len(&self) -> usize {
        let mut out = Vec::new();
        self.consensus_encode(&mut out);
        out.len()
    }
}

/// Types decodable from consensus bytes
pub trait Decodable: Sized {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

/// Encode a value into a fresh vector
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.consensus_encode(&mut out);
    out
}

/// Decode a value that must consume the whole slice
pub fn deserialize<T: Decodable>(mut data: &[u8]) -> Result<T, DecodeError> {
    let value = T::consensus_decode(&mut data)?;
    if !data.is_empty() {
        return Err(DecodeError::TrailingBytes {
            command: std::any::type_name::<T>()
                .rsplit("::")
                .next()
                .unwrap_or("value")
                .to_string(),
            count: data.len(),
        });
    }
    Ok(value)
}

fn ensure(buf: &[u8], needed: usize, what: &'static str) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, DecodeError> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn read_u16_le(buf: &mut &[u8], what: &'static str) -> Result<u16, DecodeError> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

pub fn read_u16_be(buf: &mut &[u8], what: &'static str) -> Result<u16, DecodeError> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, DecodeError> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32(buf: &mut &[u8], what: &'static str) -> Result<i32, DecodeError> {
    ensure(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

pub fn read_u64(buf: &mut &[u8], what: &'static str) -> Result<u64, DecodeError> {
    ensure(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

pub fn read_i64(buf: &mut &[u8], what: &'static str) -> Result<i64, DecodeError> {
    ensure(buf, 8, what)?;
    Ok(buf.get_i64_le())
}

pub fn read_array<const N: usize>(
    buf: &mut &[u8],
    what: &'static str,
) -> Result<[u8; N], DecodeError> {
    ensure(buf, N, what)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a CompactSize using the shortest form for its magnitude
pub fn write_compact_size<B: BufMut>(buf: &mut B, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

/// Encoded size of a CompactSize
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Read a CompactSize, rejecting non-shortest forms
pub fn read_compact_size(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    let tag = read_u8(buf, "compact size")?;
    let (value, min) = match tag {
        0xfd => (u64::from(read_u16_le(buf, "compact size")?), 0xfd),
        0xfe => (u64::from(read_u32(buf, "compact size")?), 0x1_0000),
        0xff => (read_u64(buf, "compact size")?, 0x1_0000_0000),
        n => return Ok(u64::from(n)),
    };
    if value < min {
        return Err(DecodeError::NonCanonicalCompactSize);
    }
    Ok(value)
}

/// Read a CompactSize element count bounded by `max`
///
/// Each element needs at least `min_element_len` bytes, so a count that
/// cannot fit in what is left is rejected before anything is allocated.
pub fn read_count(
    buf: &mut &[u8],
    what: &'static str,
    max: u64,
    min_element_len: usize,
) -> Result<usize, DecodeError> {
    let count = read_compact_size(buf)?;
    let fits = (buf.remaining() / min_element_len.max(1)) as u64;
    if count > max || count > fits {
        return Err(DecodeError::OversizedSequence {
            what,
            count,
            max: max.min(fits),
        });
    }
    Ok(count as usize)
}

/// Decode a CompactSize-prefixed sequence
pub fn read_vec<T: Decodable>(
    buf: &mut &[u8],
    what: &'static str,
    max: u64,
    min_element_len: usize,
) -> Result<Vec<T>, DecodeError> {
    let count = read_count(buf, what, max, min_element_len)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::consensus_decode(buf)?);
    }
    Ok(items)
}

/// Encode a CompactSize-prefixed sequence
pub fn write_vec<T: Encodable, B: BufMut>(buf: &mut B, items: &[T]) {
    write_compact_size(buf, items.len() as u64);
    for item in items {
        item.consensus_encode(buf);
    }
}

pub fn write_var_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn read_var_bytes(buf: &mut &[u8], what: &'static str) -> Result<Vec<u8>, DecodeError> {
    let len = read_count(buf, what, MAX_SIZE, 1)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_str<B: BufMut>(buf: &mut B, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub fn read_var_str(buf: &mut &[u8], what: &'static str) -> Result<String, DecodeError> {
    let bytes = read_var_bytes(buf, what)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(what))
}
