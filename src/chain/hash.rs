//! Double-SHA256 hashes and proof-of-work targets

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use bytes::BufMut;

use crate::network::encoding::{read_array, Decodable, Encodable};
use crate::network::error::DecodeError;

/// 32-byte hash in internal (wire) byte order
///
/// Displayed and parsed byte-reversed, the way nodes print block hashes and
/// txids over RPC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Byte-reversed copy, most significant byte first
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Parse the RPC (byte-reversed) hex form
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash256(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_be_bytes()))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Encodable for Hash256 {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }

    fn encoded_len(&self) -> usize {
        32
    }
}

impl Decodable for Hash256 {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Hash256(read_array(buf, "hash")?))
    }
}

/// Double SHA256
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);

    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// 256-bit proof-of-work target, big-endian
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// Expand compact `bits` into a full target
    ///
    /// Returns `None` for negative or overflowing encodings.
    pub fn from_compact(bits: u32) -> Option<Target> {
        let exponent = (bits >> 24) as usize;
        let mut mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 && mantissa != 0 {
            return None;
        }

        let mut out = [0u8; 32];
        if exponent <= 3 {
            mantissa >>= 8 * (3 - exponent);
            out[29..].copy_from_slice(&mantissa.to_be_bytes()[1..]);
            return Some(Target(out));
        }
        if mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32))
        {
            return None;
        }

        let m = mantissa.to_be_bytes();
        for (i, byte) in m[1..].iter().enumerate() {
            let pos = 32 + i as isize - exponent as isize;
            if let Ok(pos) = usize::try_from(pos) {
                if let Some(slot) = out.get_mut(pos) {
                    *slot = *byte;
                }
            }
        }
        Some(Target(out))
    }

    /// Compress back into compact bits
    pub fn to_compact(&self) -> u32 {
        let Some(first) = self.0.iter().position(|b| *b != 0) else {
            return 0;
        };
        let mut size = 32 - first;
        let mut mantissa = if size <= 3 {
            let mut value = 0u32;
            for b in &self.0[first..] {
                value = (value << 8) | u32::from(*b);
            }
            value << (8 * (3 - size))
        } else {
            u32::from_be_bytes([0, self.0[first], self.0[first + 1], self.0[first + 2]])
        };
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            size += 1;
        }
        ((size as u32) << 24) | mantissa
    }

    /// Whether `hash`, read as a little-endian number, is below this target
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        hash.to_be_bytes() < self.0
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", hex::encode(self.0))
    }
}
