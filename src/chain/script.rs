//! Script construction helpers

use bytes::BufMut;
use std::fmt;

use crate::network::encoding::{read_var_bytes, write_var_bytes, Decodable, Encodable};
use crate::network::error::DecodeError;

pub const OP_0: u8 = 0x00;
pub const OP_FALSE: u8 = OP_0;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_TRUE: u8 = OP_1;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Raw script bytes
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Script(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    /// Push data with the smallest push opcode for its length
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < OP_PUSHDATA1 as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Push an integer, using OP_0/OP_1NEGATE/OP_1..OP_16 where possible
    pub fn push_int(self, n: i64) -> Self {
        match n {
            0 => self.push_opcode(OP_0),
            -1 => self.push_opcode(OP_1NEGATE),
            1..=16 => self.push_opcode(OP_1 + (n as u8) - 1),
            _ => self.push_slice(&encode_script_num(n)),
        }
    }
}

/// Minimal little-endian sign-magnitude encoding of a script number
pub fn encode_script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // Top bit carries the sign; add a byte when the magnitude already uses it.
    if let Some(last) = out.last_mut() {
        if *last & 0x80 != 0 {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *last |= 0x80;
        }
    }
    out
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl Encodable for Script {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        write_var_bytes(buf, &self.0);
    }
}

impl Decodable for Script {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Script(read_var_bytes(buf, "script")?))
    }
}
