//! Transactions
//!
//! Fields are public and freely mutable; the txid is never cached, it is
//! recomputed from the serialized bytes on every call to [`Transaction::txid`].

use bytes::BufMut;

use crate::chain::hash::{sha256d, Hash256};
use crate::chain::script::Script;
use crate::network::encoding::{
    read_i32, read_i64, read_u32, read_vec, serialize, write_vec, Decodable, Encodable, MAX_SIZE,
};
use crate::network::error::DecodeError;

/// Value in base units
pub type Amount = i64;

/// Base units per coin
pub const COIN: Amount = 100_000_000;

/// Sequence number that disables lock-time checks for an input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// The outpoint a coinbase input refers to
    pub const NULL: OutPoint = OutPoint {
        txid: Hash256::ZERO,
        vout: u32::MAX,
    };

    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.txid.consensus_encode(buf);
        buf.put_u32_le(self.vout);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(OutPoint {
            txid: Hash256::consensus_decode(buf)?,
            vout: read_u32(buf, "outpoint index")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.prevout.consensus_encode(buf);
        self.script_sig.consensus_encode(buf);
        buf.put_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TxIn {
            prevout: OutPoint::consensus_decode(buf)?,
            script_sig: Script::consensus_decode(buf)?,
            sequence: read_u32(buf, "sequence")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl Encodable for TxOut {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.value);
        self.script_pubkey.consensus_encode(buf);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TxOut {
            value: read_i64(buf, "output value")?,
            script_pubkey: Script::consensus_decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

/// Smallest possible encoded input: outpoint, empty script, sequence
const MIN_TXIN_LEN: usize = 32 + 4 + 1 + 4;
/// Smallest possible encoded output: value, empty script
const MIN_TXOUT_LEN: usize = 8 + 1;

impl Transaction {
    /// Identity hash over the serialized bytes
    pub fn txid(&self) -> Hash256 {
        sha256d(&serialize(self))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Outpoint of one of this transaction's outputs
    pub fn outpoint(&self, vout: u32) -> OutPoint {
        OutPoint::new(self.txid(), vout)
    }

    /// Whether every input opts out of lock-time enforcement
    pub fn is_final_sequence(&self) -> bool {
        self.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
    }
}

impl Encodable for Transaction {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        write_vec(buf, &self.inputs);
        write_vec(buf, &self.outputs);
        buf.put_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Transaction {
            version: read_i32(buf, "tx version")?,
            inputs: read_vec(buf, "tx inputs", MAX_SIZE, MIN_TXIN_LEN)?,
            outputs: read_vec(buf, "tx outputs", MAX_SIZE, MIN_TXOUT_LEN)?,
            lock_time: read_u32(buf, "lock time")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::script::OP_TRUE;
    use crate::network::encoding::deserialize;

    fn sample() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new(Hash256([7u8; 32]), 3),
                script_sig: Script::new().push_opcode(OP_TRUE),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut {
                value: 5 * COIN,
                script_pubkey: Script::new().push_opcode(OP_TRUE),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_encoding_layout() {
        let bytes = serialize(&sample());
        // version + count + input(32+4+1+1+4) + count + output(8+1+1) + locktime
        assert_eq!(bytes.len(), 4 + 1 + 42 + 1 + 10 + 4);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(deserialize::<Transaction>(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_txid_tracks_mutation() {
        let mut tx = sample();
        let before = tx.txid();
        tx.lock_time = 10;
        assert_ne!(tx.txid(), before);
        tx.lock_time = 0;
        assert_eq!(tx.txid(), before);
    }

    #[test]
    fn test_coinbase_detection() {
        let mut tx = sample();
        assert!(!tx.is_coinbase());
        tx.inputs[0].prevout = OutPoint::NULL;
        assert!(tx.is_coinbase());
    }
}
