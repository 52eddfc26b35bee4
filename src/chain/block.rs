//! Blocks and block headers

use bytes::BufMut;

use crate::chain::hash::{sha256d, Hash256, Target};
use crate::chain::transaction::Transaction;
use crate::network::encoding::{
    read_array, read_i32, read_u32, read_vec, write_vec, Decodable, Encodable, MAX_SIZE,
};
use crate::network::error::DecodeError;

/// Encoded header size
pub const HEADER_LEN: usize = 80;

/// Default regtest difficulty bits
pub const REGTEST_BITS: u32 = 0x207f_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double-SHA256 of the 80 serialized header bytes
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_blockhash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn target(&self) -> Option<Target> {
        Target::from_compact(self.bits)
    }

    /// Whether the header hash satisfies its own bits
    pub fn meets_target(&self) -> bool {
        self.target().is_some_and(|t| t.is_met_by(&self.hash()))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.to_bytes());
    }

    fn encoded_len(&self) -> usize {
        HEADER_LEN
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(BlockHeader {
            version: read_i32(buf, "block version")?,
            prev_blockhash: Hash256(read_array(buf, "previous block hash")?),
            merkle_root: Hash256(read_array(buf, "merkle root")?),
            time: read_u32(buf, "block time")?,
            bits: read_u32(buf, "block bits")?,
            nonce: read_u32(buf, "block nonce")?,
        })
    }
}

/// Merkle root of a list of txids
///
/// Pairwise double-SHA256 reduction; an odd node at any level is paired with
/// itself. The empty list hashes to zero.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(left.as_bytes());
                concat[32..].copy_from_slice(right.as_bytes());
                sha256d(&concat)
            })
            .collect();
    }
    level[0]
}

/// Header plus ordered transactions
///
/// Built blocks keep the merkle root in step with the transaction list: the
/// only ways to change transactions recompute it. [`Block::from_parts_unchecked`]
/// exists for blocks decoded off the wire and for deliberately malformed test
/// blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block, deriving the merkle root from `transactions`
    pub fn new(mut header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        header.merkle_root = Self::compute_merkle_root(&transactions);
        Self {
            header,
            transactions,
        }
    }

    /// Assemble a block without touching the header
    pub fn from_parts_unchecked(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_blockhash(&self) -> Hash256 {
        self.header.prev_blockhash
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        merkle_root(&txids)
    }

    /// Whether the header commits to the current transaction list
    pub fn has_valid_merkle_root(&self) -> bool {
        self.header.merkle_root == Self::compute_merkle_root(&self.transactions)
    }

    /// Replace the transaction list and recompute the merkle root
    pub fn update_transactions(&mut self, transactions: Vec<Transaction>) {
        self.header.merkle_root = Self::compute_merkle_root(&transactions);
        self.transactions = transactions;
    }

    /// Mutate transactions in place, then recompute the merkle root
    pub fn modify_transactions<F: FnOnce(&mut Vec<Transaction>)>(&mut self, f: F) {
        f(&mut self.transactions);
        self.header.merkle_root = Self::compute_merkle_root(&self.transactions);
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        self.header.nonce = nonce;
    }

    pub fn set_time(&mut self, time: u32) {
        self.header.time = time;
    }

    pub fn set_bits(&mut self, bits: u32) {
        self.header.bits = bits;
    }

    /// Overwrite the merkle root; the block will no longer be consistent
    pub fn set_merkle_root_unchecked(&mut self, root: Hash256) {
        self.header.merkle_root = root;
    }
}

/// Smallest encoded transaction: version, two empty counts, lock time
const MIN_TX_LEN: usize = 4 + 1 + 1 + 4;

impl Encodable for Block {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.header.consensus_encode(buf);
        write_vec(buf, &self.transactions);
    }
}

impl Decodable for Block {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(buf)?;
        let transactions = read_vec(buf, "block transactions", MAX_SIZE, MIN_TX_LEN)?;
        Ok(Block::from_parts_unchecked(header, transactions))
    }
}
