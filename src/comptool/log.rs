//! Per-connection record of what the node told us, and what we can serve it
//!
//! The connection worker appends; the sequencer reads. Both sides go through
//! one `std::sync::Mutex`, held only for short non-async sections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::chain::{Block, BlockHeader, Hash256, Transaction};
use crate::comptool::instance::Payload;
use crate::network::peer::DisconnectReason;
use crate::network::protocol::{InventoryItem, RejectCode, RejectMessage, MAX_HEADERS_RESULTS};

/// Where a rejection was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectSource {
    /// `reject` message on the wire
    P2p,
    /// Error returned by a submission RPC
    Rpc,
}

/// A consensus-level rejection, kept as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectRecord {
    /// Rejected command (`block`, `tx`)
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<Hash256>,
    pub source: RejectSource,
}

impl RejectRecord {
    pub fn from_message(reject: &RejectMessage) -> Self {
        Self {
            message: reject.message.clone(),
            code: reject.code,
            reason: reject.reason.clone(),
            hash: reject.data,
            source: RejectSource::P2p,
        }
    }
}

impl fmt::Display for RejectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reject {} '{}'", self.code, self.reason)?;
        if self.source == RejectSource::Rpc {
            f.write_str(" (rpc)")?;
        }
        Ok(())
    }
}

/// Blocks and transactions delivered so far, served back on request
#[derive(Debug, Default)]
pub struct ObjectStore {
    blocks: HashMap<Hash256, Block>,
    txs: HashMap<Hash256, Transaction>,
    /// Most recently delivered block
    tip: Option<Hash256>,
}

impl ObjectStore {
    pub fn add(&mut self, payload: &Payload) {
        match payload {
            Payload::Block(block) => {
                let hash = block.hash();
                self.blocks.insert(hash, block.clone());
                self.tip = Some(hash);
            }
            Payload::Tx(tx) => {
                self.txs.insert(tx.txid(), tx.clone());
            }
        }
    }

    pub fn block(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn tx(&self, txid: &Hash256) -> Option<&Transaction> {
        self.txs.get(txid)
    }

    /// Headers from the last delivered block back to the first locator hit
    ///
    /// Walks back from the tip until a header's hash is in `locator` (or the
    /// known chain ends), then returns the headers after that point in chain
    /// order, stopping after `hash_stop` and at the protocol maximum.
    pub fn headers_for(&self, locator: &[Hash256], hash_stop: &Hash256) -> Vec<BlockHeader> {
        let Some(tip) = self.tip else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut cursor = tip;
        while let Some(block) = self.blocks.get(&cursor) {
            if locator.contains(&cursor) {
                break;
            }
            chain.push(*block.header());
            cursor = block.prev_blockhash();
        }
        chain.reverse();

        let mut headers = Vec::new();
        for header in chain {
            let done = header.hash() == *hash_stop;
            headers.push(header);
            if done || headers.len() as u64 >= MAX_HEADERS_RESULTS {
                break;
            }
        }
        headers
    }
}

/// Everything observed on one connection
#[derive(Debug, Default)]
pub struct PeerLog {
    pub rejects: Vec<RejectRecord>,
    pub inv: Vec<InventoryItem>,
    pub getdata: Vec<InventoryItem>,
    pub getheaders: usize,
    pub pongs: Vec<u64>,
    pub disconnected: Option<DisconnectReason>,
    pub store: ObjectStore,
}

impl PeerLog {
    /// Latest rejection recorded for `hash`
    pub fn reject_for(&self, hash: &Hash256) -> Option<&RejectRecord> {
        self.rejects.iter().rev().find(|r| r.hash.as_ref() == Some(hash))
    }

    pub fn has_pong(&self, nonce: u64) -> bool {
        self.pongs.contains(&nonce)
    }

    pub fn requested(&self, hash: &Hash256) -> bool {
        self.getdata.iter().any(|item| item.hash == *hash)
    }

    /// Count of data requests the node has made
    pub fn request_count(&self) -> usize {
        self.getdata.len() + self.getheaders
    }
}

/// Log shared between a connection worker and the sequencer
pub type SharedLog = Arc<Mutex<PeerLog>>;

pub fn new_shared_log() -> SharedLog {
    Arc::new(Mutex::new(PeerLog::default()))
}

/// Lock a shared log, recovering from a poisoned mutex
pub fn lock_log(log: &SharedLog) -> MutexGuard<'_, PeerLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, ChainTip};

    #[test]
    fn test_reject_for_returns_latest() {
        let mut log = PeerLog::default();
        let hash = Hash256([7u8; 32]);
        for reason in ["first", "second"] {
            log.rejects.push(RejectRecord {
                message: "tx".to_string(),
                code: RejectCode::Invalid,
                reason: reason.to_string(),
                hash: Some(hash),
                source: RejectSource::P2p,
            });
        }
        assert_eq!(log.reject_for(&hash).unwrap().reason, "second");
        assert!(log.reject_for(&Hash256::ZERO).is_none());
    }

    #[test]
    fn test_headers_for_locator() {
        let genesis = ChainTip::regtest_genesis();
        let mut builder = ChainBuilder::new(genesis);
        let mut store = ObjectStore::default();
        let mut hashes = Vec::new();
        for _ in 0..4 {
            let block = builder.next_block(Vec::new(), 0).unwrap();
            hashes.push(block.hash());
            store.add(&Payload::Block(block));
        }

        // Node knows up to the second block
        let headers = store.headers_for(&[hashes[1], genesis.hash], &Hash256::ZERO);
        let got: Vec<_> = headers.iter().map(|h| h.hash()).collect();
        assert_eq!(got, hashes[2..].to_vec());

        // Node knows only genesis, stop after the third block
        let headers = store.headers_for(&[genesis.hash], &hashes[2]);
        let got: Vec<_> = headers.iter().map(|h| h.hash()).collect();
        assert_eq!(got, hashes[..3].to_vec());

        // Node is at our tip
        assert!(store.headers_for(&[hashes[3]], &Hash256::ZERO).is_empty());
    }
}
