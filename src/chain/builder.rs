//! Chain extension with fork bookkeeping
//!
//! A [`ChainBuilder`] extends one tip at a time. Forks are expressed by taking
//! an immutable [`ChainTip`] snapshot and continuing from it in a separate
//! builder (or rewinding the same builder); no builder ever mutates another.

use std::collections::HashMap;
use tracing::debug;

use crate::chain::block::{Block, REGTEST_BITS};
use crate::chain::blocktools::{block_subsidy, build_block, create_coinbase, solve};
use crate::chain::hash::Hash256;
use crate::chain::transaction::{Amount, Transaction};
use crate::error::Result;

/// Regtest genesis hash of the Bitcoin Cash family
pub const REGTEST_GENESIS_HASH: &str =
    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

/// Regtest genesis timestamp
pub const REGTEST_GENESIS_TIME: u32 = 1_296_688_602;

/// Snapshot of a chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
}

impl ChainTip {
    pub fn new(hash: Hash256, height: u32, time: u32) -> Self {
        Self { hash, height, time }
    }

    /// Tip of a fresh regtest chain
    pub fn regtest_genesis() -> Self {
        let hash = Hash256::from_hex(REGTEST_GENESIS_HASH).unwrap_or_default();
        Self::new(hash, 0, REGTEST_GENESIS_TIME)
    }
}

#[derive(Clone)]
struct BuiltBlock {
    height: u32,
    block: Block,
}

/// Builds solved blocks on top of a tip
pub struct ChainBuilder {
    tip: ChainTip,
    bits: u32,
    max_pow_attempts: Option<u64>,
    blocks: HashMap<Hash256, BuiltBlock>,
}

impl ChainBuilder {
    pub fn new(tip: ChainTip) -> Self {
        Self {
            tip,
            bits: REGTEST_BITS,
            max_pow_attempts: None,
            blocks: HashMap::new(),
        }
    }

    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    /// Cap the nonce search per block
    pub fn with_max_pow_attempts(mut self, max: Option<u64>) -> Self {
        self.max_pow_attempts = max;
        self
    }

    /// Current tip
    pub fn tip(&self) -> ChainTip {
        self.tip
    }

    /// Independent builder continuing from `tip`
    ///
    /// Blocks built so far are visible to the new builder so it can look up
    /// coinbases below the fork point.
    pub fn fork_from(&self, tip: ChainTip) -> ChainBuilder {
        ChainBuilder {
            tip,
            bits: self.bits,
            max_pow_attempts: self.max_pow_attempts,
            blocks: self.blocks.clone(),
        }
    }

    /// Rewind (or move) this builder to `tip`
    pub fn reset_to(&mut self, tip: ChainTip) {
        debug!("chain builder moved from {} to {}", self.tip.hash, tip.hash);
        self.tip = tip;
    }

    /// Build, solve and append the next block
    ///
    /// The coinbase pays the height's subsidy plus `fees` and is followed by
    /// `txs` in order.
    pub fn next_block(&mut self, txs: Vec<Transaction>, fees: Amount) -> Result<Block> {
        self.next_block_with(txs, fees, |_| {})
    }

    /// Like [`next_block`](Self::next_block) with a hook run before solving
    ///
    /// The hook can alter the transaction list or header fields to produce a
    /// deliberately invalid block; the block still gets valid proof-of-work.
    pub fn next_block_with<F>(&mut self, txs: Vec<Transaction>, fees: Amount, tweak: F) -> Result<Block>
    where
        F: FnOnce(&mut Block),
    {
        let height = self.tip.height + 1;
        let time = self.tip.time + 1;

        let mut transactions = Vec::with_capacity(txs.len() + 1);
        transactions.push(create_coinbase(height, block_subsidy(height) + fees));
        transactions.extend(txs);

        let mut block = build_block(self.tip.hash, transactions, time);
        block.set_bits(self.bits);
        tweak(&mut block);
        solve(&mut block, self.max_pow_attempts)?;

        let hash = block.hash();
        debug!("built block {} at height {}", hash, height);
        self.tip = ChainTip::new(hash, height, block.header().time);
        self.blocks.insert(
            hash,
            BuiltBlock {
                height,
                block: block.clone(),
            },
        );
        Ok(block)
    }

    /// A block previously produced by this builder (or its parent)
    pub fn block(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash).map(|b| &b.block)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.blocks.get(hash).map(|b| b.height)
    }

    /// Coinbase at `height` on the chain ending at the current tip
    pub fn coinbase_at(&self, height: u32) -> Option<&Transaction> {
        let mut cursor = self.blocks.get(&self.tip.hash)?;
        while cursor.height > height {
            cursor = self.blocks.get(&cursor.block.prev_blockhash())?;
        }
        if cursor.height == height {
            cursor.block.coinbase()
        } else {
            None
        }
    }

    /// Number of blocks built so far across all forks
    pub fn built_count(&self) -> usize {
        self.blocks.len()
    }
}
