//! Block and transaction construction helpers
//!
//! Free functions used by scenarios and by [`ChainBuilder`](super::ChainBuilder).
//! Every output created here is anyone-can-spend (`OP_TRUE`) unless a script is
//! given, so spends only need an empty or trivially true unlocking script.

use tracing::debug;

use crate::chain::block::{Block, BlockHeader, REGTEST_BITS};
use crate::chain::hash::{Hash256, Target};
use crate::chain::script::{Script, OP_0, OP_TRUE};
use crate::chain::transaction::{Amount, OutPoint, Transaction, TxIn, TxOut, COIN, SEQUENCE_FINAL};
use crate::error::{HarnessError, Result};

/// Blocks between subsidy halvings on regtest
pub const REGTEST_HALVING_INTERVAL: u32 = 150;

/// Confirmations before a coinbase output may be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Version used for built blocks
pub const BLOCK_VERSION: i32 = 1;

/// Version used for built transactions
pub const TX_VERSION: i32 = 1;

/// Fee used by [`spend_chain`] for each link
pub const DEFAULT_TX_FEE: Amount = 10_000;

/// Block subsidy at `height` on regtest
pub fn block_subsidy(height: u32) -> Amount {
    let halvings = height / REGTEST_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

/// Anyone-can-spend locking script
pub fn anyone_can_spend() -> Script {
    Script::new().push_opcode(OP_TRUE)
}

/// Coinbase for `height` paying `value` to an anyone-can-spend output
///
/// The unlocking script carries the height followed by `OP_0` so it is never
/// shorter than two bytes.
pub fn create_coinbase(height: u32, value: Amount) -> Transaction {
    Transaction {
        version: TX_VERSION,
        inputs: vec![TxIn {
            prevout: OutPoint::NULL,
            script_sig: Script::new().push_int(i64::from(height)).push_opcode(OP_0),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: anyone_can_spend(),
        }],
        lock_time: 0,
    }
}

/// Spend output `output_index` of `source` into a single anyone-can-spend output
pub fn create_transaction(
    source: &Transaction,
    output_index: u32,
    unlock_script: Script,
    value: Amount,
) -> Result<Transaction> {
    create_transaction_with_script(source, output_index, unlock_script, value, anyone_can_spend())
}

/// Like [`create_transaction`] with an explicit locking script
pub fn create_transaction_with_script(
    source: &Transaction,
    output_index: u32,
    unlock_script: Script,
    value: Amount,
    script_pubkey: Script,
) -> Result<Transaction> {
    if output_index as usize >= source.outputs.len() {
        return Err(HarnessError::OutputIndexOutOfRange {
            txid: source.txid(),
            index: output_index,
            outputs: source.outputs.len(),
        });
    }
    Ok(Transaction {
        version: TX_VERSION,
        inputs: vec![TxIn {
            prevout: source.outpoint(output_index),
            script_sig: unlock_script,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    })
}

/// Chain of `count` transactions, each spending output 0 of the previous one
///
/// The first spends output 0 of `source`. Each link pays `fee`, so the
/// returned total is `count * fee`.
pub fn spend_chain(
    source: &Transaction,
    count: usize,
    fee: Amount,
) -> Result<(Amount, Vec<Transaction>)> {
    let mut txs: Vec<Transaction> = Vec::with_capacity(count);
    let mut value = source
        .outputs
        .first()
        .map(|o| o.value)
        .ok_or_else(|| HarnessError::OutputIndexOutOfRange {
            txid: source.txid(),
            index: 0,
            outputs: 0,
        })?;
    if (count as Amount) * fee > value {
        return Err(HarnessError::Usage(format!(
            "cannot pay {} fees of {} from an output of {}",
            count, fee, value
        )));
    }
    for _ in 0..count {
        value -= fee;
        let parent = txs.last().unwrap_or(source);
        let tx = create_transaction(parent, 0, Script::new(), value)?;
        txs.push(tx);
    }
    Ok((fee * count as Amount, txs))
}

/// Unsolved block on top of `prev_hash` with regtest bits and nonce 0
pub fn build_block(prev_hash: Hash256, transactions: Vec<Transaction>, time: u32) -> Block {
    let header = BlockHeader {
        version: BLOCK_VERSION,
        prev_blockhash: prev_hash,
        merkle_root: Hash256::ZERO,
        time,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    Block::new(header, transactions)
}

/// Increment the nonce until the header hash is below `target`
///
/// Unbounded. When the nonce space wraps the timestamp is bumped and the
/// search continues. Returns the number of hashes tried.
pub fn solve_proof_of_work(block: &mut Block, target: &Target) -> u64 {
    let mut attempts = 0u64;
    loop {
        attempts += 1;
        if target.is_met_by(&block.hash()) {
            return attempts;
        }
        advance_nonce(block);
    }
}

/// Bounded variant of [`solve_proof_of_work`]
pub fn solve_bounded(block: &mut Block, target: &Target, max_attempts: u64) -> Result<u64> {
    for attempt in 1..=max_attempts {
        if target.is_met_by(&block.hash()) {
            return Ok(attempt);
        }
        advance_nonce(block);
    }
    debug!("gave up on block {} after {} attempts", block.hash(), max_attempts);
    Err(HarnessError::PowExhausted {
        attempts: max_attempts,
        block: block.hash(),
    })
}

/// Solve against the block's own bits
pub fn solve(block: &mut Block, max_attempts: Option<u64>) -> Result<u64> {
    let bits = block.header().bits;
    let target = Target::from_compact(bits)
        .ok_or_else(|| HarnessError::Usage(format!("invalid compact bits {:#010x}", bits)))?;
    match max_attempts {
        Some(max) => solve_bounded(block, &target, max),
        None => Ok(solve_proof_of_work(block, &target)),
    }
}

fn advance_nonce(block: &mut Block) {
    let header = block.header();
    let (nonce, wrapped) = header.nonce.overflowing_add(1);
    if wrapped {
        let time = header.time.wrapping_add(1);
        block.set_time(time);
    }
    block.set_nonce(nonce);
}
