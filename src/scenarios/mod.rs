//! Built-in comparison scenarios
//!
//! Each builder extends a [`ChainBuilder`] and returns the instances to feed
//! a [`TestManager`](crate::comptool::TestManager). Invalid blocks are built
//! off to the side: the builder always ends on the chain the node should have
//! as its tip.

use tracing::debug;

use crate::chain::blocktools::{spend_chain, DEFAULT_TX_FEE};
use crate::chain::{
    create_coinbase, create_transaction, Amount, ChainBuilder, Script, Transaction, COIN,
    COINBASE_MATURITY,
};
use crate::chain::script::{OP_NOTIF, OP_TRUE};
use crate::comptool::{Outcome, TestInstance};
use crate::error::{HarnessError, Result};
use crate::network::protocol::RejectCode;

/// Transactions chained off one coinbase in the fork scenario
pub const FORK_CHAIN_LEN: usize = 99;

/// `count` coinbase-only blocks, all accepted, synchronized once at the end
pub fn mature_chain(builder: &mut ChainBuilder, count: u32) -> Result<TestInstance> {
    let mut instance = TestInstance::new(false);
    for _ in 0..count {
        instance.push(builder.next_block(Vec::new(), 0)?, Outcome::Accepted);
    }
    Ok(instance)
}

/// Coinbase of the block at `height` on the builder's current chain
fn coinbase(builder: &ChainBuilder, height: u32) -> Result<Transaction> {
    builder
        .coinbase_at(height)
        .cloned()
        .ok_or_else(|| HarnessError::Usage(format!("no coinbase built at height {}", height)))
}

fn output_value(tx: &Transaction) -> Amount {
    tx.outputs.first().map(|o| o.value).unwrap_or(0)
}

/// One accepted block followed by enough blocks to mature its coinbase
///
/// Returns the instances and the now spendable coinbase.
fn funded_start(builder: &mut ChainBuilder) -> Result<(Vec<TestInstance>, Transaction)> {
    let first = builder.next_block(Vec::new(), 0)?;
    let funding = coinbase(builder, builder.tip().height)?;
    let instances = vec![
        TestInstance::single(first, true),
        mature_chain(builder, COINBASE_MATURITY)?,
    ];
    Ok((instances, funding))
}

/// Competing forks spending the same coinbase
///
/// Fork A (one block) is accepted first. Fork B spends the same coinbase
/// differently; its first block ties and is not accepted, its second makes it
/// the most-work chain and the node reorgs. Fork A's transaction then
/// conflicts with the active chain and stays out of the mempool.
pub fn reorg(builder: &mut ChainBuilder) -> Result<Vec<TestInstance>> {
    let (mut instances, funding) = funded_start(builder)?;
    let input_value = output_value(&funding);
    let fork_point = builder.tip();

    let mut fork_a = builder.fork_from(fork_point);
    let tx_a = create_transaction(&funding, 0, Script::new(), input_value / 5)?;
    let block_a = fork_a.next_block(vec![tx_a.clone()], input_value - input_value / 5)?;

    let tx_b = create_transaction(&funding, 0, Script::new(), input_value / 4)?;
    let block_b1 = builder.next_block(vec![tx_b], input_value - input_value / 4)?;
    let block_b2 = builder.next_block(Vec::new(), 0)?;
    debug!(
        "reorg: fork point {} (height {}), a={}, b={}",
        fork_point.hash,
        fork_point.height,
        block_a.hash(),
        block_b2.hash()
    );

    instances.push(TestInstance::single(block_a, true));
    instances.push(TestInstance::single(block_b1, false));
    instances.push(TestInstance::single(block_b2, true));
    instances.push(TestInstance::single(tx_a, false));
    Ok(instances)
}

/// Loose transactions the node must refuse or accept
pub fn invalid_tx(builder: &mut ChainBuilder) -> Result<Vec<TestInstance>> {
    let (mut instances, funding) = funded_start(builder)?;
    let value = output_value(&funding);

    // A coinbase is only valid inside a block
    instances.push(TestInstance::single(
        create_coinbase(0, 50 * COIN),
        Outcome::rejected(RejectCode::Invalid, "bad-tx-coinbase"),
    ));

    // Lock height far in the future with a non-final sequence
    let mut nonfinal = create_transaction(&funding, 0, Script::new(), value - 200)?;
    nonfinal.lock_time = 5_000_000;
    nonfinal.inputs[0].sequence = 0;
    instances.push(TestInstance::single(
        nonfinal,
        Outcome::rejected(RejectCode::Invalid, "bad-txns-nonfinal"),
    ));

    // Chained spends are fine, a second spend of the same output is not
    let tx1 = create_transaction(&funding, 0, Script::new(), value - 300)?;
    let tx2 = create_transaction(&tx1, 0, Script::new(), value - 400)?;
    let tx3 = create_transaction(&tx1, 0, Script::new(), value - 500)?;
    instances.push(TestInstance::single(tx1, true));
    instances.push(TestInstance::single(tx2, true));
    instances.push(TestInstance::single(tx3, false));
    Ok(instances)
}

/// Unlocking scripts a real node's interpreter refuses
///
/// `funding` must be a mature transaction with an anyone-can-spend output 0.
pub fn script_rejections(funding: &Transaction) -> Result<Vec<TestInstance>> {
    let value = output_value(funding);
    let unbalanced = create_transaction(
        funding,
        0,
        Script::new().push_opcode(OP_NOTIF),
        value - 12_000,
    )?;
    let unclean = create_transaction(
        funding,
        0,
        Script::new().push_opcode(OP_TRUE),
        value - 300,
    )?;
    Ok(vec![
        TestInstance::single(
            unbalanced,
            Outcome::rejected(RejectCode::Invalid, "mandatory-script-verify-flag-failed"),
        ),
        TestInstance::single(
            unclean,
            Outcome::rejected(RejectCode::Nonstandard, "non-mandatory-script-verify-flag"),
        ),
    ])
}

/// Spending a coinbase one block too early is rejected, on time is accepted
pub fn coinbase_maturity(builder: &mut ChainBuilder) -> Result<Vec<TestInstance>> {
    let first = builder.next_block(Vec::new(), 0)?;
    let funding = coinbase(builder, builder.tip().height)?;
    let mut instances = vec![
        TestInstance::single(first, true),
        mature_chain(builder, COINBASE_MATURITY - 2)?,
    ];

    let value = output_value(&funding);
    let spend = create_transaction(&funding, 0, Script::new(), value - DEFAULT_TX_FEE)?;

    let before = builder.tip();
    let premature = builder.next_block(vec![spend.clone()], DEFAULT_TX_FEE)?;
    builder.reset_to(before);
    instances.push(TestInstance::single(
        premature,
        Outcome::rejected(RejectCode::Invalid, "bad-txns-premature-spend-of-coinbase"),
    ));

    instances.push(TestInstance::single(builder.next_block(Vec::new(), 0)?, true));
    instances.push(TestInstance::single(
        builder.next_block(vec![spend], DEFAULT_TX_FEE)?,
        true,
    ));
    Ok(instances)
}

/// A block listing the same transaction twice is rejected
pub fn duplicate_tx_block(builder: &mut ChainBuilder) -> Result<Vec<TestInstance>> {
    let (mut instances, funding) = funded_start(builder)?;
    let value = output_value(&funding);
    let tx = create_transaction(&funding, 0, Script::new(), value - DEFAULT_TX_FEE)?;

    let before = builder.tip();
    let duplicate = tx.clone();
    let bad = builder.next_block_with(vec![tx.clone()], DEFAULT_TX_FEE, move |block| {
        block.modify_transactions(|txs| txs.push(duplicate));
    })?;
    builder.reset_to(before);
    instances.push(TestInstance::single(
        bad,
        Outcome::rejected(RejectCode::Invalid, "bad-txns-duplicate"),
    ));

    instances.push(TestInstance::single(
        builder.next_block(vec![tx], DEFAULT_TX_FEE)?,
        true,
    ));
    Ok(instances)
}

/// Switch between forks carrying long transaction chains
///
/// The node has to undo a block full of dependent transactions when the
/// second fork overtakes the first.
pub fn fork_undo(builder: &mut ChainBuilder, chain_len: usize) -> Result<Vec<TestInstance>> {
    let start = builder.tip().height;
    let mut instances = vec![mature_chain(builder, COINBASE_MATURITY)?];
    let first = coinbase(builder, start + 1)?;
    let second = coinbase(builder, start + 2)?;
    let fork_point = builder.tip();

    let mut fork_a = builder.fork_from(fork_point);
    let (fees, txs) = spend_chain(&first, chain_len, DEFAULT_TX_FEE)?;
    instances.push(TestInstance::single(fork_a.next_block(txs, fees)?, true));

    // Different fee so fork B's transactions differ from fork A's
    let (fees, txs) = spend_chain(&first, chain_len, 2 * DEFAULT_TX_FEE)?;
    instances.push(TestInstance::single(builder.next_block(txs, fees)?, false));
    let (fees, txs) = spend_chain(&second, chain_len, 2 * DEFAULT_TX_FEE)?;
    instances.push(TestInstance::single(builder.next_block(txs, fees)?, true));
    Ok(instances)
}

/// `count` accepted blocks, the last one checked for identical state everywhere
pub fn convergence(builder: &mut ChainBuilder, count: u32) -> Result<Vec<TestInstance>> {
    if count == 0 {
        return Err(HarnessError::Usage("convergence needs at least one block".to_string()));
    }
    let mut instance = TestInstance::new(true);
    for i in 0..count {
        let block = builder.next_block(Vec::new(), 0)?;
        let outcome = if i + 1 == count {
            Outcome::CrossNodeEquality
        } else {
            Outcome::Accepted
        };
        instance.push(block, outcome);
    }
    Ok(vec![instance])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTip;
    use crate::comptool::Payload;

    fn builder() -> ChainBuilder {
        ChainBuilder::new(ChainTip::regtest_genesis())
    }

    fn payload_count(instances: &[TestInstance]) -> usize {
        instances.iter().map(|i| i.len()).sum()
    }

    fn block(instance: &TestInstance, index: usize) -> &crate::chain::Block {
        match &instance.entries()[index].0 {
            Payload::Block(block) => block,
            Payload::Tx(_) => panic!("expected a block"),
        }
    }

    #[test]
    fn test_reorg_forks_share_parent() {
        let mut b = builder();
        let instances = reorg(&mut b).unwrap();
        // first block, maturity run, fork a, fork b (two blocks), evicted tx
        assert_eq!(instances.len(), 6);
        assert_eq!(payload_count(&instances), 105);
        assert!(!instances[1].sync_every_payload());
        assert_eq!(b.tip().height, 103);

        let fork_point = block(&instances[1], 99).hash();
        let a = block(&instances[2], 0);
        let b1 = block(&instances[3], 0);
        let b2 = block(&instances[4], 0);
        assert_eq!(a.prev_blockhash(), fork_point);
        assert_eq!(b1.prev_blockhash(), fork_point);
        assert_eq!(b2.prev_blockhash(), b1.hash());
        assert_ne!(a.hash(), b1.hash());
        assert_eq!(b.tip().hash, b2.hash());

        // Both forks spend block 1's coinbase
        let coinbase = block(&instances[0], 0).transactions()[0].txid();
        assert_eq!(a.transactions()[1].inputs[0].prevout.txid, coinbase);
        assert_eq!(b1.transactions()[1].inputs[0].prevout.txid, coinbase);
        assert_eq!(
            a.transactions()[1].outputs[0].value,
            block(&instances[0], 0).transactions()[0].outputs[0].value / 5
        );
    }

    #[test]
    fn test_invalid_tx_outcomes() {
        let mut b = builder();
        let instances = invalid_tx(&mut b).unwrap();
        assert_eq!(instances.len(), 7);
        assert_eq!(b.tip().height, 101);

        let (nonfinal, outcome) = &instances[3].entries()[0];
        let Payload::Tx(tx) = nonfinal else { panic!("expected a tx") };
        assert_eq!(tx.lock_time, 5_000_000);
        assert!(!tx.is_final_sequence());
        assert!(matches!(outcome, Outcome::Rejected { code: RejectCode::Invalid, .. }));
        assert!(matches!(instances[6].entries()[0].1, Outcome::NotAccepted));
    }

    #[test]
    fn test_coinbase_maturity_heights() {
        let mut b = builder();
        let instances = coinbase_maturity(&mut b).unwrap();
        assert_eq!(b.tip().height, 101);

        let funding = block(&instances[0], 0).transactions()[0].txid();
        let premature = block(&instances[2], 0);
        // Sits at height 100, one short of maturity for the height 1 coinbase
        assert_eq!(premature.prev_blockhash(), block(&instances[1], 97).hash());
        assert_eq!(premature.transactions()[1].inputs[0].prevout.txid, funding);

        let on_time = block(&instances[4], 0);
        assert_eq!(on_time.prev_blockhash(), block(&instances[3], 0).hash());
        assert_eq!(on_time.transactions()[1].inputs[0].prevout.txid, funding);
    }

    #[test]
    fn test_duplicate_tx_block_keeps_valid_merkle_root() {
        let mut b = builder();
        let instances = duplicate_tx_block(&mut b).unwrap();
        let bad = block(&instances[2], 0);
        assert_eq!(bad.transactions().len(), 3);
        assert_eq!(bad.transactions()[1], bad.transactions()[2]);
        assert!(bad.has_valid_merkle_root());
        assert!(bad.header().meets_target());

        let good = block(&instances[3], 0);
        assert_eq!(good.prev_blockhash(), bad.prev_blockhash());
        assert_eq!(b.tip().hash, good.hash());
    }

    #[test]
    fn test_fork_undo_second_fork_wins() {
        let mut b = builder();
        let instances = fork_undo(&mut b, 3).unwrap();
        assert_eq!(instances.len(), 4);
        assert_eq!(b.tip().height, 102);
        let a = block(&instances[1], 0);
        let b1 = block(&instances[2], 0);
        assert_eq!(a.transactions().len(), 4);
        assert_ne!(a.transactions()[1], b1.transactions()[1]);
    }

    #[test]
    fn test_convergence_checks_last_block() {
        let mut b = builder();
        assert!(convergence(&mut b, 0).is_err());
        let instances = convergence(&mut b, 3).unwrap();
        let entries = instances[0].entries();
        assert!(matches!(entries[1].1, Outcome::Accepted));
        assert!(matches!(entries[2].1, Outcome::CrossNodeEquality));
    }

    #[test]
    fn test_script_rejections_spend_funding() {
        let funding = create_coinbase(1, 50 * COIN);
        let instances = script_rejections(&funding).unwrap();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            let Payload::Tx(tx) = &instance.entries()[0].0 else { panic!("expected a tx") };
            assert_eq!(tx.inputs[0].prevout, funding.outpoint(0));
        }
    }
}
