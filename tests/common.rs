//! Shared fixtures for the integration tests
//!
//! [`EmulatedNode`] is a small in-process node. It accepts P2P connections,
//! answers the driver's RPC calls and enforces just enough consensus to run
//! the built-in scenarios: blocks must connect to a known parent, the
//! most-work chain wins, coinbases mature after 100 blocks, lock times are
//! enforced, a block may not list a transaction twice, and the mempool
//! refuses coinbases and double spends.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use bllvm_harness::chain::{
    block_subsidy, sha256d, Amount, Block, ChainTip, Hash256, OutPoint, Transaction, TxOut, COIN,
    COINBASE_MATURITY,
};
use bllvm_harness::comptool::{DeliveryMode, SequencerConfig, TestManager};
use bllvm_harness::network::encoding::serialize;
use bllvm_harness::network::protocol::{
    InventoryItem, NetworkAddress, MSG_BLOCK, MSG_TX, PROTOCOL_VERSION,
};
use bllvm_harness::network::{
    MessageCodec, NetworkMagic, NetworkScheduler, Outbox, PeerHandler, ProtocolMessage,
    RejectCode, RejectMessage, SchedulerConfig, VersionMessage,
};
use bllvm_harness::rpc::{NodeRpc, RpcError, RpcResult, UtxoSetInfo};

const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Why the node refused a block or transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub code: RejectCode,
    pub reason: &'static str,
}

fn invalid(reason: &'static str) -> Refusal {
    Refusal {
        code: RejectCode::Invalid,
        reason,
    }
}

fn duplicate(reason: &'static str) -> Refusal {
    Refusal {
        code: RejectCode::Duplicate,
        reason,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    NewTip,
    /// Stored on a branch with no more work than the active chain
    SideChain,
    Known,
    /// Parent unknown
    Orphan,
    /// `hash` failed validation; it may be an ancestor of the submitted block
    Invalid(Hash256, Refusal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxVerdict {
    Accepted,
    /// Spends outputs the node does not know
    Orphan,
    Refused(Refusal),
}

#[derive(Debug, Clone)]
struct Coin {
    output: TxOut,
    height: u32,
    coinbase: bool,
}

type UtxoSet = HashMap<OutPoint, Coin>;

struct Entry {
    block: Block,
    height: u32,
    invalid: bool,
}

fn is_final(tx: &Transaction, height: u32, time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { time };
    tx.lock_time < cutoff || tx.is_final_sequence()
}

/// Context-free block checks
fn check_block(block: &Block) -> Result<(), Refusal> {
    let txs = block.transactions();
    if !block.header().meets_target() {
        return Err(invalid("high-hash"));
    }
    if !txs.first().map(Transaction::is_coinbase).unwrap_or(false) {
        return Err(invalid("bad-cb-missing"));
    }
    if txs.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(invalid("bad-cb-multiple"));
    }
    let mut seen = HashSet::new();
    if !txs.iter().all(|tx| seen.insert(tx.txid())) {
        return Err(invalid("bad-txns-duplicate"));
    }
    if !block.has_valid_merkle_root() {
        return Err(invalid("bad-txnmrklroot"));
    }
    Ok(())
}

fn add_outputs(utxos: &mut UtxoSet, tx: &Transaction, height: u32) {
    let txid = tx.txid();
    for (vout, output) in tx.outputs.iter().enumerate() {
        utxos.insert(
            OutPoint::new(txid, vout as u32),
            Coin {
                output: output.clone(),
                height,
                coinbase: tx.is_coinbase(),
            },
        );
    }
}

fn connect_block(utxos: &mut UtxoSet, block: &Block, height: u32) -> Result<(), Refusal> {
    let time = block.header().time;
    let mut fees: Amount = 0;
    for tx in block.transactions() {
        if !is_final(tx, height, time) {
            return Err(invalid("bad-txns-nonfinal"));
        }
        if !tx.is_coinbase() {
            let mut input_value: Amount = 0;
            for input in &tx.inputs {
                let coin = utxos
                    .remove(&input.prevout)
                    .ok_or_else(|| invalid("bad-txns-inputs-missingorspent"))?;
                if coin.coinbase && height - coin.height < COINBASE_MATURITY {
                    return Err(invalid("bad-txns-premature-spend-of-coinbase"));
                }
                input_value += coin.output.value;
            }
            if tx.total_output_value() > input_value {
                return Err(invalid("bad-txns-in-belowout"));
            }
            fees += input_value - tx.total_output_value();
        }
        add_outputs(utxos, tx, height);
    }
    let claimed = block.coinbase().map(Transaction::total_output_value).unwrap_or(0);
    if claimed > block_subsidy(height) + fees {
        return Err(invalid("bad-cb-amount"));
    }
    Ok(())
}

/// Chain state, mempool and block index of the emulated node
pub struct NodeState {
    genesis: ChainTip,
    entries: HashMap<Hash256, Entry>,
    /// Active chain by height, genesis first
    active: Vec<Hash256>,
    utxos: UtxoSet,
    mempool: Vec<Transaction>,
}

impl NodeState {
    pub fn new(genesis: ChainTip) -> Self {
        Self {
            genesis,
            entries: HashMap::new(),
            active: vec![genesis.hash],
            utxos: HashMap::new(),
            mempool: Vec::new(),
        }
    }

    pub fn tip(&self) -> ChainTip {
        let hash = self.active.last().copied().unwrap_or(self.genesis.hash);
        match self.entries.get(&hash) {
            Some(entry) => ChainTip::new(hash, entry.height, entry.block.header().time),
            None => self.genesis,
        }
    }

    pub fn mempool_txids(&self) -> Vec<Hash256> {
        self.mempool.iter().map(Transaction::txid).collect()
    }

    fn knows(&self, item: &InventoryItem) -> bool {
        match item.inv_type {
            MSG_BLOCK => item.hash == self.genesis.hash || self.entries.contains_key(&item.hash),
            MSG_TX => self.mempool.iter().any(|tx| tx.txid() == item.hash),
            _ => true,
        }
    }

    pub fn process_block(&mut self, block: Block) -> BlockVerdict {
        let hash = block.hash();
        if hash == self.genesis.hash || self.entries.contains_key(&hash) {
            return BlockVerdict::Known;
        }
        if let Err(refusal) = check_block(&block) {
            return BlockVerdict::Invalid(hash, refusal);
        }

        let parent = block.prev_blockhash();
        let parent = if parent == self.genesis.hash {
            Some((0, false))
        } else {
            self.entries.get(&parent).map(|entry| (entry.height, entry.invalid))
        };
        let Some((parent_height, parent_invalid)) = parent else {
            return BlockVerdict::Orphan;
        };
        let height = parent_height + 1;
        if parent_invalid {
            self.entries.insert(hash, Entry { block, height, invalid: true });
            return BlockVerdict::Invalid(hash, invalid("bad-prevblk"));
        }
        self.entries.insert(hash, Entry { block, height, invalid: false });

        if height <= self.tip().height {
            return BlockVerdict::SideChain;
        }
        self.activate(hash)
    }

    /// Hashes from height 1 up to `tip`
    fn branch(&self, tip: Hash256) -> Vec<Hash256> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        while let Some(entry) = self.entries.get(&cursor) {
            branch.push(cursor);
            cursor = entry.block.prev_blockhash();
        }
        branch.reverse();
        branch
    }

    fn activate(&mut self, tip: Hash256) -> BlockVerdict {
        let branch = self.branch(tip);
        let shared = branch
            .iter()
            .zip(self.active.iter().skip(1))
            .take_while(|(a, b)| a == b)
            .count();
        let extends_tip = shared + 1 == self.active.len();

        // Extending the tip connects on top of the current set; a reorg replays
        // the new branch from genesis.
        let (mut utxos, start) = if extends_tip {
            (self.utxos.clone(), shared)
        } else {
            (UtxoSet::new(), 0)
        };
        for (index, hash) in branch.iter().enumerate().skip(start) {
            let Some(entry) = self.entries.get(hash) else {
                return BlockVerdict::Orphan;
            };
            if let Err(refusal) = connect_block(&mut utxos, &entry.block, index as u32 + 1) {
                for bad in &branch[index..] {
                    if let Some(entry) = self.entries.get_mut(bad) {
                        entry.invalid = true;
                    }
                }
                return BlockVerdict::Invalid(*hash, refusal);
            }
        }

        let resurrected: Vec<Transaction> = self.active[shared + 1..]
            .iter()
            .filter_map(|hash| self.entries.get(hash))
            .flat_map(|entry| entry.block.transactions().iter().skip(1).cloned())
            .collect();

        self.active.truncate(1);
        self.active.extend(branch);
        self.utxos = utxos;

        let previous = std::mem::take(&mut self.mempool);
        for tx in resurrected.into_iter().chain(previous) {
            let _ = self.accept_to_mempool(tx);
        }
        BlockVerdict::NewTip
    }

    pub fn accept_to_mempool(&mut self, tx: Transaction) -> TxVerdict {
        if tx.is_coinbase() {
            return TxVerdict::Refused(invalid("bad-tx-coinbase"));
        }
        let txid = tx.txid();
        if self.mempool.iter().any(|m| m.txid() == txid) {
            return TxVerdict::Refused(duplicate("txn-already-in-mempool"));
        }
        if (0..tx.outputs.len() as u32).any(|vout| self.utxos.contains_key(&OutPoint::new(txid, vout))) {
            return TxVerdict::Refused(duplicate("txn-already-known"));
        }

        let tip = self.tip();
        let height = tip.height + 1;
        if !is_final(&tx, height, tip.time) {
            return TxVerdict::Refused(invalid("bad-txns-nonfinal"));
        }

        let mut input_value: Amount = 0;
        for input in &tx.inputs {
            let conflict = self
                .mempool
                .iter()
                .any(|m| m.inputs.iter().any(|i| i.prevout == input.prevout));
            if conflict {
                return TxVerdict::Refused(duplicate("txn-mempool-conflict"));
            }
            let coin = self.utxos.get(&input.prevout).cloned().or_else(|| {
                self.mempool
                    .iter()
                    .find(|m| m.txid() == input.prevout.txid)
                    .and_then(|m| m.outputs.get(input.prevout.vout as usize))
                    .map(|output| Coin {
                        output: output.clone(),
                        height,
                        coinbase: false,
                    })
            });
            let Some(coin) = coin else {
                return TxVerdict::Orphan;
            };
            if coin.coinbase && height - coin.height < COINBASE_MATURITY {
                return TxVerdict::Refused(invalid("bad-txns-premature-spend-of-coinbase"));
            }
            input_value += coin.output.value;
        }
        if tx.total_output_value() > input_value {
            return TxVerdict::Refused(invalid("bad-txns-in-belowout"));
        }
        self.mempool.push(tx);
        TxVerdict::Accepted
    }

    pub fn utxo_info(&self) -> UtxoSetInfo {
        let mut coins: Vec<(&OutPoint, &Coin)> = self.utxos.iter().collect();
        coins.sort_by_key(|(outpoint, _)| **outpoint);

        let mut data = Vec::new();
        for (outpoint, coin) in &coins {
            data.extend(serialize(*outpoint));
            data.extend(coin.height.to_le_bytes());
            data.extend(serialize(&coin.output));
        }
        let txids: HashSet<Hash256> = coins.iter().map(|(outpoint, _)| outpoint.txid).collect();
        let total: Amount = coins.iter().map(|(_, coin)| coin.output.value).sum();
        let tip = self.tip();
        UtxoSetInfo {
            height: u64::from(tip.height),
            bestblock: tip.hash.to_string(),
            transactions: txids.len() as u64,
            txouts: coins.len() as u64,
            hash_serialized: sha256d(&data).to_string(),
            total_amount: total as f64 / COIN as f64,
        }
    }
}

pub type SharedState = Arc<Mutex<NodeState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, NodeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject(message: &str, refusal: &Refusal, hash: Hash256) -> ProtocolMessage {
    ProtocolMessage::Reject(RejectMessage {
        message: message.to_string(),
        code: refusal.code,
        reason: refusal.reason.to_string(),
        data: Some(hash),
    })
}

/// Node side of a P2P connection
struct NodeHandler {
    state: SharedState,
}

impl PeerHandler for NodeHandler {
    fn on_message(&mut self, outbox: &mut Outbox, message: &ProtocolMessage) {
        let mut state = lock(&self.state);
        match message {
            ProtocolMessage::Block(block) => {
                if let BlockVerdict::Invalid(hash, refusal) = state.process_block(block.clone()) {
                    outbox.push(reject("block", &refusal, hash));
                }
            }
            ProtocolMessage::Tx(tx) => {
                if let TxVerdict::Refused(refusal) = state.accept_to_mempool(tx.clone()) {
                    outbox.push(reject("tx", &refusal, tx.txid()));
                }
            }
            ProtocolMessage::Inv(items) => {
                let wanted: Vec<InventoryItem> =
                    items.iter().filter(|item| !state.knows(item)).copied().collect();
                if !wanted.is_empty() {
                    outbox.push(ProtocolMessage::GetData(wanted));
                }
            }
            _ => {}
        }
    }
}

/// RPC view of an emulated node
#[derive(Clone)]
pub struct EmulatedRpc {
    state: SharedState,
}

#[async_trait]
impl NodeRpc for EmulatedRpc {
    async fn best_block_hash(&self) -> RpcResult<Hash256> {
        Ok(lock(&self.state).tip().hash)
    }

    async fn block_count(&self) -> RpcResult<u64> {
        Ok(u64::from(lock(&self.state).tip().height))
    }

    async fn block_txids(&self, hash: &Hash256) -> RpcResult<Vec<Hash256>> {
        lock(&self.state)
            .entries
            .get(hash)
            .map(|entry| entry.block.txids())
            .ok_or_else(|| RpcError::server(-5, "Block not found"))
    }

    async fn raw_mempool(&self) -> RpcResult<Vec<Hash256>> {
        Ok(lock(&self.state).mempool_txids())
    }

    async fn utxo_set_info(&self) -> RpcResult<UtxoSetInfo> {
        Ok(lock(&self.state).utxo_info())
    }

    async fn submit_block(&self, block: &Block) -> RpcResult<Option<String>> {
        Ok(match lock(&self.state).process_block(block.clone()) {
            BlockVerdict::NewTip => None,
            BlockVerdict::Known => Some("duplicate".to_string()),
            BlockVerdict::SideChain | BlockVerdict::Orphan => Some("inconclusive".to_string()),
            BlockVerdict::Invalid(_, refusal) => Some(refusal.reason.to_string()),
        })
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Hash256> {
        match lock(&self.state).accept_to_mempool(tx.clone()) {
            TxVerdict::Accepted => Ok(tx.txid()),
            TxVerdict::Orphan => Err(RpcError::server(-25, "Missing inputs")),
            TxVerdict::Refused(refusal) if refusal.reason == "txn-already-known" => {
                Err(RpcError::server(-27, "transaction already in block chain"))
            }
            TxVerdict::Refused(refusal) => Err(RpcError::server(
                -26,
                format!("{}: {}", refusal.code.to_u8(), refusal.reason),
            )),
        }
    }
}

/// In-process node listening on a loopback port
pub struct EmulatedNode {
    scheduler: NetworkScheduler,
    addr: SocketAddr,
    state: SharedState,
}

impl EmulatedNode {
    pub async fn start() -> Result<Self> {
        let state: SharedState = Arc::new(Mutex::new(NodeState::new(ChainTip::regtest_genesis())));
        let scheduler = NetworkScheduler::new(SchedulerConfig::default());
        let handler_state = Arc::clone(&state);
        let addr = scheduler
            .listen("127.0.0.1:0".parse()?, move |_| NodeHandler {
                state: Arc::clone(&handler_state),
            })
            .await?;
        Ok(Self {
            scheduler,
            addr,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn rpc(&self) -> EmulatedRpc {
        EmulatedRpc {
            state: Arc::clone(&self.state),
        }
    }

    pub fn tip(&self) -> ChainTip {
        lock(&self.state).tip()
    }

    pub fn mempool(&self) -> Vec<Hash256> {
        lock(&self.state).mempool_txids()
    }

    pub fn utxo_info(&self) -> UtxoSetInfo {
        lock(&self.state).utxo_info()
    }

    pub async fn stop(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Sequencer settings sized for loopback tests
pub fn fast_config(delivery: DeliveryMode) -> SequencerConfig {
    SequencerConfig {
        sync_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        settle_timeout: Duration::from_secs(2),
        compare_utxo_digest: true,
        delivery,
    }
}

/// Driver connected to every node in `nodes`
pub async fn manager_for(
    nodes: &[&EmulatedNode],
    config: SequencerConfig,
) -> Result<TestManager<EmulatedRpc>> {
    let scheduler = NetworkScheduler::new(SchedulerConfig::default());
    let mut manager = TestManager::new(scheduler, config);
    for (index, node) in nodes.iter().enumerate() {
        if manager.config().delivery == DeliveryMode::Rpc {
            manager.add_rpc_node(format!("node{}", index), node.rpc());
        } else {
            manager
                .add_node(format!("node{}", index), node.addr(), node.rpc())
                .await?;
        }
    }
    Ok(manager)
}

fn version_message() -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: 0,
        timestamp: 0,
        addr_recv: NetworkAddress::unspecified(),
        addr_from: NetworkAddress::unspecified(),
        nonce: 7,
        user_agent: "/silent:0.1/".to_string(),
        start_height: 0,
        relay: false,
    }
}

/// Stream to a peer that completes the handshake and then ignores everything
pub fn silent_peer() -> DuplexStream {
    let (local, remote) = tokio::io::duplex(1 << 16);
    tokio::spawn(async move {
        let mut framed = Framed::new(remote, MessageCodec::new(NetworkMagic::REGTEST));
        while let Some(Ok(Ok(message))) = framed.next().await {
            if let ProtocolMessage::Version(_) = message {
                if framed.send(ProtocolMessage::Version(version_message())).await.is_err()
                    || framed.send(ProtocolMessage::Verack).await.is_err()
                {
                    break;
                }
            }
        }
    });
    local
}
