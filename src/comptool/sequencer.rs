//! Comparison driver
//!
//! Replays [`TestInstance`]s against one or more live nodes. Each payload is
//! delivered to every node, the driver waits until every node has processed
//! it, and the node's authoritative state (tip, mempool, rejects) is compared
//! with the expected outcome. The first mismatch aborts the run.
//!
//! Synchronization is a ping barrier: a node handles one peer's messages in
//! order, so once the pong for a ping sent after the payload arrives, the
//! payload has been processed. Acceptance can still lag behind on RPC, so
//! `Accepted` outcomes are polled for up to the settle timeout.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::comptool::handler::ComparisonHandler;
use crate::comptool::instance::{Outcome, Payload, TestInstance};
use crate::comptool::log::{lock_log, new_shared_log, RejectRecord, RejectSource, SharedLog};
use crate::error::{HarnessError, MismatchReport, Result};
use crate::network::peer::PeerHandle;
use crate::network::protocol::ProtocolMessage;
use crate::network::scheduler::NetworkScheduler;
use crate::rpc::{NodeRpc, RpcRejection};

/// How payloads reach the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Send `block` / `tx` directly
    #[default]
    Direct,
    /// Send `inv` and serve the node's `getdata`
    Announce,
    /// `submitblock` / `sendrawtransaction`
    Rpc,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(DeliveryMode::Direct),
            "announce" => Ok(DeliveryMode::Announce),
            "rpc" => Ok(DeliveryMode::Rpc),
            other => Err(format!(
                "unknown delivery mode '{}' (expected direct, announce or rpc)",
                other
            )),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryMode::Direct => "direct",
            DeliveryMode::Announce => "announce",
            DeliveryMode::Rpc => "rpc",
        })
    }
}

/// Sequencer settings
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Bound on every barrier; exceeding it is fatal
    pub sync_timeout: Duration,
    pub poll_interval: Duration,
    /// How long an `Accepted` outcome may take to show up over RPC
    pub settle_timeout: Duration,
    pub compare_utxo_digest: bool,
    pub delivery: DeliveryMode,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            settle_timeout: Duration::from_secs(10),
            compare_utxo_digest: true,
            delivery: DeliveryMode::Direct,
        }
    }
}

/// Summary of a fully successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReport {
    pub instances: usize,
    pub payloads: usize,
    pub duration: Duration,
}

impl fmt::Display for SequenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instances, {} payloads passed in {:.2?}",
            self.instances, self.payloads, self.duration
        )
    }
}

struct TestNode<R> {
    name: String,
    peer: Option<PeerHandle>,
    rpc: R,
    log: SharedLog,
}

impl<R> TestNode<R> {
    fn peer(&self) -> Result<&PeerHandle> {
        self.peer.as_ref().ok_or_else(|| {
            HarnessError::Usage(format!("node '{}' has no P2P connection", self.name))
        })
    }
}

enum Poll {
    Satisfied,
    Expired { last_observed: String },
}

/// Drives test instances against the attached nodes
pub struct TestManager<R: NodeRpc> {
    config: SequencerConfig,
    scheduler: NetworkScheduler,
    nodes: Vec<TestNode<R>>,
    cancel: CancellationToken,
}

impl<R: NodeRpc> TestManager<R> {
    /// The run is cancelled when `scheduler` starts shutting down
    pub fn new(scheduler: NetworkScheduler, config: SequencerConfig) -> Self {
        let cancel = scheduler.shutdown_token().child_token();
        Self {
            config,
            scheduler,
            nodes: Vec::new(),
            cancel,
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Cancelling this token aborts a running sequence with `Cancelled`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Observations recorded for the node at `index`
    pub fn log(&self, index: usize) -> Option<SharedLog> {
        self.nodes.get(index).map(|n| n.log.clone())
    }

    pub fn peer(&self, index: usize) -> Option<&PeerHandle> {
        self.nodes.get(index).and_then(|n| n.peer.as_ref())
    }

    /// Connect to a node's P2P port and complete the handshake
    pub async fn add_node(&mut self, name: impl Into<String>, addr: SocketAddr, rpc: R) -> Result<usize> {
        let log = new_shared_log();
        let peer = self
            .scheduler
            .connect(addr, ComparisonHandler::new(log.clone()))
            .await?;
        peer.wait_for_ready(self.config.sync_timeout).await?;
        Ok(self.push_node(name.into(), Some(peer), rpc, log))
    }

    /// Attach a node over an already-open stream
    pub async fn attach_node<S>(&mut self, name: impl Into<String>, stream: S, rpc: R) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let log = new_shared_log();
        let peer = self
            .scheduler
            .attach(stream, None, ComparisonHandler::new(log.clone()))?;
        peer.wait_for_ready(self.config.sync_timeout).await?;
        Ok(self.push_node(name.into(), Some(peer), rpc, log))
    }

    /// Add a node reachable over RPC only (for `DeliveryMode::Rpc`)
    pub fn add_rpc_node(&mut self, name: impl Into<String>, rpc: R) -> usize {
        self.push_node(name.into(), None, rpc, new_shared_log())
    }

    fn push_node(&mut self, name: String, peer: Option<PeerHandle>, rpc: R, log: SharedLog) -> usize {
        info!("Added test node '{}' ({})", name, match &peer {
            Some(p) => p.id().to_string(),
            None => "rpc only".to_string(),
        });
        self.nodes.push(TestNode { name, peer, rpc, log });
        self.nodes.len() - 1
    }

    /// Run every instance in order
    ///
    /// Succeeds only if every payload of every instance matched its outcome.
    pub async fn run<I>(&mut self, instances: I) -> Result<SequenceReport>
    where
        I: IntoIterator<Item = TestInstance>,
    {
        if self.nodes.is_empty() {
            return Err(HarnessError::Usage("no test nodes attached".to_string()));
        }
        if self.config.delivery != DeliveryMode::Rpc {
            for node in &self.nodes {
                node.peer()?;
            }
        }

        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Comparison run cancelled");
                Err(HarnessError::Cancelled)
            }
            result = self.run_instances(instances) => result,
        }
    }

    /// Close every P2P connection
    pub async fn disconnect_all(&self) {
        for node in &self.nodes {
            if let Some(peer) = &node.peer {
                peer.close().await;
            }
        }
    }

    async fn run_instances<I>(&self, instances: I) -> Result<SequenceReport>
    where
        I: IntoIterator<Item = TestInstance>,
    {
        let started = Instant::now();
        let mut report = SequenceReport {
            instances: 0,
            payloads: 0,
            duration: Duration::ZERO,
        };
        for (index, instance) in instances.into_iter().enumerate() {
            debug!(
                "Instance {}: {} payloads (sync every payload: {})",
                index,
                instance.len(),
                instance.sync_every_payload()
            );
            report.payloads += self.run_instance(index, instance).await?;
            report.instances += 1;
        }
        report.duration = started.elapsed();
        info!("Comparison run passed: {}", report);
        Ok(report)
    }

    async fn run_instance(&self, index: usize, instance: TestInstance) -> Result<usize> {
        let sync_each = instance.sync_every_payload();
        let entries = instance.into_entries();

        if sync_each {
            for (payload_index, (payload, outcome)) in entries.iter().enumerate() {
                self.deliver(payload).await?;
                self.sync_all().await?;
                self.check(index, payload_index, payload, outcome).await?;
            }
        } else {
            for (payload, _) in &entries {
                self.deliver(payload).await?;
            }
            self.sync_all().await?;

            // Only the last block says anything about the resulting tip
            let last_block = entries.iter().enumerate().rev().find(|(_, (p, _))| p.is_block());
            if let Some((payload_index, (payload, outcome))) = last_block {
                self.check(index, payload_index, payload, outcome).await?;
            }
            for (payload_index, (payload, outcome)) in entries.iter().enumerate() {
                if !payload.is_block() {
                    self.check(index, payload_index, payload, outcome).await?;
                }
            }
        }
        Ok(entries.len())
    }

    async fn deliver(&self, payload: &Payload) -> Result<()> {
        debug!("Delivering {} ({})", payload, self.config.delivery);
        for node in &self.nodes {
            lock_log(&node.log).store.add(payload);
        }

        match self.config.delivery {
            DeliveryMode::Direct => {
                for node in &self.nodes {
                    node.peer()?.send(payload.to_message()).await?;
                }
            }
            DeliveryMode::Announce => {
                for node in &self.nodes {
                    node.peer()?
                        .send(ProtocolMessage::Inv(vec![payload.inventory()]))
                        .await?;
                }
                self.settle_requests().await?;
            }
            DeliveryMode::Rpc => {
                for node in &self.nodes {
                    submit(node, payload).await?;
                }
            }
        }
        Ok(())
    }

    /// Barrier repeatedly until the nodes stop requesting data
    ///
    /// An announced block can take several round trips (getheaders, then
    /// getdata) before the node holds it.
    async fn settle_requests(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.sync_timeout;
        loop {
            let before = self.request_counts();
            self.sync_all().await?;
            let after = self.request_counts();
            if before == after {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::SyncTimeout {
                    what: "announced payload to be fetched".to_string(),
                    expected: "no further data requests".to_string(),
                    last_observed: format!("request counts {:?}", after),
                    waited: self.config.sync_timeout,
                });
            }
        }
    }

    fn request_counts(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .map(|n| lock_log(&n.log).request_count())
            .collect()
    }

    /// Ping barrier on every P2P connection, concurrently
    async fn sync_all(&self) -> Result<()> {
        try_join_all(
            self.nodes
                .iter()
                .filter_map(|node| node.peer.as_ref().map(|peer| self.ping_barrier(node, peer))),
        )
        .await?;
        Ok(())
    }

    async fn ping_barrier(&self, node: &TestNode<R>, peer: &PeerHandle) -> Result<()> {
        let nonce: u64 = rand::random();
        peer.send(ProtocolMessage::Ping(nonce)).await?;

        let log = &node.log;
        let polled = self
            .poll(self.config.sync_timeout, move || async move {
                let log = lock_log(log);
                if let Some(reason) = &log.disconnected {
                    return Err(HarnessError::Disconnected {
                        peer: peer.id(),
                        reason: reason.to_string(),
                    });
                }
                if log.has_pong(nonce) {
                    Ok(None)
                } else {
                    Ok(Some(match log.pongs.last() {
                        Some(last) => format!("last pong {:#x}", last),
                        None => "no pong yet".to_string(),
                    }))
                }
            })
            .await?;

        match polled {
            Poll::Satisfied => Ok(()),
            Poll::Expired { last_observed } => {
                error!("Node '{}' did not answer ping {:#x}", node.name, nonce);
                Err(HarnessError::SyncTimeout {
                    what: format!("node '{}' to process queued messages", node.name),
                    expected: format!("pong {:#x}", nonce),
                    last_observed,
                    waited: self.config.sync_timeout,
                })
            }
        }
    }

    /// Re-run `probe` every poll interval until it reports nothing pending
    ///
    /// `probe` yields `None` when satisfied or a description of the current
    /// state otherwise.
    async fn poll<F, Fut>(&self, timeout: Duration, mut probe: F) -> Result<Poll>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<String>>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match probe().await? {
                None => return Ok(Poll::Satisfied),
                Some(observed) if Instant::now() >= deadline => {
                    return Ok(Poll::Expired {
                        last_observed: observed,
                    })
                }
                Some(_) => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }

    async fn check(
        &self,
        index: usize,
        payload_index: usize,
        payload: &Payload,
        outcome: &Outcome,
    ) -> Result<()> {
        if let Outcome::CrossNodeEquality = outcome {
            return self.check_equality(index, payload_index, payload, outcome).await;
        }
        for node in &self.nodes {
            if let Some(actual) = self.observe_mismatch(node, payload, outcome).await? {
                return Err(self.mismatch(index, payload_index, payload, &node.name, outcome, actual));
            }
        }
        debug!("{}: {}", payload, outcome);
        Ok(())
    }

    /// `Some(actual)` when the node's state disagrees with `outcome`
    async fn observe_mismatch(
        &self,
        node: &TestNode<R>,
        payload: &Payload,
        outcome: &Outcome,
    ) -> Result<Option<String>> {
        match outcome {
            Outcome::Accepted => {
                let polled = self
                    .poll(self.config.settle_timeout, move || async move {
                        let (included, state) = inclusion(node, payload).await?;
                        Ok((!included).then_some(state))
                    })
                    .await?;
                Ok(match polled {
                    Poll::Satisfied => None,
                    Poll::Expired { last_observed } => Some(last_observed),
                })
            }
            Outcome::NotAccepted => {
                let (included, state) = inclusion(node, payload).await?;
                Ok(included.then_some(state))
            }
            Outcome::Rejected { code, reason } => {
                let (included, state) = inclusion(node, payload).await?;
                if included {
                    return Ok(Some(format!("accepted ({})", state)));
                }
                let log = lock_log(&node.log);
                Ok(match log.reject_for(&payload.hash()) {
                    None => Some(format!("not accepted but no reject recorded ({})", state)),
                    Some(record) if record.code == *code && reason.matches(&record.reason) => None,
                    Some(record) => Some(record.to_string()),
                })
            }
            Outcome::CrossNodeEquality => Ok(None),
        }
    }

    async fn check_equality(
        &self,
        index: usize,
        payload_index: usize,
        payload: &Payload,
        outcome: &Outcome,
    ) -> Result<()> {
        let nodes = &self.nodes;
        let compare_utxo = self.config.compare_utxo_digest;
        let polled = self
            .poll(self.config.settle_timeout, move || async move {
                let mut digests = Vec::with_capacity(nodes.len());
                for node in nodes {
                    digests.push((node.name.as_str(), digest(node, payload, compare_utxo).await?));
                }
                if digests.windows(2).all(|w| w[0].1 == w[1].1) {
                    return Ok(None);
                }
                Ok(Some(
                    digests
                        .iter()
                        .map(|(name, d)| format!("{}: {}", name, d))
                        .collect::<Vec<_>>()
                        .join("; "),
                ))
            })
            .await?;

        match polled {
            Poll::Satisfied => Ok(()),
            Poll::Expired { last_observed } => {
                Err(self.mismatch(index, payload_index, payload, "all nodes", outcome, last_observed))
            }
        }
    }

    fn mismatch(
        &self,
        index: usize,
        payload_index: usize,
        payload: &Payload,
        node: &str,
        expected: &Outcome,
        actual: String,
    ) -> HarnessError {
        let report = MismatchReport {
            instance: index,
            payload_index,
            payload: payload.to_string(),
            node: node.to_string(),
            expected: expected.to_string(),
            actual,
        };
        error!("Outcome mismatch: {}", report);
        HarnessError::mismatch(report)
    }
}

/// Whether the node's authoritative state includes `payload`, and that state
async fn inclusion<R: NodeRpc>(node: &TestNode<R>, payload: &Payload) -> Result<(bool, String)> {
    match payload {
        Payload::Block(block) => {
            let best = node.rpc.best_block_hash().await?;
            Ok((best == block.hash(), format!("tip is {}", best)))
        }
        Payload::Tx(tx) => {
            let mempool = node.rpc.raw_mempool().await?;
            let included = mempool.contains(&tx.txid());
            Ok((
                included,
                format!(
                    "mempool holds {} txs, payload {}",
                    mempool.len(),
                    if included { "present" } else { "absent" }
                ),
            ))
        }
    }
}

/// State compared across nodes: tip (plus UTXO digest) for blocks, mempool for txs
async fn digest<R: NodeRpc>(node: &TestNode<R>, payload: &Payload, compare_utxo: bool) -> Result<String> {
    if payload.is_block() {
        let best = node.rpc.best_block_hash().await?;
        if compare_utxo {
            let info = node.rpc.utxo_set_info().await?;
            Ok(format!("tip {} utxo {}", best, info.hash_serialized))
        } else {
            Ok(format!("tip {}", best))
        }
    } else {
        let mut mempool = node.rpc.raw_mempool().await?;
        mempool.sort();
        let txids: Vec<String> = mempool.iter().map(|h| h.to_string()).collect();
        Ok(format!("mempool [{}]", txids.join(",")))
    }
}

/// Submit over RPC, recording refusals as rejects
async fn submit<R: NodeRpc>(node: &TestNode<R>, payload: &Payload) -> Result<()> {
    let (command, result) = match payload {
        Payload::Block(block) => (
            "block",
            node.rpc
                .submit_block(block)
                .await
                .map(|r| RpcRejection::from_submit_block(r.as_deref())),
        ),
        Payload::Tx(tx) => ("tx", node.rpc.send_raw_transaction(tx).await.map(|_| None)),
    };

    let rejection = match result {
        Ok(rejection) => rejection,
        Err(e) => match e.as_rejection() {
            Some(rejection) => Some(rejection),
            None => return Err(e.into()),
        },
    };
    if let Some(rejection) = rejection {
        debug!("Node '{}' refused {}: {}", node.name, payload, rejection.reason);
        lock_log(&node.log).rejects.push(RejectRecord {
            message: command.to_string(),
            code: rejection.code,
            reason: rejection.reason,
            hash: Some(payload.hash()),
            source: RejectSource::Rpc,
        });
    }
    Ok(())
}
