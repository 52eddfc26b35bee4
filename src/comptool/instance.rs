//! Test instances: payloads paired with the outcome the node should produce

use regex::Regex;
use std::fmt;

use crate::chain::{Block, Hash256, Transaction};
use crate::error::{HarnessError, Result};
use crate::network::protocol::{InventoryItem, ProtocolMessage, RejectCode};

/// Something delivered to the node
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Block(Block),
    Tx(Transaction),
}

impl Payload {
    /// Block hash or txid
    pub fn hash(&self) -> Hash256 {
        match self {
            Payload::Block(block) => block.hash(),
            Payload::Tx(tx) => tx.txid(),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Payload::Block(_))
    }

    pub fn inventory(&self) -> InventoryItem {
        match self {
            Payload::Block(block) => InventoryItem::block(block.hash()),
            Payload::Tx(tx) => InventoryItem::tx(tx.txid()),
        }
    }

    pub fn to_message(&self) -> ProtocolMessage {
        match self {
            Payload::Block(block) => ProtocolMessage::Block(block.clone()),
            Payload::Tx(tx) => ProtocolMessage::Tx(tx.clone()),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Block(block) => write!(f, "block {}", block.hash()),
            Payload::Tx(tx) => write!(f, "tx {}", tx.txid()),
        }
    }
}

impl From<Block> for Payload {
    fn from(block: Block) -> Self {
        Payload::Block(block)
    }
}

impl From<Transaction> for Payload {
    fn from(tx: Transaction) -> Self {
        Payload::Tx(tx)
    }
}

/// How an observed reject reason is compared with the expected one
#[derive(Debug, Clone)]
pub enum ReasonMatch {
    Exact(String),
    /// Observed reason starts with the pattern
    Prefix(String),
    Substring(String),
    Regex(Regex),
}

impl ReasonMatch {
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(ReasonMatch::Regex)
            .map_err(|e| HarnessError::Usage(format!("bad reason pattern '{}': {}", pattern, e)))
    }

    pub fn matches(&self, reason: &str) -> bool {
        match self {
            ReasonMatch::Exact(expected) => reason == expected,
            ReasonMatch::Prefix(prefix) => reason.starts_with(prefix.as_str()),
            ReasonMatch::Substring(needle) => reason.contains(needle.as_str()),
            ReasonMatch::Regex(re) => re.is_match(reason),
        }
    }
}

impl From<&str> for ReasonMatch {
    fn from(prefix: &str) -> Self {
        ReasonMatch::Prefix(prefix.to_string())
    }
}

impl fmt::Display for ReasonMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonMatch::Exact(s) => write!(f, "'{}' (exact)", s),
            ReasonMatch::Prefix(s) => write!(f, "'{}' (prefix)", s),
            ReasonMatch::Substring(s) => write!(f, "'{}' (substring)", s),
            ReasonMatch::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// What the node is expected to do with a payload
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Block becomes the tip; tx enters the mempool
    Accepted,
    /// Payload is absent from the node's state; no reason is checked
    NotAccepted,
    /// Refused with a matching reject category and reason
    Rejected { code: RejectCode, reason: ReasonMatch },
    /// All nodes end up with identical state
    CrossNodeEquality,
}

impl Outcome {
    /// Rejection matched by reason prefix
    pub fn rejected(code: RejectCode, reason: impl Into<String>) -> Self {
        Outcome::Rejected {
            code,
            reason: ReasonMatch::Prefix(reason.into()),
        }
    }

    pub fn rejected_with(code: RejectCode, reason: ReasonMatch) -> Self {
        Outcome::Rejected { code, reason }
    }
}

impl From<bool> for Outcome {
    fn from(accepted: bool) -> Self {
        if accepted {
            Outcome::Accepted
        } else {
            Outcome::NotAccepted
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Accepted => f.write_str("accepted"),
            Outcome::NotAccepted => f.write_str("not accepted"),
            Outcome::Rejected { code, reason } => write!(f, "rejected {} {}", code, reason),
            Outcome::CrossNodeEquality => f.write_str("identical state on every node"),
        }
    }
}

/// Ordered payloads with expected outcomes, consumed by one sequencer run
#[derive(Debug, Clone)]
pub struct TestInstance {
    entries: Vec<(Payload, Outcome)>,
    sync_every_payload: bool,
}

impl Default for TestInstance {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TestInstance {
    pub fn new(sync_every_payload: bool) -> Self {
        Self {
            entries: Vec::new(),
            sync_every_payload,
        }
    }

    /// One payload, synchronized
    pub fn single(payload: impl Into<Payload>, outcome: impl Into<Outcome>) -> Self {
        let mut instance = Self::new(true);
        instance.push(payload, outcome);
        instance
    }

    pub fn push(&mut self, payload: impl Into<Payload>, outcome: impl Into<Outcome>) -> &mut Self {
        self.entries.push((payload.into(), outcome.into()));
        self
    }

    pub fn with(mut self, payload: impl Into<Payload>, outcome: impl Into<Outcome>) -> Self {
        self.push(payload, outcome);
        self
    }

    pub fn sync_every_payload(&self) -> bool {
        self.sync_every_payload
    }

    pub fn entries(&self) -> &[(Payload, Outcome)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(Payload, Outcome)> {
        self.entries
    }
}
