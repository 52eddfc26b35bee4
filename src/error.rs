//! Harness error taxonomy
//!
//! Protocol decode errors, synchronization failures and usage errors all abort
//! a comparison run. Consensus-level rejections are never errors: they are
//! recorded as data and compared against expectations by the sequencer.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::chain::Hash256;
use crate::network::error::DecodeError;
use crate::network::peer::{HandshakeState, PeerId};
use crate::rpc::errors::RpcError;

/// Top-level harness error
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Malformed bytes on the wire
    #[error("protocol decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Application message sent before the handshake completed
    #[error("{peer} is not ready to send '{command}' (state: {state:?})")]
    NotReady {
        peer: PeerId,
        command: String,
        state: HandshakeState,
    },

    /// Bounded send queue is full
    #[error("send queue for {0} is full")]
    QueueFull(PeerId),

    /// Connection went away while the harness still needed it
    #[error("{peer} disconnected: {reason}")]
    Disconnected { peer: PeerId, reason: String },

    /// The node did not reach the expected state in time
    #[error(
        "timed out after {waited:?} waiting for {what}: expected {expected}, last observed {last_observed}"
    )]
    SyncTimeout {
        what: String,
        expected: String,
        last_observed: String,
        waited: Duration,
    },

    /// Observed outcome differs from the expected one
    #[error("{0}")]
    Mismatch(Box<MismatchReport>),

    /// JSON-RPC collaborator failed
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Run cancelled by scheduler shutdown or its cancel token
    #[error("comparison run cancelled")]
    Cancelled,

    /// Bounded proof-of-work search ran out of attempts
    #[error("proof-of-work search exhausted after {attempts} attempts for block {block}")]
    PowExhausted { attempts: u64, block: Hash256 },

    /// Spending an output that does not exist
    #[error("transaction {txid} has {outputs} outputs, cannot spend index {index}")]
    OutputIndexOutOfRange {
        txid: Hash256,
        index: u32,
        outputs: usize,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Programmer error in harness usage
    #[error("usage error: {0}")]
    Usage(String),
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Diagnostic produced on the first outcome mismatch
///
/// Carries enough context to reproduce: which instance and payload, which
/// node, and the expected versus the observed outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchReport {
    pub instance: usize,
    pub payload_index: usize,
    pub payload: String,
    pub node: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance {} payload {} ({}) on {}: expected {}, got {}",
            self.instance, self.payload_index, self.payload, self.node, self.expected, self.actual
        )
    }
}

impl HarnessError {
    /// Build a mismatch error
    pub fn mismatch(report: MismatchReport) -> Self {
        Self::Mismatch(Box::new(report))
    }

    /// Mismatch details, if this is an outcome mismatch
    pub fn mismatch_report(&self) -> Option<&MismatchReport> {
        match self {
            Self::Mismatch(report) => Some(report),
            _ => None,
        }
    }
}
