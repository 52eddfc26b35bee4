//! bllvm-harness - P2P comparison-test harness for Bitcoin-family nodes
//!
//! This crate drives a live node the way a peer would: it speaks the raw wire
//! protocol directly, builds synthetic blocks and transactions with valid
//! proof-of-work, feeds them to the node and checks what the node does with
//! them, down to exact reject reasons.
//!
//! ## Layers
//!
//! 1. `network` - wire codec, peer connections with handshake, scheduler
//! 2. `chain` - blocks, transactions, merkle roots, proof-of-work, forks
//! 3. `rpc` - the node introspection calls used to decide outcomes
//! 4. `comptool` - the sequencing engine comparing expected and actual outcomes
//! 5. `scenarios` - reusable test sequences built on the above
//!
//! ## Design Principles
//!
//! 1. **Black-box node**: the node under test is only reached through its
//!    P2P socket and JSON-RPC
//! 2. **No false passes**: timeouts are fatal and only a complete run succeeds
//! 3. **Rejections are data**: consensus rejections are compared, not raised

pub mod chain;
pub mod comptool;
pub mod config;
pub mod error;
pub mod network;
pub mod rpc;
pub mod scenarios;
pub mod utils;

pub use config::HarnessConfig;
pub use error::{HarnessError, MismatchReport, Result};

pub use chain::{Block, BlockHeader, ChainBuilder, ChainTip, Hash256, Transaction};
pub use comptool::{DeliveryMode, Outcome, Payload, ReasonMatch, SequenceReport, TestInstance, TestManager};
pub use network::{NetworkMagic, NetworkScheduler, PeerHandle, ProtocolMessage};
pub use rpc::{JsonRpcClient, NodeRpc};
