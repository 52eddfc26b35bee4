//! Comparison tool
//!
//! Feeds blocks and transactions to live nodes and checks each node's
//! accept/reject behavior, including exact reject reasons and cross-node
//! state equality.

pub mod handler;
pub mod instance;
pub mod log;
pub mod sequencer;

pub use handler::ComparisonHandler;
pub use instance::{Outcome, Payload, ReasonMatch, TestInstance};
pub use log::{PeerLog, RejectRecord, RejectSource, SharedLog};
pub use sequencer::{DeliveryMode, SequenceReport, SequencerConfig, TestManager};
