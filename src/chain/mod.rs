//! Synthetic chain construction
//!
//! Consensus data types with their wire encodings, plus helpers that build
//! linked, proof-of-work solved blocks for feeding to a node under test.

pub mod block;
pub mod blocktools;
pub mod builder;
pub mod hash;
pub mod script;
pub mod transaction;

pub use block::{merkle_root, Block, BlockHeader, REGTEST_BITS};
pub use blocktools::{
    block_subsidy, build_block, create_coinbase, create_transaction, solve_bounded,
    solve_proof_of_work, COINBASE_MATURITY,
};
pub use builder::{ChainBuilder, ChainTip};
pub use hash::{sha256d, Hash256, Target};
pub use script::Script;
pub use transaction::{Amount, OutPoint, Transaction, TxIn, TxOut, COIN};
