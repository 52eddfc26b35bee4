//! RPC collaborator interface
//!
//! The sequencer only needs a handful of introspection and submission calls
//! from the node under test. [`NodeRpc`] is that surface; [`JsonRpcClient`]
//! implements it over HTTP.

pub mod client;
pub mod errors;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;

use crate::chain::{Block, Hash256, Transaction};

pub use client::JsonRpcClient;
pub use errors::{RpcError, RpcErrorCode, RpcRejection, RpcResult};
pub use types::UtxoSetInfo;

/// Chain introspection and submission calls against one node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// `getbestblockhash`
    async fn best_block_hash(&self) -> RpcResult<Hash256>;

    /// `getblockcount`
    async fn block_count(&self) -> RpcResult<u64>;

    /// `getblock <hash> 1`, reduced to its txids
    async fn block_txids(&self, hash: &Hash256) -> RpcResult<Vec<Hash256>>;

    /// `getrawmempool`
    async fn raw_mempool(&self) -> RpcResult<Vec<Hash256>>;

    /// `gettxoutsetinfo`
    async fn utxo_set_info(&self) -> RpcResult<UtxoSetInfo>;

    /// `submitblock`; `Some(reason)` when the node did not accept the block
    async fn submit_block(&self, block: &Block) -> RpcResult<Option<String>>;

    /// `sendrawtransaction`
    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Hash256>;
}

#[async_trait]
impl<T: NodeRpc + ?Sized> NodeRpc for Arc<T> {
    async fn best_block_hash(&self) -> RpcResult<Hash256> {
        (**self).best_block_hash().await
    }

    async fn block_count(&self) -> RpcResult<u64> {
        (**self).block_count().await
    }

    async fn block_txids(&self, hash: &Hash256) -> RpcResult<Vec<Hash256>> {
        (**self).block_txids(hash).await
    }

    async fn raw_mempool(&self) -> RpcResult<Vec<Hash256>> {
        (**self).raw_mempool().await
    }

    async fn utxo_set_info(&self) -> RpcResult<UtxoSetInfo> {
        (**self).utxo_set_info().await
    }

    async fn submit_block(&self, block: &Block) -> RpcResult<Option<String>> {
        (**self).submit_block(block).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Hash256> {
        (**self).send_raw_transaction(tx).await
    }
}
