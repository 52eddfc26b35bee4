//! RPC types
//!
//! JSON-RPC 1.0 envelopes and the response shapes of the introspection
//! calls the harness consumes.

use serde::{Deserialize, Serialize};

use crate::chain::Hash256;

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "1.0",
            id,
            method,
            params,
        }
    }
}

/// Error object inside a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
}

/// JSON-RPC response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// `getblock <hash> 1` response (only the fields the harness reads)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    pub tx: Vec<String>,
}

/// `gettxoutsetinfo` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtxoSetInfo {
    pub height: u64,
    pub bestblock: String,
    #[serde(default)]
    pub transactions: u64,
    #[serde(default)]
    pub txouts: u64,
    /// Serialized-set digest; newer nodes name it `hash_serialized_2`
    #[serde(alias = "hash_serialized_2")]
    pub hash_serialized: String,
    #[serde(default)]
    pub total_amount: f64,
}

impl UtxoSetInfo {
    /// Identity used for cross-node comparison: tip plus set digest
    pub fn digest(&self) -> (String, String) {
        (self.bestblock.clone(), self.hash_serialized.clone())
    }

    pub fn best_block(&self) -> Option<Hash256> {
        self.bestblock.parse().ok()
    }
}
