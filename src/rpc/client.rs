//! JSON-RPC client
//!
//! JSON-RPC 1.0 over HTTP POST with basic auth, the dialect Bitcoin-family
//! nodes speak. Error bodies arrive with non-2xx statuses, so the body is
//! parsed before the status is looked at.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::chain::{Block, Hash256, Transaction};
use crate::config::RpcConfig;
use crate::network::encoding::serialize;
use crate::rpc::errors::{RpcError, RpcResult};
use crate::rpc::types::{BlockSummary, RpcRequest, RpcResponse, UtxoSetInfo};
use crate::rpc::NodeRpc;

/// HTTP JSON-RPC client for one node
pub struct JsonRpcClient {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(config: &RpcConfig) -> RpcResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and decode its result
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("RPC -> {} #{}", method, id);

        let mut request = self
            .client
            .post(&self.url)
            .json(&RpcRequest::new(id, method, params));
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let envelope: RpcResponse = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if !status.is_success() => {
                warn!("RPC {} failed with HTTP {}", method, status);
                return Err(RpcError::Transport(format!("HTTP {}: {}", status, e)));
            }
            Err(e) => return Err(RpcError::InvalidResponse(e.to_string())),
        };

        if let Some(error) = envelope.error {
            debug!("RPC <- {} #{} error {}: {}", method, id, error.code, error.message);
            return Err(RpcError::server(error.code, error.message));
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", method, e)))
    }
}

fn parse_hash(s: &str) -> RpcResult<Hash256> {
    s.parse()
        .map_err(|_| RpcError::InvalidResponse(format!("bad hash '{}'", s)))
}

#[async_trait]
impl NodeRpc for JsonRpcClient {
    async fn best_block_hash(&self) -> RpcResult<Hash256> {
        let hash: String = self.call("getbestblockhash", json!([])).await?;
        parse_hash(&hash)
    }

    async fn block_count(&self) -> RpcResult<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_txids(&self, hash: &Hash256) -> RpcResult<Vec<Hash256>> {
        let block: BlockSummary = self.call("getblock", json!([hash.to_string(), 1])).await?;
        block.tx.iter().map(|t| parse_hash(t)).collect()
    }

    async fn raw_mempool(&self) -> RpcResult<Vec<Hash256>> {
        let txids: Vec<String> = self.call("getrawmempool", json!([])).await?;
        txids.iter().map(|t| parse_hash(t)).collect()
    }

    async fn utxo_set_info(&self) -> RpcResult<UtxoSetInfo> {
        self.call("gettxoutsetinfo", json!([])).await
    }

    async fn submit_block(&self, block: &Block) -> RpcResult<Option<String>> {
        let hex_block = hex::encode(serialize(block));
        self.call("submitblock", json!([hex_block])).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Hash256> {
        let hex_tx = hex::encode(serialize(tx));
        let txid: String = self.call("sendrawtransaction", json!([hex_tx])).await?;
        parse_hash(&txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors::RpcErrorCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, task)
    }

    fn config(url: String) -> RpcConfig {
        RpcConfig {
            url,
            user: Some("alice".to_string()),
            password: Some("secret".to_string()),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_call_success_sends_auth() {
        let (url, server) = serve_once("200 OK", r#"{"result":42,"error":null,"id":1}"#).await;
        let client = JsonRpcClient::new(&config(url)).unwrap();
        assert_eq!(client.block_count().await.unwrap(), 42);

        let request = server.await.unwrap();
        assert!(request.contains("\"method\":\"getblockcount\""));
        assert!(request.to_ascii_lowercase().contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_error_body_on_http_500() {
        let (url, _server) = serve_once(
            "500 Internal Server Error",
            r#"{"result":null,"error":{"code":-26,"message":"16: bad-txns-nonfinal"},"id":1}"#,
        )
        .await;
        let client = JsonRpcClient::new(&config(url)).unwrap();
        let err = client.raw_mempool().await.unwrap_err();
        match &err {
            RpcError::Server { code, message } => {
                assert_eq!(*code, RpcErrorCode::VerifyRejected);
                assert_eq!(message, "16: bad-txns-nonfinal");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.as_rejection().unwrap().reason, "bad-txns-nonfinal");
    }

    #[tokio::test]
    async fn test_unauthorized_is_transport_error() {
        let (url, _server) = serve_once("401 Unauthorized", "").await;
        let client = JsonRpcClient::new(&config(url)).unwrap();
        let err = client.best_block_hash().await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_submit_block_null_result() {
        let (url, _server) = serve_once("200 OK", r#"{"result":null,"error":null,"id":1}"#).await;
        let client = JsonRpcClient::new(&config(url)).unwrap();
        let block = crate::chain::build_block(Hash256::ZERO, vec![crate::chain::create_coinbase(1, 50)], 0);
        assert_eq!(client.submit_block(&block).await.unwrap(), None);
    }
}
