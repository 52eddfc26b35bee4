//! Configuration management for the harness
//!
//! Handles loading from TOML, environment overrides, validation, and
//! conversion into the runtime settings of the network and sequencer layers.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::comptool::{DeliveryMode, SequencerConfig};
use crate::error::{HarnessError, Result};
use crate::network::peer::PeerConfig;
use crate::network::protocol::{NetworkMagic, NODE_NETWORK, PROTOCOL_VERSION};
use crate::network::scheduler::SchedulerConfig;
use crate::utils::env::{env_flag, env_int, env_opt};

/// Harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub peer: PeerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub sync: SyncConfig,

    /// How payloads reach the node
    #[serde(default)]
    pub delivery: DeliveryMode,

    #[serde(default)]
    pub pow: PowConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Node JSON-RPC endpoint (optional: in-process nodes need none)
    #[serde(default)]
    pub rpc: Option<RpcConfig>,
}

/// Identity the harness advertises in its `version` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `mainnet`, `testnet`, `regtest` or 8 hex digits
    #[serde(default = "default_magic")]
    pub magic: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,

    #[serde(default = "default_services")]
    pub services: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_true")]
    pub relay: bool,

    #[serde(default)]
    pub start_height: i32,
}

fn default_true() -> bool {
    true
}

fn default_magic() -> String {
    "regtest".to_string()
}

fn default_protocol_version() -> i32 {
    PROTOCOL_VERSION
}

fn default_services() -> u64 {
    NODE_NETWORK
}

fn default_user_agent() -> String {
    concat!("/bllvm-harness:", env!("CARGO_PKG_VERSION"), "/").to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            magic: default_magic(),
            protocol_version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            user_agent: default_user_agent(),
            relay: true,
            start_height: 0,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Bounded outbound queue size per connection
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,

    /// Drop the connection on per-frame decode errors too
    #[serde(default = "default_true")]
    pub disconnect_on_decode_error: bool,
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_handshake_timeout_seconds() -> u64 {
    30
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            connect_timeout_seconds: 10,
            handshake_timeout_seconds: 30,
            disconnect_on_decode_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Time workers get to flush their queues at shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Synchronization against the node under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on any single wait; exceeding it aborts the run
    #[serde(default = "default_sync_timeout_seconds")]
    pub sync_timeout_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long an expected acceptance may take to show up over RPC
    #[serde(default = "default_settle_timeout_seconds")]
    pub settle_timeout_seconds: u64,

    /// Compare UTXO digests (not only tips) in cross-node checks
    #[serde(default = "default_true")]
    pub compare_utxo_digest: bool,
}

fn default_sync_timeout_seconds() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_settle_timeout_seconds() -> u64 {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_timeout_seconds: 60,
            poll_interval_ms: 50,
            settle_timeout_seconds: 10,
            compare_utxo_digest: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowConfig {
    /// Cap on nonce attempts per block; unbounded when absent
    #[serde(default)]
    pub max_attempts: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter such as `info` or `bllvm_harness::network=debug`; RUST_LOG wins
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default)]
    pub json_format: bool,
}

/// Node JSON-RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub url: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_rpc_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_rpc_timeout_seconds() -> u64 {
    30
}

impl HarnessConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HARNESS_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(magic) = env_opt("HARNESS_MAGIC") {
            self.network.magic = magic;
        }
        if let Some(agent) = env_opt("HARNESS_USER_AGENT") {
            self.network.user_agent = agent;
        }
        if let Some(v) = env_int("HARNESS_SEND_QUEUE_CAPACITY") {
            self.peer.send_queue_capacity = v;
        }
        if let Some(v) = env_flag("HARNESS_DISCONNECT_ON_DECODE_ERROR") {
            self.peer.disconnect_on_decode_error = v;
        }
        if let Some(v) = env_int("HARNESS_SYNC_TIMEOUT") {
            self.sync.sync_timeout_seconds = v;
        }
        if let Some(v) = env_int("HARNESS_POLL_INTERVAL_MS") {
            self.sync.poll_interval_ms = v;
        }
        if let Some(mode) = env_opt("HARNESS_DELIVERY") {
            self.delivery = mode.parse().map_err(HarnessError::Config)?;
        }
        if let Some(v) = env_int("HARNESS_POW_MAX_ATTEMPTS") {
            self.pow.max_attempts = Some(v);
        }
        if let Some(filter) = env_opt("HARNESS_LOG_FILTER") {
            self.logging.filter = Some(filter);
        }
        if let Some(v) = env_flag("HARNESS_LOG_JSON") {
            self.logging.json_format = v;
        }
        if let Some(url) = env_opt("HARNESS_RPC_URL") {
            let rpc = self.rpc.get_or_insert_with(|| RpcConfig {
                url: String::new(),
                user: None,
                password: None,
                timeout_seconds: default_rpc_timeout_seconds(),
            });
            rpc.url = url;
        }
        if let Some(rpc) = self.rpc.as_mut() {
            if let Some(user) = env_opt("HARNESS_RPC_USER") {
                rpc.user = Some(user);
            }
            if let Some(password) = env_opt("HARNESS_RPC_PASSWORD") {
                rpc.password = Some(password);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.magic()?;
        if self.peer.send_queue_capacity == 0 {
            return Err(HarnessError::Config(
                "peer.send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.sync.sync_timeout_seconds == 0 {
            return Err(HarnessError::Config(
                "sync.sync_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(HarnessError::Config(
                "sync.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.pow.max_attempts == Some(0) {
            return Err(HarnessError::Config(
                "pow.max_attempts must be greater than 0 when set".to_string(),
            ));
        }
        if let Some(rpc) = &self.rpc {
            if !rpc.url.starts_with("http://") && !rpc.url.starts_with("https://") {
                return Err(HarnessError::Config(format!(
                    "rpc.url must be an http(s) URL, got '{}'",
                    rpc.url
                )));
            }
        }
        if self.delivery == DeliveryMode::Rpc && self.rpc.is_none() {
            return Err(HarnessError::Config(
                "delivery = \"rpc\" requires an [rpc] section".to_string(),
            ));
        }
        Ok(())
    }

    pub fn magic(&self) -> Result<NetworkMagic> {
        self.network.magic.parse().map_err(HarnessError::Config)
    }

    pub fn peer_config(&self) -> Result<PeerConfig> {
        Ok(PeerConfig {
            magic: self.magic()?,
            protocol_version: self.network.protocol_version,
            services: self.network.services,
            user_agent: self.network.user_agent.clone(),
            start_height: self.network.start_height,
            relay: self.network.relay,
            send_queue_capacity: self.peer.send_queue_capacity,
            handshake_timeout: Duration::from_secs(self.peer.handshake_timeout_seconds),
            disconnect_on_decode_error: self.peer.disconnect_on_decode_error,
        })
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            peer: self.peer_config()?,
            connect_timeout: Duration::from_secs(self.peer.connect_timeout_seconds),
            shutdown_grace: Duration::from_millis(self.scheduler.shutdown_grace_ms),
        })
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            sync_timeout: Duration::from_secs(self.sync.sync_timeout_seconds),
            poll_interval: Duration::from_millis(self.sync.poll_interval_ms),
            settle_timeout: Duration::from_secs(self.sync.settle_timeout_seconds),
            compare_utxo_digest: self.sync.compare_utxo_digest,
            delivery: self.delivery,
        }
    }
}
