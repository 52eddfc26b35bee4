//! Run a built-in comparison scenario against a live node
//!
//! Connects to the node's P2P port and JSON-RPC endpoint, builds the
//! scenario on top of the node's current tip and feeds it through the
//! comparison driver. Exits non-zero on the first mismatch.
//!
//! Usage:
//!   run-scenario reorg --connect 127.0.0.1:18444 --rpc-url http://127.0.0.1:18443 \
//!       --rpc-user user --rpc-password pass

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

use bllvm_harness::chain::{ChainBuilder, ChainTip};
use bllvm_harness::comptool::{DeliveryMode, TestInstance, TestManager};
use bllvm_harness::config::{HarnessConfig, RpcConfig};
use bllvm_harness::network::NetworkScheduler;
use bllvm_harness::rpc::{JsonRpcClient, NodeRpc};
use bllvm_harness::scenarios::{self, FORK_CHAIN_LEN};
use bllvm_harness::utils::{cancel_on_signal, current_block_time, init_logging_from_config};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// Competing forks; the longer one wins and evicts the loser's spend
    Reorg,
    /// Loose transactions refused for coinbase, lock time and script reasons
    InvalidTx,
    /// Coinbase spent one block early, then on time
    CoinbaseMaturity,
    /// Block listing the same transaction twice
    DuplicateTx,
    /// Reorg across blocks full of chained transactions
    ForkUndo,
}

impl Scenario {
    fn name(self) -> &'static str {
        match self {
            Scenario::Reorg => "reorg",
            Scenario::InvalidTx => "invalid-tx",
            Scenario::CoinbaseMaturity => "coinbase-maturity",
            Scenario::DuplicateTx => "duplicate-tx",
            Scenario::ForkUndo => "fork-undo",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "run-scenario", version, about = "Run a comparison scenario against a live node")]
struct Args {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: Scenario,

    /// Node P2P address
    #[arg(long, default_value = "127.0.0.1:18444")]
    connect: SocketAddr,

    /// Harness config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node JSON-RPC URL (overrides the config file)
    #[arg(long)]
    rpc_url: Option<String>,

    #[arg(long)]
    rpc_user: Option<String>,

    #[arg(long)]
    rpc_password: Option<String>,

    /// direct, announce or rpc (overrides the config file)
    #[arg(long)]
    delivery: Option<DeliveryMode>,

    /// Transactions chained per block in fork-undo
    #[arg(long, default_value_t = FORK_CHAIN_LEN)]
    chain_len: usize,
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(url) = &args.rpc_url {
        let rpc = config.rpc.get_or_insert_with(|| RpcConfig {
            url: String::new(),
            user: None,
            password: None,
            timeout_seconds: 30,
        });
        rpc.url = url.clone();
    }
    if let Some(rpc) = config.rpc.as_mut() {
        if args.rpc_user.is_some() {
            rpc.user = args.rpc_user.clone();
        }
        if args.rpc_password.is_some() {
            rpc.password = args.rpc_password.clone();
        }
    }
    if let Some(delivery) = args.delivery {
        config.delivery = delivery;
    }
    config.validate()?;
    Ok(config)
}

fn build(scenario: Scenario, builder: &mut ChainBuilder, chain_len: usize) -> Result<Vec<TestInstance>> {
    let start = builder.tip().height;
    Ok(match scenario {
        Scenario::Reorg => scenarios::reorg(builder)?,
        Scenario::InvalidTx => {
            let mut instances = scenarios::invalid_tx(builder)?;
            // The first coinbase funds the loose spends; the second is
            // mature by now and funds the script checks.
            let funding = builder
                .coinbase_at(start + 2)
                .cloned()
                .ok_or_else(|| anyhow!("no coinbase at height {}", start + 2))?;
            instances.extend(scenarios::script_rejections(&funding)?);
            instances
        }
        Scenario::CoinbaseMaturity => scenarios::coinbase_maturity(builder)?,
        Scenario::DuplicateTx => scenarios::duplicate_tx_block(builder)?,
        Scenario::ForkUndo => scenarios::fork_undo(builder, chain_len)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging_from_config(Some(&config.logging));

    let rpc_config = config
        .rpc
        .clone()
        .ok_or_else(|| anyhow!("an RPC endpoint is required (--rpc-url or [rpc] in the config)"))?;
    let rpc = JsonRpcClient::new(&rpc_config)?;

    let tip_hash = rpc
        .best_block_hash()
        .await
        .with_context(|| format!("querying {}", rpc.url()))?;
    let height = u32::try_from(rpc.block_count().await?)?;
    let tip = ChainTip::new(tip_hash, height, current_block_time());
    info!("Building {} on {} (height {})", args.scenario.name(), tip.hash, tip.height);

    let mut builder = ChainBuilder::new(tip).with_max_pow_attempts(config.pow.max_attempts);
    let instances = build(args.scenario, &mut builder, args.chain_len)?;

    let scheduler = NetworkScheduler::new(config.scheduler_config()?);
    let mut manager = TestManager::new(scheduler.clone(), config.sequencer_config());
    cancel_on_signal(manager.cancel_token());
    if config.delivery == DeliveryMode::Rpc {
        manager.add_rpc_node("node", rpc);
    } else {
        manager.add_node("node", args.connect, rpc).await?;
    }

    let result = manager.run(instances).await;
    scheduler.shutdown().await;

    match result {
        Ok(report) => {
            println!("{}: {}", args.scenario.name(), report);
            Ok(())
        }
        Err(e) => {
            error!("Scenario {} failed: {}", args.scenario.name(), e);
            Err(e).with_context(|| format!("scenario {} failed", args.scenario.name()))
        }
    }
}
