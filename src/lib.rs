// src/lib.rs
// Off-chain voting node: chain sync, census building, vote admission, result proving

pub mod admission;
pub mod aggregator;
pub mod api;
pub mod census;
pub mod config;
pub mod crypto;
pub mod eth;
pub mod locks;
pub mod prover;
pub mod storage;
pub mod types;

use crate::admission::VoteAdmission;
use crate::aggregator::{AggregatorConfig, ResultsAggregator};
use crate::census::CensusEngine;
use crate::config::NodeConfig;
use crate::eth::rpc::EthRpcLedger;
use crate::eth::{ChainSynchronizer, SyncError};
use crate::prover::{HttpProver, ProverGateway};
use crate::storage::{MemoryStore, ProcessStore, RocksStore};
use crate::types::ChainId;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the voting node
    Start {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// RocksDB directory (overrides storage.data_dir)
        #[arg(long)]
        data_dir: Option<String>,
        /// Ethereum JSON-RPC endpoint
        #[arg(long)]
        eth_url: Option<String>,
        /// Voting contract address
        #[arg(long)]
        contract: Option<String>,
        /// First block to sync on a fresh store
        #[arg(long)]
        start_block: Option<u64>,
        #[arg(long)]
        api_addr: Option<String>,
        #[arg(long)]
        prover_url: Option<String>,
        /// Serve census and vote APIs without following the chain
        #[arg(long)]
        no_sync: bool,
    },
    /// Validates the configuration and exits
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Core components shared by the API and the background tasks.
#[derive(Clone)]
pub struct Node {
    pub chain_id: ChainId,
    pub store: Arc<dyn ProcessStore>,
    pub census: Arc<CensusEngine>,
    pub aggregator: Arc<ResultsAggregator>,
    pub admission: Arc<VoteAdmission>,
}

impl Node {
    /// Wire the components over `store`, restoring censuses and tallies.
    pub fn assemble(
        chain_id: ChainId,
        store: Arc<dyn ProcessStore>,
        prover: Arc<dyn ProverGateway>,
        aggregator_config: AggregatorConfig,
    ) -> Result<Self> {
        let census = Arc::new(CensusEngine::load(store.clone()).context("load censuses")?);
        let aggregator = Arc::new(ResultsAggregator::new(
            store.clone(),
            prover,
            chain_id,
            aggregator_config,
        ));
        aggregator.rebuild().context("rebuild tallies")?;
        let admission = Arc::new(VoteAdmission::new(chain_id, store.clone(), aggregator.clone()));
        Ok(Self {
            chain_id,
            store,
            census,
            aggregator,
            admission,
        })
    }

    pub fn api_state(&self) -> api::AppState {
        api::AppState {
            census: self.census.clone(),
            admission: self.admission.clone(),
            aggregator: self.aggregator.clone(),
            store: self.store.clone(),
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => {
            let mut cfg = NodeConfig::load(config.as_deref())?;
            cfg.apply_env()?;
            let validation = cfg.validate();
            validation.print_summary();
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            if !validation.valid {
                bail!("configuration has {} error(s)", validation.errors.len());
            }
            Ok(())
        }
        Commands::Start {
            config,
            data_dir,
            eth_url,
            contract,
            start_block,
            api_addr,
            prover_url,
            no_sync,
        } => {
            let mut cfg = NodeConfig::load(config.as_deref())?;
            cfg.apply_env()?;
            if let Some(v) = data_dir {
                cfg.storage.data_dir = Some(v);
            }
            if let Some(v) = eth_url {
                cfg.eth.url = v;
            }
            if let Some(v) = contract {
                cfg.eth.contract = v;
            }
            if let Some(v) = start_block {
                cfg.sync.start_block = v;
            }
            if let Some(v) = api_addr {
                cfg.api.addr = v;
            }
            if let Some(v) = prover_url {
                cfg.prover.url = v;
            }
            if no_sync {
                cfg.sync.enabled = false;
            }

            let validation = cfg.validate();
            validation.print_summary();
            if !validation.valid {
                bail!("invalid configuration, see errors above");
            }
            start_node(cfg).await
        }
    }
}

async fn start_node(cfg: NodeConfig) -> Result<()> {
    let store: Arc<dyn ProcessStore> = match &cfg.storage.data_dir {
        Some(dir) => Arc::new(RocksStore::open(dir)?),
        None => {
            log::warn!("no data dir configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    // keeps the height channel open when no synchronizer owns it
    let mut idle_heights: Option<watch::Sender<u64>> = None;
    let (synchronizer, heights, chain_id) = if cfg.sync.enabled {
        let ledger = Arc::new(EthRpcLedger::new(
            cfg.eth.url.clone(),
            &cfg.eth.contract,
            Duration::from_secs(cfg.eth.request_timeout_secs),
        ));
        let sync = ChainSynchronizer::connect(ledger, store.clone(), cfg.sync_config(), &cancel).await?;
        let heights = sync.subscribe();
        let chain_id = sync.chain_id();
        (Some(Arc::new(sync)), heights, chain_id)
    } else {
        let chain_id = match (store.last_sync_block()?, cfg.eth.chain_id) {
            (Some(cursor), _) => cursor.chain_id,
            (None, Some(id)) => {
                store.init_meta(id, cfg.sync.start_block)?;
                id
            }
            (None, None) => bail!("sync disabled on a fresh store: set eth.chain_id"),
        };
        let height = store
            .last_sync_block()?
            .map(|c| c.last_synced_block)
            .unwrap_or_default();
        let (tx, rx) = watch::channel(height);
        idle_heights = Some(tx);
        (None, rx, chain_id)
    };

    let prover = Arc::new(HttpProver::new(
        cfg.prover.url.clone(),
        Duration::from_secs(cfg.prover.timeout_secs),
    ));
    let node = Node::assemble(chain_id, store, prover, cfg.aggregator_config())?;
    let aggregator_task = node.aggregator.clone().start(heights, cancel.clone());

    let sync_task = synchronizer.map(|sync| {
        let cancel = cancel.clone();
        let handle = sync.start(cancel.clone());
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(SyncError::Ledger(eth::LedgerError::Unavailable(format!(
                    "sync task panicked: {}",
                    e
                )))),
            };
            if result.is_err() {
                // sync failures are fatal for the node
                cancel.cancel();
            }
            result
        })
    });

    let addr: SocketAddr = cfg
        .api
        .addr
        .parse()
        .map_err(|e| anyhow!("api.addr {}: {}", cfg.api.addr, e))?;
    log::info!("API listening on http://{} (chain {})", addr, chain_id);
    let shutdown = cancel.clone();
    axum::Server::bind(&addr)
        .serve(api::router(node.api_state()).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server")?;

    cancel.cancel();
    let _ = aggregator_task.await;
    drop(idle_heights);
    if let Some(task) = sync_task {
        task.await.context("join synchronizer")??;
    }
    log::info!("node stopped");
    Ok(())
}
