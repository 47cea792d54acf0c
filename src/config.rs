// src/config.rs
// Node configuration: JSON file, OVOTE_* environment overrides, startup validation

use crate::aggregator::AggregatorConfig;
use crate::eth::SyncConfig;
use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub storage: StorageConfig,
    pub eth: EthConfig,
    pub sync: SyncSection,
    pub api: ApiConfig,
    pub prover: ProverConfig,
    pub aggregator: AggregatorSection,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StorageConfig {
    /// RocksDB directory; `None` keeps everything in memory
    pub data_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: Some("ovote_data".to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EthConfig {
    pub url: String,
    /// Voting contract address (hex)
    pub contract: String,
    /// Chain id to bind to when sync is disabled and the store is fresh
    pub chain_id: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for EthConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".to_string(),
            contract: String::new(),
            chain_id: None,
            request_timeout_secs: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SyncSection {
    pub enabled: bool,
    pub start_block: u64,
    pub batch_size: u64,
    pub poll_interval_secs: u64,
    pub confirmations: u64,
    pub max_backoff_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enabled: true,
            start_block: 0,
            batch_size: 2000,
            poll_interval_secs: 5,
            confirmations: 0,
            max_backoff_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProverConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9000".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AggregatorSection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub proof_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        let d = AggregatorConfig::default();
        Self {
            enabled: d.enabled,
            max_attempts: d.max_attempts,
            proof_timeout_secs: d.proof_timeout.as_secs(),
            poll_interval_secs: d.poll_interval.as_secs(),
        }
    }
}

impl NodeConfig {
    /// Load from `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let json = std::fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                let config: NodeConfig = serde_json::from_str(&json)
                    .with_context(|| format!("parse config {}", p.display()))?;
                info!("loaded configuration from {}", p.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `OVOTE_*` variables from the process environment (and `.env`).
    pub fn apply_env(&mut self) -> Result<()> {
        dotenvy::dotenv().ok();
        self.apply_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("OVOTE_DATA_DIR") {
            self.storage.data_dir = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("OVOTE_ETH_URL") {
            self.eth.url = v;
        }
        if let Some(v) = lookup("OVOTE_CONTRACT") {
            self.eth.contract = v;
        }
        if let Some(v) = lookup("OVOTE_START_BLOCK") {
            self.sync.start_block = v.parse().context("OVOTE_START_BLOCK")?;
        }
        if let Some(v) = lookup("OVOTE_CONFIRMATIONS") {
            self.sync.confirmations = v.parse().context("OVOTE_CONFIRMATIONS")?;
        }
        if let Some(v) = lookup("OVOTE_BATCH_SIZE") {
            self.sync.batch_size = v.parse().context("OVOTE_BATCH_SIZE")?;
        }
        if let Some(v) = lookup("OVOTE_API_ADDR") {
            self.api.addr = v;
        }
        if let Some(v) = lookup("OVOTE_PROVER_URL") {
            self.prover.url = v;
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync.batch_size,
            poll_interval: Duration::from_secs(self.sync.poll_interval_secs),
            confirmations: self.sync.confirmations,
            start_block: self.sync.start_block,
            max_backoff: Duration::from_secs(self.sync.max_backoff_secs),
            ..SyncConfig::default()
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            max_attempts: self.aggregator.max_attempts,
            proof_timeout: Duration::from_secs(self.aggregator.proof_timeout_secs),
            poll_interval: Duration::from_secs(self.aggregator.poll_interval_secs),
            enabled: self.aggregator.enabled,
        }
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.api.addr.parse::<SocketAddr>().is_err() {
            v.add_error(format!("api.addr '{}' is not a socket address", self.api.addr));
        }

        match &self.storage.data_dir {
            Some(dir) => {
                let path = Path::new(dir);
                if path.exists() && !path.is_dir() {
                    v.add_error(format!("storage.data_dir '{}' is not a directory", dir));
                }
            }
            None => v.add_warning(
                "storage.data_dir not set - state is kept in memory and lost on exit".into(),
            ),
        }

        if self.sync.enabled {
            if !self.eth.url.starts_with("http://") && !self.eth.url.starts_with("https://") {
                v.add_error(format!("eth.url '{}' must be an http(s) URL", self.eth.url));
            }
            let contract = self.eth.contract.trim_start_matches("0x");
            if contract.len() != 40 || hex::decode(contract).is_err() {
                v.add_error(format!(
                    "eth.contract '{}' is not a 20-byte hex address",
                    self.eth.contract
                ));
            }
        } else {
            v.add_warning("chain sync disabled - processes will not be updated".into());
        }
        if self.sync.batch_size == 0 {
            v.add_error("sync.batch_size must be at least 1".into());
        }
        if self.sync.confirmations == 0 {
            v.add_warning("sync.confirmations is 0 - reorged blocks are not tolerated".into());
        }

        if self.aggregator.max_attempts == 0 {
            v.add_error("aggregator.max_attempts must be at least 1".into());
        }
        if self.aggregator.enabled && self.prover.url.is_empty() {
            v.add_error("prover.url is required when the aggregator is enabled".into());
        }

        v
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("configuration warnings:");
            for w in &self.warnings {
                warn!(" - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("configuration errors:");
            for e in &self.errors {
                error!(" - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}
