// src/eth/sync.rs
//! Chain synchronizer
//!
//! Backfills contract logs from the persisted cursor up to the chain head in
//! bounded block ranges, then tails the chain at a fixed poll interval. Every
//! range is decoded and applied in block-and-log order and committed to the
//! store together with the new cursor in one atomic batch, so a crash or a
//! cancelled fetch leaves the cursor at the last fully applied block.

use super::{decode, ChainEvent, DecodeError, LedgerError, LedgerSource, RawLog};
use crate::storage::{ProcessStore, StoreError, SyncBatch};
use crate::types::{BlockNumber, ChainId, Process, ProcessId, ProcessStatus, SyncCursor};
use backoff::ExponentialBackoffBuilder;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks per `logs` request
    pub batch_size: u64,
    pub poll_interval: Duration,
    /// Blocks behind the head considered final
    pub confirmations: u64,
    /// First block that may contain contract logs (used for a fresh store only)
    pub start_block: BlockNumber,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            poll_interval: Duration::from_secs(5),
            confirmations: 0,
            start_block: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed log at block {block} index {log_index}: {source}")]
    Decode {
        block: BlockNumber,
        log_index: u64,
        source: DecodeError,
    },
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("sync cancelled")]
    Cancelled,
}

pub struct ChainSynchronizer {
    ledger: Arc<dyn LedgerSource>,
    store: Arc<dyn ProcessStore>,
    config: SyncConfig,
    chain_id: ChainId,
    height_tx: watch::Sender<BlockNumber>,
}

impl ChainSynchronizer {
    /// Ask the ledger for its chain id and bind the store to it. Fails if the
    /// store already follows a different chain.
    pub async fn connect(
        ledger: Arc<dyn LedgerSource>,
        store: Arc<dyn ProcessStore>,
        config: SyncConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, SyncError> {
        let chain_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            r = retry_transient(&config, "eth_chainId", || ledger.chain_id()) => r?,
        };
        store.init_meta(chain_id, config.start_block)?;
        let cursor = store
            .last_sync_block()?
            .ok_or(StoreError::NotInitialised)?;
        log::info!(
            "synchronizer bound to chain {}, resuming after block {}",
            chain_id,
            cursor.last_synced_block
        );
        let (height_tx, _) = watch::channel(cursor.last_synced_block);
        Ok(Self {
            ledger,
            store,
            config,
            chain_id,
            height_tx,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Receiver of the last committed block height.
    pub fn subscribe(&self) -> watch::Receiver<BlockNumber> {
        self.height_tx.subscribe()
    }

    pub fn cursor(&self) -> Result<SyncCursor, SyncError> {
        Ok(self
            .store
            .last_sync_block()?
            .ok_or(StoreError::NotInitialised)?)
    }

    async fn target_block(&self, cancel: &CancellationToken) -> Result<BlockNumber, SyncError> {
        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            r = retry_transient(&self.config, "eth_blockNumber", || self.ledger.head_block()) => r?,
        };
        Ok(head.saturating_sub(self.config.confirmations))
    }

    /// Backfill from the cursor to the current head. Returns the block reached.
    pub async fn sync_history(&self, cancel: &CancellationToken) -> Result<BlockNumber, SyncError> {
        let target = self.target_block(cancel).await?;
        let start = self.cursor()?.last_synced_block;
        if target > start {
            log::info!("historical sync: blocks {}..={}", start + 1, target);
        }
        let reached = self.catch_up(target, cancel).await?;
        log::info!("historical sync complete at block {}", reached);
        Ok(reached)
    }

    /// Poll for new blocks until cancelled.
    pub async fn run_live(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        log::info!(
            "live sync: polling every {:?} ({} confirmations)",
            self.config.poll_interval,
            self.config.confirmations
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            match self.target_block(cancel).await {
                Ok(target) => match self.catch_up(target, cancel).await {
                    Ok(_) | Err(SyncError::Cancelled) => {}
                    Err(e) => return Err(e),
                },
                Err(SyncError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Historical sync followed by live sync, as a background task.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<Result<(), SyncError>> {
        tokio::spawn(async move {
            let result = match self.sync_history(&cancel).await {
                Ok(_) => self.run_live(&cancel).await,
                Err(SyncError::Cancelled) => Ok(()),
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => log::info!("synchronizer stopped"),
                Err(e) => log::error!("synchronizer aborted: {}", e),
            }
            result
        })
    }

    /// Apply ranges of at most `batch_size` blocks until the cursor reaches `target`.
    async fn catch_up(&self, target: BlockNumber, cancel: &CancellationToken) -> Result<BlockNumber, SyncError> {
        let mut cursor = self.cursor()?.last_synced_block;
        if target < cursor {
            log::warn!("ledger head {} is behind cursor {}", target, cursor);
        }
        while cursor < target {
            let from = cursor + 1;
            let to = target.min(cursor.saturating_add(self.config.batch_size.max(1)));
            self.sync_range(from, to, cancel).await?;
            cursor = to;
        }
        Ok(cursor)
    }

    async fn sync_range(&self, from: BlockNumber, to: BlockNumber, cancel: &CancellationToken) -> Result<(), SyncError> {
        let logs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            r = retry_transient(&self.config, "eth_getLogs", || self.ledger.logs(from, to)) => r?,
        };
        let n_logs = logs.len();
        let batch = self.build_batch(from, to, logs)?;
        let n_updates = batch.processes.len();
        self.store.commit_sync_batch(batch)?;
        self.height_tx.send_replace(to);
        if n_logs > 0 {
            log::info!(
                "synced blocks {}..={}: {} logs, {} process updates",
                from,
                to,
                n_logs,
                n_updates
            );
        } else {
            log::debug!("synced blocks {}..={}: no logs", from, to);
        }
        Ok(())
    }

    /// Decode and apply `logs` on top of the stored processes, then refresh
    /// height-driven statuses at `to`. Nothing is written here.
    fn build_batch(&self, from: BlockNumber, to: BlockNumber, logs: Vec<RawLog>) -> Result<SyncBatch, SyncError> {
        let mut overlay = Overlay::new(self.store.as_ref());
        for raw in logs {
            if raw.block_number < from || raw.block_number > to {
                return Err(LedgerError::InvalidResponse(format!(
                    "log at block {} outside requested range {}..={}",
                    raw.block_number, from, to
                ))
                .into());
            }
            let event = decode(raw.kind, &raw.data).map_err(|source| SyncError::Decode {
                block: raw.block_number,
                log_index: raw.log_index,
                source,
            })?;
            overlay.apply(raw.block_number, event)?;
        }
        overlay.refresh_statuses(to)?;
        Ok(SyncBatch {
            processes: overlay.into_updates(),
            cursor: SyncCursor {
                chain_id: self.chain_id,
                last_synced_block: to,
            },
        })
    }
}

/// Pending process mutations of one batch, read-through to the store.
struct Overlay<'a> {
    store: &'a dyn ProcessStore,
    changed: BTreeMap<ProcessId, Process>,
}

impl<'a> Overlay<'a> {
    fn new(store: &'a dyn ProcessStore) -> Self {
        Self {
            store,
            changed: BTreeMap::new(),
        }
    }

    fn get(&self, id: ProcessId) -> Result<Option<Process>, StoreError> {
        match self.changed.get(&id) {
            Some(p) => Ok(Some(p.clone())),
            None => self.store.read_process(id),
        }
    }

    fn apply(&mut self, block: BlockNumber, event: ChainEvent) -> Result<(), StoreError> {
        log::debug!("block {}: {}", block, event);
        match event {
            ChainEvent::ProcessCreated(e) => {
                if self.get(e.process_id)?.is_some() {
                    log::warn!("ignoring ProcessCreated for existing process {}", e.process_id);
                    return Ok(());
                }
                let p = Process {
                    id: e.process_id,
                    census_root: e.census_root,
                    census_size: e.census_size,
                    status: ProcessStatus::for_height(block, e.res_pub_start_block, block),
                    created_block: block,
                    res_pub_start_block: e.res_pub_start_block,
                    res_pub_window: e.res_pub_window,
                    min_participation: e.min_participation,
                    typ: e.typ,
                    result: None,
                    n_votes: 0,
                };
                log::info!(
                    "process {} created at block {} (census root {}, size {})",
                    p.id,
                    block,
                    hex::encode(p.census_root),
                    p.census_size
                );
                self.changed.insert(p.id, p);
            }
            ChainEvent::ResultPublished(e) => {
                let Some(mut p) = self.get(e.process_id)? else {
                    log::warn!("ResultPublished for unknown process {}", e.process_id);
                    return Ok(());
                };
                if p.status == ProcessStatus::Closed {
                    log::warn!("ResultPublished for closed process {}", e.process_id);
                    return Ok(());
                }
                p.result = Some(e.result);
                p.n_votes = e.n_votes;
                p.status = ProcessStatus::ResultsPublished;
                log::info!(
                    "process {} result published: {} ({} votes)",
                    p.id,
                    e.result,
                    e.n_votes
                );
                self.changed.insert(p.id, p);
            }
            ChainEvent::ProcessClosed(e) => {
                if !e.success {
                    log::info!("process {}: close attempt failed on-chain", e.process_id);
                    return Ok(());
                }
                let Some(mut p) = self.get(e.process_id)? else {
                    log::warn!("ProcessClosed for unknown process {}", e.process_id);
                    return Ok(());
                };
                p.status = ProcessStatus::Closed;
                log::info!("process {} closed", p.id);
                self.changed.insert(p.id, p);
            }
        }
        Ok(())
    }

    fn refresh_statuses(&mut self, height: BlockNumber) -> Result<(), StoreError> {
        for p in self.changed.values_mut() {
            p.refresh_status(height);
        }
        for mut stored in self.store.list_processes()? {
            if self.changed.contains_key(&stored.id) {
                continue;
            }
            if stored.refresh_status(height) {
                log::info!("process {} is now {} at block {}", stored.id, stored.status, height);
                self.changed.insert(stored.id, stored);
            }
        }
        Ok(())
    }

    fn into_updates(self) -> Vec<Process> {
        self.changed.into_values().collect()
    }
}

/// Run `op`, retrying transient ledger errors with exponential backoff.
/// Permanent errors are returned immediately.
async fn retry_transient<T, F, Fut>(config: &SyncConfig, what: &str, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff)
        .with_max_interval(config.max_backoff)
        .with_max_elapsed_time(None)
        .build();
    backoff::future::retry_notify(
        policy,
        || {
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: LedgerError, wait: Duration| {
            log::warn!("{} failed: {}, retrying in {:?}", what, e, wait);
        },
    )
    .await
}
