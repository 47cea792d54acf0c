// src/storage/mod.rs
//! Process store contract shared by the synchronizer, admission, the census
//! engine and the aggregator.

pub mod memory;
pub mod rocks;

use crate::census::CensusSnapshot;
use crate::types::{BlockNumber, ChainId, KeyHash, Process, ProcessId, ProcessStatus, SyncCursor, VoteRecord};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store belongs to chain {stored}, got {requested}")]
    ChainIdMismatch { stored: ChainId, requested: ChainId },
    #[error("store meta not initialised")]
    NotInitialised,
    #[error("cursor regression: {current} -> {proposed}")]
    CursorRegression {
        current: BlockNumber,
        proposed: BlockNumber,
    },
    #[error("key {key} already voted in process {process_id}")]
    DuplicateVote { process_id: ProcessId, key: String },
    #[error("process {0} not found")]
    ProcessNotFound(ProcessId),
    #[error("database: {0}")]
    Db(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

/// Everything one synchronizer batch changes: process upserts plus the cursor
/// they bring the store to. Committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub processes: Vec<Process>,
    pub cursor: SyncCursor,
}

/// Persistence contract consumed by the core.
///
/// Writers of a single `Process` record are serialised by the implementation;
/// readers observe either the old or the new record, never a mix.
pub trait ProcessStore: Send + Sync {
    /// Record the chain this store follows. The cursor starts just before
    /// `start_block`. Calling again with the same chain is a no-op.
    fn init_meta(&self, chain_id: ChainId, start_block: BlockNumber) -> Result<(), StoreError>;

    fn last_sync_block(&self) -> Result<Option<SyncCursor>, StoreError>;

    fn store_process(&self, process: &Process) -> Result<(), StoreError>;

    fn update_process_status(&self, id: ProcessId, status: ProcessStatus) -> Result<(), StoreError>;

    fn read_process(&self, id: ProcessId) -> Result<Option<Process>, StoreError>;

    fn list_processes(&self) -> Result<Vec<Process>, StoreError>;

    /// Append a vote record. Fails with `DuplicateVote` if the key already voted.
    fn record_vote(&self, vote: &VoteRecord) -> Result<(), StoreError>;

    fn has_voted(&self, process_id: ProcessId, voter_key_hash: &KeyHash) -> Result<bool, StoreError>;

    /// Votes of a process ordered by voter key hash.
    fn votes_for_process(&self, process_id: ProcessId) -> Result<Vec<VoteRecord>, StoreError>;

    /// Atomically apply process upserts and advance the cursor.
    fn commit_sync_batch(&self, batch: SyncBatch) -> Result<(), StoreError>;

    fn put_census(&self, census: &CensusSnapshot) -> Result<(), StoreError>;

    fn load_censuses(&self) -> Result<Vec<CensusSnapshot>, StoreError>;
}

/// Cursor written by `init_meta` for a fresh store: the block before
/// `start_block`, so syncing resumes at `start_block`. A start of 0 also
/// yields cursor 0 and scanning begins at block 1; the genesis block carries
/// no transactions and so never holds contract logs.
pub(crate) fn initial_cursor(chain_id: ChainId, start_block: BlockNumber) -> SyncCursor {
    SyncCursor {
        chain_id,
        last_synced_block: start_block.saturating_sub(1),
    }
}

/// Check that `next` may replace `current`.
pub(crate) fn check_cursor(current: Option<SyncCursor>, next: &SyncCursor) -> Result<(), StoreError> {
    let current = current.ok_or(StoreError::NotInitialised)?;
    if current.chain_id != next.chain_id {
        return Err(StoreError::ChainIdMismatch {
            stored: current.chain_id,
            requested: next.chain_id,
        });
    }
    if next.last_synced_block < current.last_synced_block {
        return Err(StoreError::CursorRegression {
            current: current.last_synced_block,
            proposed: next.last_synced_block,
        });
    }
    Ok(())
}

/// Big-endian composite key `process_id || key_hash`, so a prefix scan over a
/// process yields its votes in key-hash order.
pub(crate) fn vote_key(process_id: ProcessId, key_hash: &KeyHash) -> Vec<u8> {
    let mut k = Vec::with_capacity(8 + key_hash.len());
    k.extend_from_slice(&process_id.to_be_bytes());
    k.extend_from_slice(key_hash);
    k
}
