// src/eth/mod.rs
//! Everything that faces the ledger: log decoding, the ledger source seam,
//! the JSON-RPC adapter and the synchronizer that drives them.

pub mod events;
pub mod rpc;
pub mod sync;

use crate::types::{BlockNumber, ChainId};
use async_trait::async_trait;
use thiserror::Error;

pub use events::{decode, ChainEvent, DecodeError, EventKind};
pub use sync::{ChainSynchronizer, SyncConfig, SyncError};

/// A contract log as delivered by the ledger, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: BlockNumber,
    pub log_index: u64,
    pub kind: EventKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// RPC unreachable, timed out or returned a server error; safe to retry
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// The ledger answered with something the node cannot use
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Source of contract logs. Implementations must return every log in
/// `[from, to]` exactly once per call, in block-and-log order.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    async fn chain_id(&self) -> Result<ChainId, LedgerError>;

    async fn head_block(&self) -> Result<BlockNumber, LedgerError>;

    async fn logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<RawLog>, LedgerError>;
}
