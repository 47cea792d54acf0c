// src/census/mod.rs
//! Census engine: weighted eligibility sets built off-chain, frozen into a
//! sparse Merkle root that a process later anchors on-chain.
//!
//! A census is `Open` while keys are being added (single writer, serialised
//! by a per-census mutex) and `Closed` once its root is fixed. Closed censuses
//! are immutable and shared behind an `Arc`, so proofs are served without
//! taking any census lock.

pub mod tree;

use crate::crypto::{key_hash, PublicKeyBytes};
use crate::storage::{ProcessStore, StoreError};
use crate::types::{CensusId, CensusProof, Hash, KeyHash};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use tree::{compute_root, verify_proof, SparseTree};

#[derive(Debug, Error)]
pub enum CensusError {
    #[error("keys and weights differ in length: {keys} keys, {weights} weights")]
    SizeMismatch { keys: usize, weights: usize },
    #[error("public key {0} already in census")]
    DuplicateKey(String),
    #[error("census {0} is closed")]
    AlreadyClosed(CensusId),
    #[error("census {0} not found")]
    NotFound(CensusId),
    #[error("census {0} is still open")]
    StillOpen(CensusId),
    #[error("census storage: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CensusState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusLeaf {
    #[serde(with = "crate::types::hex_bytes")]
    pub public_key: PublicKeyBytes,
    pub weight: u64,
}

/// Persisted form of a census.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusSnapshot {
    pub id: CensusId,
    pub state: CensusState,
    pub leaves: Vec<CensusLeaf>,
    pub root: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusInfo {
    pub id: CensusId,
    pub state: CensusState,
    pub size: usize,
    pub root: Option<String>,
}

/// Result of a membership query on a closed census.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Member(CensusProof),
    NonMember,
}

struct OpenCensus {
    id: CensusId,
    leaves: BTreeMap<KeyHash, CensusLeaf>,
    /// set under the mutex when the census is frozen; late writers see it
    closed: bool,
}

impl OpenCensus {
    fn snapshot(&self) -> CensusSnapshot {
        CensusSnapshot {
            id: self.id,
            state: CensusState::Open,
            leaves: self.leaves.values().cloned().collect(),
            root: None,
        }
    }
}

pub struct ClosedCensus {
    id: CensusId,
    leaves: BTreeMap<KeyHash, CensusLeaf>,
    tree: SparseTree,
    root: Hash,
}

impl ClosedCensus {
    fn build(id: CensusId, leaves: BTreeMap<KeyHash, CensusLeaf>) -> Self {
        let tree = SparseTree::from_leaves(leaves.iter().map(|(k, l)| (*k, l.weight)));
        let root = tree.root();
        Self {
            id,
            leaves,
            tree,
            root,
        }
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    fn snapshot(&self) -> CensusSnapshot {
        CensusSnapshot {
            id: self.id,
            state: CensusState::Closed,
            leaves: self.leaves.values().cloned().collect(),
            root: Some(hex::encode(self.root)),
        }
    }

    pub fn prove(&self, public_key: &PublicKeyBytes) -> Membership {
        let kh = key_hash(public_key);
        match self.tree.proof(&kh) {
            Some((weight, siblings)) => Membership::Member(CensusProof {
                public_key: *public_key,
                weight,
                siblings,
                root: self.root,
            }),
            None => Membership::NonMember,
        }
    }
}

#[derive(Clone)]
enum CensusEntry {
    Open(Arc<Mutex<OpenCensus>>),
    Closed(Arc<ClosedCensus>),
}

pub struct CensusEngine {
    censuses: RwLock<HashMap<CensusId, CensusEntry>>,
    next_id: AtomicU64,
    store: Arc<dyn ProcessStore>,
}

impl CensusEngine {
    /// Create an engine backed by `store`, restoring any persisted censuses.
    pub fn load(store: Arc<dyn ProcessStore>) -> Result<Self, CensusError> {
        let mut censuses = HashMap::new();
        let mut max_id = 0;
        for snap in store.load_censuses()? {
            max_id = max_id.max(snap.id);
            let leaves: BTreeMap<KeyHash, CensusLeaf> = snap
                .leaves
                .into_iter()
                .map(|l| (key_hash(&l.public_key), l))
                .collect();
            let entry = match snap.state {
                CensusState::Open => CensusEntry::Open(Arc::new(Mutex::new(OpenCensus {
                    id: snap.id,
                    leaves,
                    closed: false,
                }))),
                CensusState::Closed => {
                    let closed = ClosedCensus::build(snap.id, leaves);
                    if let Some(stored) = snap.root.as_deref() {
                        if stored != hex::encode(closed.root) {
                            log::warn!(
                                "census {} root recomputed as {} but stored {}",
                                snap.id,
                                hex::encode(closed.root),
                                stored
                            );
                        }
                    }
                    CensusEntry::Closed(Arc::new(closed))
                }
            };
            censuses.insert(snap.id, entry);
        }
        if !censuses.is_empty() {
            log::info!("restored {} censuses (last id {})", censuses.len(), max_id);
        }
        Ok(Self {
            censuses: RwLock::new(censuses),
            next_id: AtomicU64::new(max_id + 1),
            store,
        })
    }

    fn entry(&self, id: CensusId) -> Result<CensusEntry, CensusError> {
        self.censuses
            .read()
            .get(&id)
            .cloned()
            .ok_or(CensusError::NotFound(id))
    }

    /// Create an empty, mutable census.
    pub fn open(&self) -> Result<CensusId, CensusError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let census = OpenCensus {
            id,
            leaves: BTreeMap::new(),
            closed: false,
        };
        self.store.put_census(&census.snapshot())?;
        self.censuses
            .write()
            .insert(id, CensusEntry::Open(Arc::new(Mutex::new(census))));
        log::debug!("census {} opened", id);
        Ok(id)
    }

    /// Add keys with their weights. All-or-nothing: on any error the census
    /// is left untouched. Zero weights are valid entries.
    pub fn add_keys(
        &self,
        id: CensusId,
        keys: &[PublicKeyBytes],
        weights: &[u64],
    ) -> Result<(), CensusError> {
        if keys.len() != weights.len() {
            return Err(CensusError::SizeMismatch {
                keys: keys.len(),
                weights: weights.len(),
            });
        }
        let open = match self.entry(id)? {
            CensusEntry::Open(o) => o,
            CensusEntry::Closed(_) => return Err(CensusError::AlreadyClosed(id)),
        };
        let mut census = open.lock();
        if census.closed {
            return Err(CensusError::AlreadyClosed(id));
        }

        let mut staged = census.leaves.clone();
        for (pk, w) in keys.iter().zip(weights) {
            let kh = key_hash(pk);
            if staged.contains_key(&kh) {
                return Err(CensusError::DuplicateKey(hex::encode(pk)));
            }
            staged.insert(
                kh,
                CensusLeaf {
                    public_key: *pk,
                    weight: *w,
                },
            );
        }

        let next = OpenCensus {
            id,
            leaves: staged,
            closed: false,
        };
        self.store.put_census(&next.snapshot())?;
        census.leaves = next.leaves;
        log::debug!("census {}: added {} keys ({} total)", id, keys.len(), census.leaves.len());
        Ok(())
    }

    /// Freeze the census and return its root. Closing twice returns the same root.
    pub fn close(&self, id: CensusId) -> Result<Hash, CensusError> {
        let open = match self.entry(id)? {
            CensusEntry::Open(o) => o,
            CensusEntry::Closed(c) => return Ok(c.root),
        };
        let mut census = open.lock();
        if census.closed {
            // lost the race with another close; the map already holds the result
            return match self.entry(id)? {
                CensusEntry::Closed(c) => Ok(c.root),
                CensusEntry::Open(_) => Err(CensusError::StillOpen(id)),
            };
        }

        let closed = ClosedCensus::build(id, census.leaves.clone());
        self.store.put_census(&closed.snapshot())?;
        let root = closed.root;
        census.closed = true;
        self.censuses
            .write()
            .insert(id, CensusEntry::Closed(Arc::new(closed)));
        log::info!(
            "census {} closed with {} keys, root {}",
            id,
            census.leaves.len(),
            hex::encode(root)
        );
        Ok(root)
    }

    /// Closed census handle; fails with `StillOpen` while keys can still change.
    pub fn closed(&self, id: CensusId) -> Result<Arc<ClosedCensus>, CensusError> {
        match self.entry(id)? {
            CensusEntry::Closed(c) => Ok(c),
            CensusEntry::Open(_) => Err(CensusError::StillOpen(id)),
        }
    }

    /// Membership proof for `public_key`. Non-membership is a successful answer,
    /// errors are reserved for unknown or still-open censuses.
    pub fn prove(
        &self,
        id: CensusId,
        public_key: &PublicKeyBytes,
    ) -> Result<Membership, CensusError> {
        Ok(self.closed(id)?.prove(public_key))
    }

    pub fn info(&self, id: CensusId) -> Result<CensusInfo, CensusError> {
        Ok(match self.entry(id)? {
            CensusEntry::Open(o) => {
                let c = o.lock();
                CensusInfo {
                    id,
                    state: if c.closed {
                        CensusState::Closed
                    } else {
                        CensusState::Open
                    },
                    size: c.leaves.len(),
                    root: None,
                }
            }
            CensusEntry::Closed(c) => CensusInfo {
                id,
                state: CensusState::Closed,
                size: c.leaves.len(),
                root: Some(hex::encode(c.root)),
            },
        })
    }
}
