// src/types.rs
// Domain types shared by the synchronizer, the store, admission and the aggregator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of every hash, root and key hash handled by the node.
pub const HASH_LEN: usize = 32;

pub type Hash = [u8; HASH_LEN];
pub type KeyHash = Hash;
pub type ChainId = u64;
pub type ProcessId = u64;
pub type CensusId = u64;
pub type BlockNumber = u64;

pub const ZERO_HASH: Hash = [0u8; HASH_LEN];

/// Lifecycle of a voting process as mirrored from the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    /// Known but the chain has not reached its creation block yet
    Scheduled,
    /// Accepting votes
    On,
    /// Voting is over, results not yet published
    Frozen,
    ResultsPublished,
    Closed,
}

impl ProcessStatus {
    /// Status implied by chain height alone.
    pub fn for_height(
        created_block: BlockNumber,
        res_pub_start_block: BlockNumber,
        height: BlockNumber,
    ) -> Self {
        if height < created_block {
            ProcessStatus::Scheduled
        } else if height < res_pub_start_block {
            ProcessStatus::On
        } else {
            ProcessStatus::Frozen
        }
    }

    /// Statuses reached through chain events are never overridden by height.
    pub fn is_event_driven(&self) -> bool {
        matches!(
            self,
            ProcessStatus::ResultsPublished | ProcessStatus::Closed
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Scheduled => "scheduled",
            ProcessStatus::On => "on",
            ProcessStatus::Frozen => "frozen",
            ProcessStatus::ResultsPublished => "results_published",
            ProcessStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: ProcessId,
    #[serde(with = "hex_bytes")]
    pub census_root: Hash,
    pub census_size: u64,
    pub status: ProcessStatus,
    pub created_block: BlockNumber,
    pub res_pub_start_block: BlockNumber,
    pub res_pub_window: u64,
    pub min_participation: u8,
    #[serde(rename = "type")]
    pub typ: u8,
    pub result: Option<u64>,
    pub n_votes: u64,
}

impl Process {
    /// First block after the results-publication window.
    pub fn res_pub_end_block(&self) -> BlockNumber {
        self.res_pub_start_block.saturating_add(self.res_pub_window)
    }

    /// `[resPubStartBlock, resPubStartBlock + resPubWindow)`
    pub fn in_publication_window(&self, height: BlockNumber) -> bool {
        height >= self.res_pub_start_block && height < self.res_pub_end_block()
    }

    /// Re-derive the height-driven status. Returns true if it changed.
    pub fn refresh_status(&mut self, height: BlockNumber) -> bool {
        if self.status.is_event_driven() {
            return false;
        }
        let next = ProcessStatus::for_height(self.created_block, self.res_pub_start_block, height);
        if next != self.status {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Durable record of the last ledger block fully ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub chain_id: ChainId,
    pub last_synced_block: BlockNumber,
}

/// Persisted, append-only record of an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub process_id: ProcessId,
    #[serde(with = "hex_bytes")]
    pub voter_key_hash: KeyHash,
    pub weight: u64,
    pub vote_value: u64,
    pub accepted_at_block: BlockNumber,
}

/// Membership proof of a public key in a closed census.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusProof {
    /// Ed25519 public key of the voter
    #[serde(with = "hex_bytes")]
    pub public_key: [u8; 32],
    pub weight: u64,
    /// Sibling hashes ordered from the root level down to the leaf
    #[serde(with = "hex_vec")]
    pub siblings: Vec<Hash>,
    #[serde(with = "hex_bytes")]
    pub root: Hash,
}

/// Vote as submitted by a voter; consumed once by admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePackage {
    #[serde(with = "hex_bytes")]
    pub signature: [u8; 64],
    pub census_proof: CensusProof,
    #[serde(rename = "vote", with = "hex::serde")]
    pub vote_bytes: Vec<u8>,
}

/// Fixed-size byte arrays as hex strings.
pub mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {} bytes, got {}", N, raw.len())))
    }
}

pub mod hex_vec {
    use super::Hash;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Hash], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Hash>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|h| {
                let b = hex::decode(h.trim_start_matches("0x")).map_err(D::Error::custom)?;
                b.as_slice()
                    .try_into()
                    .map_err(|_| D::Error::custom("sibling must be 32 bytes"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> Process {
        Process {
            id: 7,
            census_root: [1u8; 32],
            census_size: 3,
            status: ProcessStatus::Scheduled,
            created_block: 100,
            res_pub_start_block: 120,
            res_pub_window: 10,
            min_participation: 10,
            typ: 1,
            result: None,
            n_votes: 0,
        }
    }

    #[test]
    fn status_follows_height_thresholds() {
        let mut p = process();
        assert!(!p.refresh_status(99));
        assert_eq!(p.status, ProcessStatus::Scheduled);
        assert!(p.refresh_status(100));
        assert_eq!(p.status, ProcessStatus::On);
        assert!(p.refresh_status(120));
        assert_eq!(p.status, ProcessStatus::Frozen);
    }

    #[test]
    fn event_driven_status_is_sticky() {
        let mut p = process();
        p.status = ProcessStatus::Closed;
        assert!(!p.refresh_status(110));
        assert_eq!(p.status, ProcessStatus::Closed);
    }

    #[test]
    fn publication_window_is_half_open() {
        let p = process();
        assert!(!p.in_publication_window(119));
        assert!(p.in_publication_window(120));
        assert!(p.in_publication_window(129));
        assert!(!p.in_publication_window(130));
    }

    #[test]
    fn process_json_uses_hex_root() {
        let p = process();
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["censusRoot"], hex::encode([1u8; 32]));
        assert_eq!(json["type"], 1);
        let back: Process = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }
}
