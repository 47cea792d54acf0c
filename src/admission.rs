// src/admission.rs
//! Vote admission pipeline.
//!
//! Checks run in a fixed order and stop at the first failure:
//! process lookup, process status, census proof, duplicate, signature, vote
//! value. The duplicate check, signature check and the final write run under
//! a lock on `(process id, voter key hash)`, so two submissions from the same
//! key cannot both pass the duplicate check.

use crate::aggregator::ResultsAggregator;
use crate::census::compute_root;
use crate::crypto::{binding_hash, key_hash, verify_bytes, vote_value_from_bytes};
use crate::locks::KeyedLocks;
use crate::storage::{ProcessStore, StoreError};
use crate::types::{ChainId, KeyHash, ProcessId, ProcessStatus, VotePackage, VoteRecord};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("process not found")]
    ProcessNotFound,
    #[error("process is {0}, not accepting votes")]
    ProcessNotOpen(ProcessStatus),
    #[error("census proof does not match the process census root")]
    InvalidMembershipProof,
    #[error("key already voted in this process")]
    DuplicateVote,
    #[error("signature does not cover this chain, process and vote")]
    InvalidSignature,
    #[error("vote must be 32 little-endian bytes within u64 range")]
    MalformedVote,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RejectReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::ProcessNotFound => "process_not_found",
            RejectReason::ProcessNotOpen(_) => "process_not_open",
            RejectReason::InvalidMembershipProof => "invalid_membership_proof",
            RejectReason::DuplicateVote => "duplicate_vote",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::MalformedVote => "malformed_vote",
            RejectReason::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for RejectReason {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateVote { .. } => RejectReason::DuplicateVote,
            other => RejectReason::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(VoteRecord),
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }
}

pub struct VoteAdmission {
    chain_id: ChainId,
    store: Arc<dyn ProcessStore>,
    aggregator: Arc<ResultsAggregator>,
    locks: KeyedLocks<(ProcessId, KeyHash)>,
}

impl VoteAdmission {
    pub fn new(
        chain_id: ChainId,
        store: Arc<dyn ProcessStore>,
        aggregator: Arc<ResultsAggregator>,
    ) -> Self {
        Self {
            chain_id,
            store,
            aggregator,
            locks: KeyedLocks::new(),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Validate and, if every check passes, record and tally the vote.
    /// A rejected package leaves no trace in the store or the tally.
    pub fn admit(&self, process_id: ProcessId, package: &VotePackage) -> Admission {
        match self.try_admit(process_id, package) {
            Ok(record) => {
                log::info!(
                    "vote accepted: process {} key {} weight {}",
                    process_id,
                    hex::encode(record.voter_key_hash),
                    record.weight
                );
                Admission::Accepted(record)
            }
            Err(reason) => {
                match &reason {
                    RejectReason::Internal(msg) => {
                        log::error!("vote for process {} failed: {}", process_id, msg)
                    }
                    other => log::info!("vote rejected: process {}: {}", process_id, other),
                }
                Admission::Rejected(reason)
            }
        }
    }

    fn try_admit(&self, process_id: ProcessId, package: &VotePackage) -> Result<VoteRecord, RejectReason> {
        let process = self
            .store
            .read_process(process_id)?
            .ok_or(RejectReason::ProcessNotFound)?;

        if process.status != ProcessStatus::On {
            return Err(RejectReason::ProcessNotOpen(process.status));
        }

        let proof = &package.census_proof;
        let kh = key_hash(&proof.public_key);
        let recomputed = compute_root(&kh, proof.weight, &proof.siblings);
        if proof.root != process.census_root || recomputed != Some(process.census_root) {
            return Err(RejectReason::InvalidMembershipProof);
        }

        self.locks.with_lock(&(process_id, kh), || {
            if self.store.has_voted(process_id, &kh)? {
                return Err(RejectReason::DuplicateVote);
            }

            let msg = binding_hash(self.chain_id, process_id, &package.vote_bytes);
            if !verify_bytes(&proof.public_key, &msg, &package.signature) {
                return Err(RejectReason::InvalidSignature);
            }

            let vote_value =
                vote_value_from_bytes(&package.vote_bytes).ok_or(RejectReason::MalformedVote)?;

            let accepted_at_block = self
                .store
                .last_sync_block()?
                .map(|c| c.last_synced_block)
                .unwrap_or_default();

            let record = VoteRecord {
                process_id,
                voter_key_hash: kh,
                weight: proof.weight,
                vote_value,
                accepted_at_block,
            };
            self.store.record_vote(&record)?;
            self.aggregator.record(process_id, record.weight, vote_value);
            Ok(record)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::census::{CensusEngine, Membership};
    use crate::crypto::{public_from_seed, sign_vote, vote_bytes_from_value};
    use crate::prover::HttpProver;
    use crate::storage::MemoryStore;
    use crate::types::{CensusProof, Process};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const CHAIN: ChainId = 1;
    const PID: ProcessId = 7;

    struct Fixture {
        store: Arc<MemoryStore>,
        admission: VoteAdmission,
        aggregator: Arc<ResultsAggregator>,
        proofs: Vec<CensusProof>,
    }

    fn fixture(status: ProcessStatus) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.init_meta(CHAIN, 10).unwrap();
        let census = CensusEngine::load(store.clone()).unwrap();
        let id = census.open().unwrap();
        let keys: Vec<_> = (1..=3u8).map(|i| public_from_seed(&[i; 32])).collect();
        census.add_keys(id, &keys, &[1, 2, 3]).unwrap();
        let root = census.close(id).unwrap();
        let proofs = keys
            .iter()
            .map(|k| match census.prove(id, k).unwrap() {
                Membership::Member(p) => p,
                Membership::NonMember => unreachable!(),
            })
            .collect();
        store
            .store_process(&Process {
                id: PID,
                census_root: root,
                census_size: 3,
                status,
                created_block: 10,
                res_pub_start_block: 100,
                res_pub_window: 10,
                min_participation: 0,
                typ: 0,
                result: None,
                n_votes: 0,
            })
            .unwrap();
        let prover = Arc::new(HttpProver::new("http://127.0.0.1:1", Duration::from_secs(1)));
        let aggregator = Arc::new(ResultsAggregator::new(
            store.clone(),
            prover,
            CHAIN,
            AggregatorConfig::default(),
        ));
        let admission = VoteAdmission::new(CHAIN, store.clone(), aggregator.clone());
        Fixture {
            store,
            admission,
            aggregator,
            proofs,
        }
    }

    fn package(seed: u8, proof: &CensusProof, chain: ChainId, pid: ProcessId, value: u64) -> VotePackage {
        let vote_bytes = vote_bytes_from_value(value);
        VotePackage {
            signature: sign_vote(&[seed; 32], chain, pid, &vote_bytes),
            census_proof: proof.clone(),
            vote_bytes,
        }
    }

    fn rejected(a: Admission) -> RejectReason {
        match a {
            Admission::Rejected(r) => r,
            Admission::Accepted(r) => panic!("unexpectedly accepted {:?}", r),
        }
    }

    #[test]
    fn valid_vote_is_recorded_and_tallied() {
        let f = fixture(ProcessStatus::On);
        let pkg = package(2, &f.proofs[1], CHAIN, PID, 1);
        match f.admission.admit(PID, &pkg) {
            Admission::Accepted(r) => {
                assert_eq!(r.weight, 2);
                assert_eq!(r.vote_value, 1);
                assert_eq!(r.accepted_at_block, 9);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(f.aggregator.tally(PID).votes.get(&1), Some(&2));
    }

    #[test]
    fn second_submission_is_duplicate_and_tally_unchanged() {
        let f = fixture(ProcessStatus::On);
        let pkg = package(1, &f.proofs[0], CHAIN, PID, 1);
        assert!(f.admission.admit(PID, &pkg).is_accepted());
        let before = f.aggregator.tally(PID);
        assert_eq!(rejected(f.admission.admit(PID, &pkg)), RejectReason::DuplicateVote);
        assert_eq!(f.aggregator.tally(PID), before);
        assert_eq!(f.store.votes_for_process(PID).unwrap().len(), 1);
    }

    #[test]
    fn replay_across_chain_or_process_fails_signature() {
        let f = fixture(ProcessStatus::On);
        let other_chain = package(1, &f.proofs[0], CHAIN + 1, PID, 1);
        assert_eq!(rejected(f.admission.admit(PID, &other_chain)), RejectReason::InvalidSignature);
        let other_process = package(1, &f.proofs[0], CHAIN, PID + 1, 1);
        assert_eq!(rejected(f.admission.admit(PID, &other_process)), RejectReason::InvalidSignature);
        assert!(!f.store.has_voted(PID, &key_hash(&f.proofs[0].public_key)).unwrap());
    }

    #[test]
    fn checks_run_in_order() {
        let f = fixture(ProcessStatus::On);
        let pkg = package(1, &f.proofs[0], CHAIN, PID, 1);
        assert_eq!(rejected(f.admission.admit(99, &pkg)), RejectReason::ProcessNotFound);

        let frozen = fixture(ProcessStatus::Frozen);
        let pkg = package(1, &frozen.proofs[0], CHAIN, PID, 1);
        assert_eq!(
            rejected(frozen.admission.admit(PID, &pkg)),
            RejectReason::ProcessNotOpen(ProcessStatus::Frozen)
        );
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let f = fixture(ProcessStatus::On);
        let mut proof = f.proofs[0].clone();
        proof.weight = 100;
        let pkg = package(1, &proof, CHAIN, PID, 1);
        assert_eq!(rejected(f.admission.admit(PID, &pkg)), RejectReason::InvalidMembershipProof);

        // self-consistent proof for a different root
        let mut proof = f.proofs[0].clone();
        proof.root = [9; 32];
        let pkg = package(1, &proof, CHAIN, PID, 1);
        assert_eq!(rejected(f.admission.admit(PID, &pkg)), RejectReason::InvalidMembershipProof);
    }

    #[test]
    fn oversized_vote_value_is_malformed() {
        let f = fixture(ProcessStatus::On);
        let mut vote_bytes = vote_bytes_from_value(1);
        vote_bytes[31] = 1;
        let pkg = VotePackage {
            signature: sign_vote(&[1; 32], CHAIN, PID, &vote_bytes),
            census_proof: f.proofs[0].clone(),
            vote_bytes,
        };
        assert_eq!(rejected(f.admission.admit(PID, &pkg)), RejectReason::MalformedVote);
        assert_eq!(RejectReason::MalformedVote.code(), "malformed_vote");
    }

    #[test]
    fn concurrent_submissions_from_one_voter_admit_once() {
        let f = fixture(ProcessStatus::On);
        // half the threads vote 0, half vote 1, all with the same key
        let packages: Vec<_> = (0..16)
            .map(|i| package(3, &f.proofs[2], CHAIN, PID, i % 2))
            .collect();

        let results: Vec<Admission> = std::thread::scope(|s| {
            let handles: Vec<_> = packages
                .iter()
                .map(|pkg| {
                    let admission = &f.admission;
                    s.spawn(move || admission.admit(PID, pkg))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted: Vec<_> = results
            .iter()
            .filter_map(|a| match a {
                Admission::Accepted(r) => Some(r.clone()),
                Admission::Rejected(_) => None,
            })
            .collect();
        assert_eq!(accepted.len(), 1);
        for a in results.into_iter().filter(|a| !a.is_accepted()) {
            assert_eq!(rejected(a), RejectReason::DuplicateVote);
        }

        let tally = f.aggregator.tally(PID);
        assert_eq!(tally.n_votes, 1);
        assert_eq!(tally.votes, BTreeMap::from([(accepted[0].vote_value, 3)]));
        assert_eq!(f.store.votes_for_process(PID).unwrap(), accepted);
    }

    #[test]
    fn concurrent_distinct_voters_are_all_admitted() {
        let f = fixture(ProcessStatus::On);
        let packages: Vec<_> = (0..3u8)
            .map(|i| package(i + 1, &f.proofs[usize::from(i)], CHAIN, PID, 1))
            .collect();

        std::thread::scope(|s| {
            for pkg in &packages {
                let admission = &f.admission;
                s.spawn(move || assert!(admission.admit(PID, pkg).is_accepted()));
            }
        });

        let tally = f.aggregator.tally(PID);
        assert_eq!(tally.n_votes, 3);
        assert_eq!(tally.votes, BTreeMap::from([(1, 6)]));
    }
}
