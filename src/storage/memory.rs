// src/storage/memory.rs
// In-memory process store for tests and ephemeral runs (`--data-dir` unset).

use super::{check_cursor, initial_cursor, ProcessStore, StoreError, SyncBatch};
use crate::census::CensusSnapshot;
use crate::types::{BlockNumber, ChainId, KeyHash, Process, ProcessId, ProcessStatus, SyncCursor, VoteRecord};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    cursor: Option<SyncCursor>,
    processes: BTreeMap<ProcessId, Process>,
    votes: BTreeMap<(ProcessId, KeyHash), VoteRecord>,
    censuses: HashMap<u64, CensusSnapshot>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessStore for MemoryStore {
    fn init_meta(&self, chain_id: ChainId, start_block: BlockNumber) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match inner.cursor {
            Some(c) if c.chain_id != chain_id => Err(StoreError::ChainIdMismatch {
                stored: c.chain_id,
                requested: chain_id,
            }),
            Some(_) => Ok(()),
            None => {
                inner.cursor = Some(initial_cursor(chain_id, start_block));
                Ok(())
            }
        }
    }

    fn last_sync_block(&self) -> Result<Option<SyncCursor>, StoreError> {
        Ok(self.inner.read().cursor)
    }

    fn store_process(&self, process: &Process) -> Result<(), StoreError> {
        self.inner.write().processes.insert(process.id, process.clone());
        Ok(())
    }

    fn update_process_status(&self, id: ProcessId, status: ProcessStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let p = inner
            .processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;
        p.status = status;
        Ok(())
    }

    fn read_process(&self, id: ProcessId) -> Result<Option<Process>, StoreError> {
        Ok(self.inner.read().processes.get(&id).cloned())
    }

    fn list_processes(&self) -> Result<Vec<Process>, StoreError> {
        Ok(self.inner.read().processes.values().cloned().collect())
    }

    fn record_vote(&self, vote: &VoteRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let key = (vote.process_id, vote.voter_key_hash);
        if inner.votes.contains_key(&key) {
            return Err(StoreError::DuplicateVote {
                process_id: vote.process_id,
                key: hex::encode(vote.voter_key_hash),
            });
        }
        inner.votes.insert(key, vote.clone());
        Ok(())
    }

    fn has_voted(&self, process_id: ProcessId, voter_key_hash: &KeyHash) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .votes
            .contains_key(&(process_id, *voter_key_hash)))
    }

    fn votes_for_process(&self, process_id: ProcessId) -> Result<Vec<VoteRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .votes
            .range((process_id, [0u8; 32])..=(process_id, [0xffu8; 32]))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn commit_sync_batch(&self, batch: SyncBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        check_cursor(inner.cursor, &batch.cursor)?;
        for p in batch.processes {
            inner.processes.insert(p.id, p);
        }
        inner.cursor = Some(batch.cursor);
        Ok(())
    }

    fn put_census(&self, census: &CensusSnapshot) -> Result<(), StoreError> {
        self.inner.write().censuses.insert(census.id, census.clone());
        Ok(())
    }

    fn load_censuses(&self) -> Result<Vec<CensusSnapshot>, StoreError> {
        let mut out: Vec<_> = self.inner.read().censuses.values().cloned().collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(pid: ProcessId, key: u8) -> VoteRecord {
        VoteRecord {
            process_id: pid,
            voter_key_hash: [key; 32],
            weight: 1,
            vote_value: 1,
            accepted_at_block: 10,
        }
    }

    #[test]
    fn init_meta_is_idempotent_per_chain() {
        let s = MemoryStore::new();
        s.init_meta(5, 100).unwrap();
        s.init_meta(5, 900).unwrap();
        assert_eq!(s.last_sync_block().unwrap().unwrap().last_synced_block, 99);
        assert!(matches!(
            s.init_meta(6, 100),
            Err(StoreError::ChainIdMismatch { stored: 5, requested: 6 })
        ));
    }

    #[test]
    fn genesis_start_scans_from_block_one() {
        let s = MemoryStore::new();
        s.init_meta(5, 0).unwrap();
        assert_eq!(s.last_sync_block().unwrap().unwrap().last_synced_block, 0);
        s.init_meta(5, 1).unwrap();
        assert_eq!(s.last_sync_block().unwrap().unwrap().last_synced_block, 0);
    }

    #[test]
    fn duplicate_vote_is_rejected() {
        let s = MemoryStore::new();
        s.record_vote(&vote(1, 7)).unwrap();
        assert!(s.has_voted(1, &[7; 32]).unwrap());
        assert!(!s.has_voted(2, &[7; 32]).unwrap());
        assert!(matches!(
            s.record_vote(&vote(1, 7)),
            Err(StoreError::DuplicateVote { process_id: 1, .. })
        ));
        s.record_vote(&vote(2, 7)).unwrap();
    }

    #[test]
    fn votes_are_scoped_and_ordered() {
        let s = MemoryStore::new();
        s.record_vote(&vote(1, 9)).unwrap();
        s.record_vote(&vote(1, 2)).unwrap();
        s.record_vote(&vote(2, 1)).unwrap();
        let keys: Vec<u8> = s
            .votes_for_process(1)
            .unwrap()
            .iter()
            .map(|v| v.voter_key_hash[0])
            .collect();
        assert_eq!(keys, vec![2, 9]);
    }

    #[test]
    fn regressing_batch_writes_nothing() {
        let s = MemoryStore::new();
        s.init_meta(1, 50).unwrap();
        let p = Process {
            id: 3,
            census_root: [0; 32],
            census_size: 1,
            status: ProcessStatus::On,
            created_block: 40,
            res_pub_start_block: 60,
            res_pub_window: 5,
            min_participation: 0,
            typ: 0,
            result: None,
            n_votes: 0,
        };
        let err = s
            .commit_sync_batch(SyncBatch {
                processes: vec![p],
                cursor: SyncCursor {
                    chain_id: 1,
                    last_synced_block: 10,
                },
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::CursorRegression { current: 49, proposed: 10 }));
        assert!(s.read_process(3).unwrap().is_none());
    }
}
