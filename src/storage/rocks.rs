// src/storage/rocks.rs
// RocksDB-backed process store

use super::{check_cursor, initial_cursor, vote_key, ProcessStore, StoreError, SyncBatch};
use crate::census::CensusSnapshot;
use crate::types::{BlockNumber, ChainId, KeyHash, Process, ProcessId, ProcessStatus, SyncCursor, VoteRecord};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

const CF_META: &str = "meta";
const CF_PROCESSES: &str = "processes";
const CF_VOTES: &str = "votes";
const CF_CENSUSES: &str = "censuses";

const CURSOR_KEY: &[u8] = b"cursor";

pub struct RocksStore {
    db: Arc<DB>,
    /// serialises read-check-write sequences on the cursor
    meta_lock: Mutex<()>,
    /// serialises the duplicate check in `record_vote` with its write
    vote_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store under `path`, retrying while another
    /// process still holds the lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut attempt = 0u32;
        let max_attempts = 5u32;
        let mut wait = 250u64;

        loop {
            match open_rocksdb_internal(path) {
                Ok(db) => {
                    log::info!("process store opened at {}", path.display());
                    return Ok(Self {
                        db: Arc::new(db),
                        meta_lock: Mutex::new(()),
                        vote_lock: Mutex::new(()),
                    });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(StoreError::Db(format!(
                            "failed to open RocksDB at '{}' after {} attempts: {}",
                            path.display(),
                            attempt,
                            e
                        )));
                    }
                    log::warn!(
                        "open store attempt {}/{} failed: {}, retrying in {}ms",
                        attempt,
                        max_attempts,
                        e,
                        wait
                    );
                    sleep(Duration::from_millis(wait));
                    wait = std::cmp::min(wait * 2, 2000);
                }
            }
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Db(format!("column family '{}' not found", name)))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<V: Serialize>(&self, cf: &str, key: &[u8], val: &V) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(val)?;
        self.db.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    fn iter_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(self.cf(cf)?, prefix) {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn iter_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

fn open_rocksdb_internal(path: &Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_max_open_files(128);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    let cfs = [CF_META, CF_PROCESSES, CF_VOTES, CF_CENSUSES]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
    DB::open_cf_descriptors(&opts, path, cfs)
}

impl ProcessStore for RocksStore {
    fn init_meta(&self, chain_id: ChainId, start_block: BlockNumber) -> Result<(), StoreError> {
        let _guard = self.meta_lock.lock();
        match self.get::<SyncCursor>(CF_META, CURSOR_KEY)? {
            Some(c) if c.chain_id != chain_id => Err(StoreError::ChainIdMismatch {
                stored: c.chain_id,
                requested: chain_id,
            }),
            Some(_) => Ok(()),
            None => {
                let cursor = initial_cursor(chain_id, start_block);
                log::info!(
                    "initialised store for chain {} at block {}",
                    chain_id,
                    cursor.last_synced_block
                );
                self.put(CF_META, CURSOR_KEY, &cursor)
            }
        }
    }

    fn last_sync_block(&self) -> Result<Option<SyncCursor>, StoreError> {
        self.get(CF_META, CURSOR_KEY)
    }

    fn store_process(&self, process: &Process) -> Result<(), StoreError> {
        self.put(CF_PROCESSES, &process.id.to_be_bytes(), process)
    }

    fn update_process_status(&self, id: ProcessId, status: ProcessStatus) -> Result<(), StoreError> {
        let _guard = self.meta_lock.lock();
        let mut p: Process = self
            .get(CF_PROCESSES, &id.to_be_bytes())?
            .ok_or(StoreError::ProcessNotFound(id))?;
        p.status = status;
        self.put(CF_PROCESSES, &id.to_be_bytes(), &p)
    }

    fn read_process(&self, id: ProcessId) -> Result<Option<Process>, StoreError> {
        self.get(CF_PROCESSES, &id.to_be_bytes())
    }

    fn list_processes(&self) -> Result<Vec<Process>, StoreError> {
        self.iter_all(CF_PROCESSES)
    }

    fn record_vote(&self, vote: &VoteRecord) -> Result<(), StoreError> {
        let key = vote_key(vote.process_id, &vote.voter_key_hash);
        let _guard = self.vote_lock.lock();
        if self.db.get_pinned_cf(self.cf(CF_VOTES)?, &key)?.is_some() {
            return Err(StoreError::DuplicateVote {
                process_id: vote.process_id,
                key: hex::encode(vote.voter_key_hash),
            });
        }
        self.put(CF_VOTES, &key, vote)
    }

    fn has_voted(&self, process_id: ProcessId, voter_key_hash: &KeyHash) -> Result<bool, StoreError> {
        let key = vote_key(process_id, voter_key_hash);
        Ok(self.db.get_pinned_cf(self.cf(CF_VOTES)?, key)?.is_some())
    }

    fn votes_for_process(&self, process_id: ProcessId) -> Result<Vec<VoteRecord>, StoreError> {
        self.iter_prefix(CF_VOTES, &process_id.to_be_bytes())
    }

    fn commit_sync_batch(&self, batch: SyncBatch) -> Result<(), StoreError> {
        let _guard = self.meta_lock.lock();
        check_cursor(self.last_sync_block()?, &batch.cursor)?;

        let cf_processes = self.cf(CF_PROCESSES)?;
        let mut wb = WriteBatch::default();
        for p in &batch.processes {
            wb.put_cf(cf_processes, p.id.to_be_bytes(), serde_json::to_vec(p)?);
        }
        wb.put_cf(self.cf(CF_META)?, CURSOR_KEY, serde_json::to_vec(&batch.cursor)?);
        self.db.write(wb)?;
        Ok(())
    }

    fn put_census(&self, census: &CensusSnapshot) -> Result<(), StoreError> {
        self.put(CF_CENSUSES, &census.id.to_be_bytes(), census)
    }

    fn load_censuses(&self) -> Result<Vec<CensusSnapshot>, StoreError> {
        self.iter_all(CF_CENSUSES)
    }
}
