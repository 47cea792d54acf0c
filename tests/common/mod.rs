// tests/common/mod.rs
// Scripted ledger, recording prover and event payload builders shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ovote_node::eth::{EventKind, LedgerError, LedgerSource, RawLog};
use ovote_node::prover::{ProofRequest, ProofStatus, ProverError, ProverGateway, RequestId};
use ovote_node::types::{BlockNumber, ChainId, Hash, ProcessId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// In-memory ledger whose head and logs are driven by the test.
pub struct ScriptedLedger {
    chain_id: ChainId,
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    requests: Mutex<Vec<(BlockNumber, BlockNumber)>>,
    failures: AtomicU32,
}

impl ScriptedLedger {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
        }
    }

    pub fn set_head(&self, head: BlockNumber) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push(&self, block: BlockNumber, kind: EventKind, data: Vec<u8>) {
        let mut logs = self.logs.lock();
        let log_index = logs.iter().filter(|l| l.block_number == block).count() as u64;
        logs.push(RawLog {
            block_number: block,
            log_index,
            kind,
            data,
        });
    }

    /// Make the next `n` `logs` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Ranges requested through `logs`, successful or not.
    pub fn requested(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LedgerSource for ScriptedLedger {
    async fn chain_id(&self) -> Result<ChainId, LedgerError> {
        Ok(self.chain_id)
    }

    async fn head_block(&self) -> Result<BlockNumber, LedgerError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<RawLog>, LedgerError> {
        self.requests.lock().push((from, to));
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Unavailable("scripted outage".into()));
        }
        let mut out: Vec<RawLog> = self
            .logs
            .lock()
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .cloned()
            .collect();
        out.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(out)
    }
}

/// Prover that records requests and reports whatever status the test sets.
#[derive(Default)]
pub struct RecordingProver {
    pub requests: Mutex<Vec<ProofRequest>>,
    pub status: Mutex<Option<ProofStatus>>,
    next_id: AtomicU64,
}

#[async_trait]
impl ProverGateway for RecordingProver {
    async fn submit(&self, request: &ProofRequest) -> Result<RequestId, ProverError> {
        self.requests.lock().push(request.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn poll(&self, _id: RequestId) -> Result<ProofStatus, ProverError> {
        Ok(self.status.lock().clone().unwrap_or(ProofStatus::Pending))
    }
}

const WORD: usize = 32;

fn put_u64(buf: &mut [u8], word: usize, v: u64) {
    let end = (word + 1) * WORD;
    buf[end - 8..end].copy_from_slice(&v.to_be_bytes());
}

fn put_address(buf: &mut [u8], word: usize, fill: u8) {
    let start = word * WORD;
    for b in &mut buf[start + 12..start + WORD] {
        *b = fill;
    }
}

fn put_reversed(buf: &mut [u8], word: usize, h: &Hash) {
    let start = word * WORD;
    let mut r = *h;
    r.reverse();
    buf[start..start + WORD].copy_from_slice(&r);
}

/// Payload of a ProcessCreated log; `census_root` is given in node byte order.
pub fn process_created(
    process_id: ProcessId,
    census_root: &Hash,
    census_size: u64,
    res_pub_start_block: u64,
    res_pub_window: u64,
) -> Vec<u8> {
    let mut d = vec![0u8; 9 * WORD];
    put_address(&mut d, 0, 0xaa);
    put_u64(&mut d, 1, process_id);
    put_reversed(&mut d, 3, census_root);
    put_u64(&mut d, 4, census_size);
    put_u64(&mut d, 5, res_pub_start_block);
    put_u64(&mut d, 6, res_pub_window);
    d[8 * WORD - 1] = 10; // minParticipation
    d[9 * WORD - 1] = 1; // type
    d
}

pub fn result_published(process_id: ProcessId, result: u64, n_votes: u64) -> Vec<u8> {
    let mut d = vec![0u8; 5 * WORD];
    put_address(&mut d, 0, 0xbb);
    put_u64(&mut d, 1, process_id);
    put_u64(&mut d, 3, result);
    put_u64(&mut d, 4, n_votes);
    d
}

pub fn process_closed(process_id: ProcessId, success_byte: u8) -> Vec<u8> {
    let mut d = vec![0u8; 3 * WORD];
    put_address(&mut d, 0, 0xcc);
    put_u64(&mut d, 1, process_id);
    d[3 * WORD - 1] = success_byte;
    d
}
