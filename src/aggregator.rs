// src/aggregator.rs
//! Results aggregator
//!
//! Keeps a running weighted tally per process as votes are admitted and, once
//! the chain enters a process's publication window, asks the prover for a
//! result proof. Each process gets at most `max_attempts` submissions; a job
//! that exhausts them stays `Failed` until an operator intervenes.

use crate::prover::{ProofRequest, ProofStatus, ProverError, ProverGateway, RequestId};
use crate::storage::{ProcessStore, StoreError};
use crate::types::{BlockNumber, ChainId, Process, ProcessId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Total submissions per process, first attempt included
    pub max_attempts: u32,
    /// Pending requests older than this are treated as failed
    pub proof_timeout: Duration,
    /// How often pending jobs are polled between height changes
    pub poll_interval: Duration,
    pub enabled: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            proof_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    /// vote value -> summed weight
    pub votes: BTreeMap<u64, u64>,
    pub n_votes: u64,
}

impl Tally {
    fn add(&mut self, weight: u64, value: u64) {
        let w = self.votes.entry(value).or_insert(0);
        *w = w.saturating_add(weight);
        self.n_votes += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum JobState {
    Pending {
        request_id: RequestId,
        attempt: u32,
        submitted_at_block: BlockNumber,
        submitted_at: DateTime<Utc>,
        /// the prover cannot be polled; the proof arrives out of band and
        /// the job is no longer expired or resubmitted
        out_of_band: bool,
    },
    /// Last submission failed; `attempt` goes out on the next pass
    Queued {
        attempt: u32,
        reason: String,
    },
    Ready {
        proof: String,
    },
    Failed {
        reason: String,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofJob {
    pub process_id: ProcessId,
    pub state: JobState,
    #[serde(skip)]
    request: ProofRequest,
    #[serde(skip)]
    started: Instant,
}

/// Counters from one pass over the jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub submitted: u64,
    pub retried: u64,
    pub ready: u64,
    pub failed: u64,
}

enum Step {
    Submit(ProofRequest, u32),
    /// poll, then expire with the given reason if the proof is still pending
    Check {
        request_id: RequestId,
        request: ProofRequest,
        attempt: u32,
        expire: Option<String>,
    },
}

pub struct ResultsAggregator {
    store: Arc<dyn ProcessStore>,
    prover: Arc<dyn ProverGateway>,
    chain_id: ChainId,
    config: AggregatorConfig,
    tallies: RwLock<HashMap<ProcessId, Tally>>,
    jobs: Mutex<HashMap<ProcessId, ProofJob>>,
}

impl ResultsAggregator {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        prover: Arc<dyn ProverGateway>,
        chain_id: ChainId,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            prover,
            chain_id,
            config,
            tallies: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild tallies from persisted vote records. Returns the number of votes replayed.
    pub fn rebuild(&self) -> Result<u64, StoreError> {
        let mut tallies = HashMap::new();
        let mut replayed = 0;
        for p in self.store.list_processes()? {
            let votes = self.store.votes_for_process(p.id)?;
            if votes.is_empty() {
                continue;
            }
            let tally: &mut Tally = tallies.entry(p.id).or_default();
            for v in votes {
                tally.add(v.weight, v.vote_value);
                replayed += 1;
            }
        }
        *self.tallies.write() = tallies;
        if replayed > 0 {
            log::info!("rebuilt tallies from {} stored votes", replayed);
        }
        Ok(replayed)
    }

    /// Count one accepted vote.
    pub fn record(&self, process_id: ProcessId, weight: u64, vote_value: u64) {
        self.tallies
            .write()
            .entry(process_id)
            .or_default()
            .add(weight, vote_value);
    }

    pub fn tally(&self, process_id: ProcessId) -> Tally {
        self.tallies
            .read()
            .get(&process_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn job(&self, process_id: ProcessId) -> Option<ProofJob> {
        self.jobs.lock().get(&process_id).cloned()
    }

    pub fn jobs(&self) -> Vec<ProofJob> {
        let mut out: Vec<_> = self.jobs.lock().values().cloned().collect();
        out.sort_by_key(|j| j.process_id);
        out
    }

    fn build_request(&self, p: &Process) -> Result<ProofRequest, StoreError> {
        let tally = self.tally(p.id);
        Ok(ProofRequest {
            chain_id: self.chain_id,
            process_id: p.id,
            census_root: p.census_root,
            tally: tally.votes,
            n_votes: tally.n_votes,
            witness: self.store.votes_for_process(p.id)?,
        })
    }

    /// Advance every job for chain height `height`.
    pub async fn tick(&self, height: BlockNumber) -> Result<TickStats, StoreError> {
        let mut stats = TickStats::default();
        let processes = self.store.list_processes()?;

        let mut steps = Vec::new();
        {
            let jobs = self.jobs.lock();
            for p in &processes {
                let Some(job) = jobs.get(&p.id) else {
                    if p.in_publication_window(height) && !p.status.is_event_driven() {
                        steps.push((p.id, Step::Submit(self.build_request(p)?, 1)));
                    }
                    continue;
                };
                match &job.state {
                    JobState::Queued { attempt, .. } => {
                        steps.push((p.id, Step::Submit(job.request.clone(), *attempt)));
                    }
                    JobState::Pending {
                        request_id,
                        attempt,
                        submitted_at_block,
                        out_of_band: false,
                        ..
                    } => {
                        let end = p.res_pub_end_block();
                        let expire = if *submitted_at_block < end && height >= end {
                            Some(format!("publication window closed at block {}", end))
                        } else if job.started.elapsed() >= self.config.proof_timeout {
                            Some(format!("no proof after {:?}", self.config.proof_timeout))
                        } else {
                            None
                        };
                        steps.push((
                            p.id,
                            Step::Check {
                                request_id: *request_id,
                                request: job.request.clone(),
                                attempt: *attempt,
                                expire,
                            },
                        ));
                    }
                    JobState::Pending { .. } | JobState::Ready { .. } | JobState::Failed { .. } => {}
                }
            }
        }

        for (pid, step) in steps {
            match step {
                Step::Submit(req, attempt) => {
                    self.submit(pid, req, attempt, height, &mut stats).await;
                }
                Step::Check {
                    request_id,
                    request,
                    attempt,
                    expire,
                } => match self.prover.poll(request_id).await {
                    Ok(ProofStatus::Ready(proof)) => {
                        log::info!("proof for process {} ready ({} bytes)", pid, proof.len());
                        self.set_state(
                            pid,
                            JobState::Ready {
                                proof: hex::encode(proof),
                            },
                        );
                        stats.ready += 1;
                    }
                    Ok(ProofStatus::Error(msg)) => {
                        self.retry_or_fail(pid, request, attempt, msg, height, &mut stats)
                            .await;
                    }
                    Err(ProverError::NotImplemented(what)) => {
                        log::info!(
                            "process {}: {} unavailable, proof request {} left for out-of-band delivery",
                            pid,
                            what,
                            request_id
                        );
                        self.mark_out_of_band(pid);
                    }
                    other => {
                        if let Err(e) = &other {
                            log::warn!("polling proof for process {} failed: {}", pid, e);
                        }
                        if let Some(reason) = expire {
                            self.retry_or_fail(pid, request, attempt, reason, height, &mut stats)
                                .await;
                        }
                    }
                },
            }
        }
        Ok(stats)
    }

    fn set_state(&self, pid: ProcessId, state: JobState) {
        if let Some(job) = self.jobs.lock().get_mut(&pid) {
            job.state = state;
        }
    }

    fn mark_out_of_band(&self, pid: ProcessId) {
        if let Some(job) = self.jobs.lock().get_mut(&pid) {
            if let JobState::Pending { out_of_band, .. } = &mut job.state {
                *out_of_band = true;
            }
        }
    }

    /// Submit `request`. A transport failure queues the next attempt for the
    /// following pass until the attempt budget is spent.
    async fn submit(
        &self,
        pid: ProcessId,
        request: ProofRequest,
        attempt: u32,
        height: BlockNumber,
        stats: &mut TickStats,
    ) {
        let state = match self.prover.submit(&request).await {
            Ok(id) => {
                if attempt == 1 {
                    stats.submitted += 1;
                } else {
                    stats.retried += 1;
                }
                JobState::Pending {
                    request_id: id,
                    attempt,
                    submitted_at_block: height,
                    submitted_at: Utc::now(),
                    out_of_band: false,
                }
            }
            Err(e) if attempt < self.config.max_attempts => {
                log::warn!(
                    "proof submission for process {} failed (attempt {}/{}): {}, retrying next pass",
                    pid,
                    attempt,
                    self.config.max_attempts,
                    e
                );
                JobState::Queued {
                    attempt: attempt + 1,
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                self.exhausted(pid, attempt, e.to_string(), stats);
                JobState::Failed {
                    reason: e.to_string(),
                    attempts: attempt,
                }
            }
        };
        self.jobs.lock().insert(
            pid,
            ProofJob {
                process_id: pid,
                state,
                request,
                started: Instant::now(),
            },
        );
    }

    async fn retry_or_fail(
        &self,
        pid: ProcessId,
        request: ProofRequest,
        attempt: u32,
        reason: String,
        height: BlockNumber,
        stats: &mut TickStats,
    ) {
        if attempt < self.config.max_attempts {
            log::warn!(
                "proof for process {} failed ({}), resubmitting (attempt {}/{})",
                pid,
                reason,
                attempt + 1,
                self.config.max_attempts
            );
            self.submit(pid, request, attempt + 1, height, stats).await;
        } else {
            self.set_state(
                pid,
                JobState::Failed {
                    reason: reason.clone(),
                    attempts: attempt,
                },
            );
            self.exhausted(pid, attempt, reason, stats);
        }
    }

    fn exhausted(&self, pid: ProcessId, attempts: u32, reason: String, stats: &mut TickStats) {
        log::error!(
            "proof for process {} failed after {} attempts: {}; manual intervention required",
            pid,
            attempts,
            reason
        );
        stats.failed += 1;
    }

    /// Drive the aggregator from committed heights until `cancel` fires.
    pub fn start(
        self: Arc<Self>,
        mut heights: watch::Receiver<BlockNumber>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                log::info!("results aggregator disabled");
                return;
            }
            log::info!(
                "starting results aggregator (max attempts {}, poll every {:?})",
                self.config.max_attempts,
                self.config.poll_interval
            );
            let mut interval = tokio::time::interval(self.config.poll_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = heights.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = interval.tick() => {}
                }
                let height = *heights.borrow();
                match self.tick(height).await {
                    Ok(stats) if stats != TickStats::default() => {
                        log::info!(
                            "aggregator at block {}: {} submitted, {} retried, {} ready, {} failed",
                            height,
                            stats.submitted,
                            stats.retried,
                            stats.ready,
                            stats.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("aggregator pass at block {} failed: {}", height, e),
                }
            }
            log::info!("results aggregator stopped");
        })
    }
}
