// src/prover.rs
//! Client side of the external proof-generation service.

use crate::types::{ChainId, Hash, ProcessId, VoteRecord};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub type RequestId = u64;

/// Inputs handed to the prover for one process. Resubmissions reuse the
/// same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRequest {
    #[serde(rename = "chainID")]
    pub chain_id: ChainId,
    #[serde(rename = "processID")]
    pub process_id: ProcessId,
    #[serde(with = "crate::types::hex_bytes")]
    pub census_root: Hash,
    /// vote value -> summed weight
    pub tally: BTreeMap<u64, u64>,
    pub n_votes: u64,
    /// accepted votes ordered by voter key hash
    pub witness: Vec<VoteRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofStatus {
    Pending,
    Ready(Vec<u8>),
    Error(String),
}

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("prover unreachable: {0}")]
    Transport(String),
    #[error("prover rejected request: {0}")]
    Rejected(String),
    #[error("unexpected prover response: {0}")]
    InvalidResponse(String),
    #[error("{0} is not implemented by the prover")]
    NotImplemented(&'static str),
}

#[async_trait]
pub trait ProverGateway: Send + Sync {
    async fn submit(&self, request: &ProofRequest) -> Result<RequestId, ProverError>;

    async fn poll(&self, id: RequestId) -> Result<ProofStatus, ProverError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: u64,
}

#[derive(Deserialize)]
struct ErrorMessage {
    message: String,
}

/// HTTP client for the prover server.
pub struct HttpProver {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpProver {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ProverGateway for HttpProver {
    async fn submit(&self, request: &ProofRequest) -> Result<RequestId, ProverError> {
        let resp = self
            .client
            .post(format!("{}/proof", self.url))
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProverError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProverError::Transport(e.to_string()))?;

        if status == StatusCode::BAD_REQUEST {
            let msg: ErrorMessage = serde_json::from_slice(&body)
                .map_err(|e| ProverError::InvalidResponse(e.to_string()))?;
            return Err(ProverError::Rejected(msg.message));
        }
        if !status.is_success() {
            return Err(ProverError::Transport(format!(
                "{} - {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: SubmitResponse = serde_json::from_slice(&body)
            .map_err(|e| ProverError::InvalidResponse(e.to_string()))?;
        log::info!(
            "proof for process {} submitted to prover, request id {}",
            request.process_id,
            parsed.id
        );
        Ok(parsed.id)
    }

    /// The prover server exposes no retrieval endpoint; proofs are collected
    /// out of band.
    async fn poll(&self, _id: RequestId) -> Result<ProofStatus, ProverError> {
        Err(ProverError::NotImplemented("proof retrieval"))
    }
}
