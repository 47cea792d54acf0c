// src/api.rs
// Axum router for census management, vote submission and process queries

use crate::admission::{Admission, RejectReason, VoteAdmission};
use crate::aggregator::{ProofJob, ResultsAggregator, Tally};
use crate::census::{CensusEngine, CensusError, CensusInfo, Membership};
use crate::crypto::{parse_public_key, PublicKeyBytes};
use crate::storage::{ProcessStore, StoreError};
use crate::types::{CensusId, CensusProof, Process, ProcessId, VotePackage, VoteRecord};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub census: Arc<CensusEngine>,
    pub admission: Arc<VoteAdmission>,
    pub aggregator: Arc<ResultsAggregator>,
    pub store: Arc<dyn ProcessStore>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Census(#[from] CensusError),

    #[error(transparent)]
    Rejected(RejectReason),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("public key is not in the census")]
    NotMember,

    /// Body or path could not be extracted; keeps the extractor's status
    #[error("{1}")]
    Malformed(StatusCode, String),
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        ApiError::Malformed(r.status(), r.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(r: PathRejection) -> Self {
        ApiError::Malformed(r.status(), r.body_text())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Census(e) => match e {
                CensusError::SizeMismatch { .. } => (StatusCode::BAD_REQUEST, "size_mismatch"),
                CensusError::DuplicateKey(_) => (StatusCode::CONFLICT, "duplicate_key"),
                CensusError::AlreadyClosed(_) => (StatusCode::CONFLICT, "already_closed"),
                CensusError::StillOpen(_) => (StatusCode::CONFLICT, "census_open"),
                CensusError::NotFound(_) => (StatusCode::NOT_FOUND, "census_not_found"),
                CensusError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Rejected(r) => {
                let status = match r {
                    RejectReason::ProcessNotFound => StatusCode::NOT_FOUND,
                    RejectReason::DuplicateVote => StatusCode::CONFLICT,
                    RejectReason::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, r.code())
            }
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::NotMember => (StatusCode::NOT_FOUND, "not_member"),
            ApiError::Malformed(status, _) => (*status, "bad_request"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self);
        }
        let body = serde_json::json!({ "error": code, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysRequest {
    pub public_keys: Vec<String>,
    pub weights: Vec<u64>,
}

impl KeysRequest {
    fn parse_keys(&self) -> Result<Vec<PublicKeyBytes>, ApiError> {
        self.public_keys
            .iter()
            .map(|k| {
                parse_public_key(k)
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid public key '{}'", k)))
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewCensusResponse {
    census_id: CensusId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseResponse {
    census_id: CensusId,
    census_root: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoteResponse {
    accepted: bool,
    vote: VoteRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    process: Process,
    tally: Tally,
    proof_job: Option<ProofJob>,
}

async fn new_census(
    State(st): State<AppState>,
    req: Result<Json<KeysRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    let keys = req.parse_keys()?;
    if keys.len() != req.weights.len() {
        return Err(CensusError::SizeMismatch {
            keys: keys.len(),
            weights: req.weights.len(),
        }
        .into());
    }
    let census_id = st.census.open()?;
    st.census.add_keys(census_id, &keys, &req.weights)?;
    Ok((StatusCode::CREATED, Json(NewCensusResponse { census_id })))
}

async fn add_keys(
    State(st): State<AppState>,
    id: Result<Path<CensusId>, PathRejection>,
    req: Result<Json<KeysRequest>, JsonRejection>,
) -> Result<Json<CensusInfo>, ApiError> {
    let (Path(id), Json(req)) = (id?, req?);
    let keys = req.parse_keys()?;
    st.census.add_keys(id, &keys, &req.weights)?;
    Ok(Json(st.census.info(id)?))
}

async fn close_census(
    State(st): State<AppState>,
    id: Result<Path<CensusId>, PathRejection>,
) -> Result<Json<CloseResponse>, ApiError> {
    let Path(id) = id?;
    let root = st.census.close(id)?;
    Ok(Json(CloseResponse {
        census_id: id,
        census_root: hex::encode(root),
    }))
}

async fn get_census(
    State(st): State<AppState>,
    id: Result<Path<CensusId>, PathRejection>,
) -> Result<Json<CensusInfo>, ApiError> {
    let Path(id) = id?;
    Ok(Json(st.census.info(id)?))
}

async fn merkle_proof(
    State(st): State<AppState>,
    path: Result<Path<(CensusId, String)>, PathRejection>,
) -> Result<Json<CensusProof>, ApiError> {
    let Path((id, pubkey)) = path?;
    let pk = parse_public_key(&pubkey)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid public key '{}'", pubkey)))?;
    match st.census.prove(id, &pk)? {
        Membership::Member(proof) => Ok(Json(proof)),
        Membership::NonMember => Err(ApiError::NotMember),
    }
}

async fn submit_vote(
    State(st): State<AppState>,
    pid: Result<Path<ProcessId>, PathRejection>,
    package: Result<Json<VotePackage>, JsonRejection>,
) -> Result<Json<VoteResponse>, ApiError> {
    let (Path(pid), Json(package)) = (pid?, package?);
    match st.admission.admit(pid, &package) {
        Admission::Accepted(vote) => Ok(Json(VoteResponse {
            accepted: true,
            vote,
        })),
        Admission::Rejected(reason) => Err(ApiError::Rejected(reason)),
    }
}

async fn get_process(
    State(st): State<AppState>,
    pid: Result<Path<ProcessId>, PathRejection>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let Path(pid) = pid?;
    let process = st
        .store
        .read_process(pid)?
        .ok_or_else(|| ApiError::NotFound(format!("process {} not found", pid)))?;
    Ok(Json(ProcessResponse {
        process,
        tally: st.aggregator.tally(pid),
        proof_job: st.aggregator.job(pid),
    }))
}

async fn list_proofs(State(st): State<AppState>) -> Json<Vec<ProofJob>> {
    Json(st.aggregator.jobs())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/census", post(new_census))
        .route("/census/:id", get(get_census))
        .route("/census/:id/keys", post(add_keys))
        .route("/census/:id/close", post(close_census))
        .route("/census/:id/merkleproof/:pubkey", get(merkle_proof))
        .route("/process/:id", post(submit_vote).get(get_process))
        .route("/proofs", get(list_proofs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
