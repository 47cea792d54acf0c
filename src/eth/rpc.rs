// src/eth/rpc.rs
// Ethereum JSON-RPC ledger adapter (eth_chainId, eth_blockNumber, eth_getLogs)

use super::{EventKind, LedgerError, LedgerSource, RawLog};
use crate::types::{BlockNumber, ChainId};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tiny_keccak::{Hasher, Keccak};

/// Keccak-256 of an event signature, as a 0x-prefixed log topic.
pub fn event_topic(signature: &str) -> String {
    let mut k = Keccak::v256();
    k.update(signature.as_bytes());
    let mut out = [0u8; 32];
    k.finalize(&mut out);
    format!("0x{}", hex::encode(out))
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    #[serde(default)]
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

pub struct EthRpcLedger {
    client: Client,
    url: String,
    contract: String,
    topics: Vec<(String, EventKind)>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl EthRpcLedger {
    pub fn new(url: impl Into<String>, contract: &str, timeout: Duration) -> Self {
        let topics = EventKind::ALL
            .iter()
            .map(|k| (event_topic(k.signature()), *k))
            .collect();
        Self {
            client: Client::new(),
            url: url.into(),
            contract: format!("0x{}", contract.trim_start_matches("0x").to_lowercase()),
            topics,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("{}: {}", method, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Unavailable(format!("{}: {} - {}", method, status, txt)));
        }

        let parsed: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))?;
        if let Some(err) = parsed.error {
            return Err(rpc_error(method, err.code, &err.message));
        }
        parsed
            .result
            .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: empty result", method)))
    }

    /// Convert a log into a `RawLog`; logs with an unknown topic are skipped.
    pub(crate) fn parse_log(&self, log: RpcLog) -> Result<Option<RawLog>, LedgerError> {
        if log.removed {
            return Ok(None);
        }
        let kind = match log
            .topics
            .first()
            .and_then(|t| self.topics.iter().find(|(topic, _)| topic.eq_ignore_ascii_case(t)))
        {
            Some((_, kind)) => *kind,
            None => return Ok(None),
        };
        let block_number = log
            .block_number
            .as_deref()
            .ok_or_else(|| LedgerError::InvalidResponse("log without block number".into()))
            .and_then(parse_quantity)?;
        let log_index = log
            .log_index
            .as_deref()
            .map(parse_quantity)
            .transpose()?
            .unwrap_or_default();
        let data = hex::decode(log.data.trim_start_matches("0x"))
            .map_err(|e| LedgerError::InvalidResponse(format!("log data: {}", e)))?;
        Ok(Some(RawLog {
            block_number,
            log_index,
            kind,
            data,
        }))
    }
}

fn parse_quantity(s: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::InvalidResponse(format!("quantity {:?}: {}", s, e)))
}

fn quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

#[async_trait]
impl LedgerSource for EthRpcLedger {
    async fn chain_id(&self) -> Result<ChainId, LedgerError> {
        let raw: String = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn head_block(&self) -> Result<BlockNumber, LedgerError> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<RawLog>, LedgerError> {
        let topics: Vec<&str> = self.topics.iter().map(|(t, _)| t.as_str()).collect();
        let filter = json!([{
            "address": self.contract,
            "fromBlock": quantity(from),
            "toBlock": quantity(to),
            "topics": [topics],
        }]);
        let raw: Vec<RpcLog> = self.call("eth_getLogs", filter).await?;
        let mut out = Vec::with_capacity(raw.len());
        for log in raw {
            if let Some(l) = self.parse_log(log)? {
                out.push(l);
            }
        }
        out.sort_by_key(|l| (l.block_number, l.log_index));
        log::debug!("eth_getLogs [{}, {}]: {} logs", from, to, out.len());
        Ok(out)
    }
}

/// Map a JSON-RPC error object. Malformed requests, unknown methods and bad
/// params will fail the same way on every attempt; everything else (rate
/// limits, server-side -32000 range) is retried.
pub(crate) fn rpc_error(method: &str, code: i64, message: &str) -> LedgerError {
    let detail = format!("{}: rpc error {}: {}", method, code, message);
    match code {
        -32700 | -32600 | -32601 | -32602 => LedgerError::InvalidResponse(detail),
        _ => LedgerError::Unavailable(detail),
    }
}
