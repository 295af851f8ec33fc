//! JSON-RPC 2.0 client for the managed node
//!
//! Thin transport shared by the health probes and the height monitor. Every
//! request runs under a 5 second deadline; callers treat transport errors,
//! non-200 responses, and JSON-RPC error envelopes uniformly as
//! [`VisorError::Rpc`].

use crate::core::error::{VisorError, VisorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline applied to every RPC request
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Sync state reported by `eth_syncing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// The node reported the literal `false`: fully synced
    Synced,
    /// The node is importing blocks
    Syncing { current: u64, highest: u64 },
}

/// JSON-RPC client bound to a single endpoint
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RpcClient {
    /// Client against `http://localhost:<port>`
    pub fn new(rpc_port: u16) -> Self {
        Self::with_endpoint(format!("http://localhost:{}", rpc_port))
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Issue a single JSON-RPC call and return the `result` value
    pub async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> VisorResult<serde_json::Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| VisorError::Rpc(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VisorError::Rpc(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| VisorError::Rpc(format!("{} returned invalid JSON: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(VisorError::Rpc(format!(
                "{} error {}: {}",
                method, err.code, err.message
            )));
        }

        body.result
            .ok_or_else(|| VisorError::Rpc(format!("{} returned no result", method)))
    }

    /// `web3_clientVersion` — liveness check plus version string
    pub async fn client_version(&self) -> VisorResult<String> {
        let result = self.call("web3_clientVersion", vec![]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VisorError::Rpc("web3_clientVersion returned non-string".to_string()))
    }

    /// `net_peerCount` — connected peer count
    pub async fn peer_count(&self) -> VisorResult<u64> {
        let result = self.call("net_peerCount", vec![]).await?;
        decode_quantity(&result)
    }

    /// `eth_blockNumber` — current chain head height
    pub async fn block_number(&self) -> VisorResult<u64> {
        let result = self.call("eth_blockNumber", vec![]).await?;
        decode_quantity(&result)
    }

    /// `eth_syncing` — `false` when synced, otherwise a progress object
    pub async fn syncing(&self) -> VisorResult<SyncStatus> {
        let result = self.call("eth_syncing", vec![]).await?;
        match result {
            serde_json::Value::Bool(false) => Ok(SyncStatus::Synced),
            serde_json::Value::Object(obj) => {
                let current = obj
                    .get("currentBlock")
                    .map(decode_quantity)
                    .transpose()?
                    .unwrap_or(0);
                let highest = obj
                    .get("highestBlock")
                    .map(decode_quantity)
                    .transpose()?
                    .unwrap_or(0);
                Ok(SyncStatus::Syncing { current, highest })
            }
            other => Err(VisorError::Rpc(format!(
                "eth_syncing returned unexpected value: {}",
                other
            ))),
        }
    }
}

/// Decode a JSON-RPC quantity: a `0x`-prefixed hex string, or a bare number
pub fn decode_quantity(value: &serde_json::Value) -> VisorResult<u64> {
    match value {
        serde_json::Value::String(s) => {
            let hex = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(hex, 16)
                .map_err(|e| VisorError::Rpc(format!("invalid hex quantity {:?}: {}", s, e)))
        }
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| VisorError::Rpc(format!("invalid numeric quantity: {}", n))),
        other => Err(VisorError::Rpc(format!(
            "expected quantity, got: {}",
            other
        ))),
    }
}
