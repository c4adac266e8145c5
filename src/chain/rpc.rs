//! EVM JSON-RPC client.
//!
//! Covers exactly the method set the submitter needs. The trait seam keeps
//! the submitter testable against a scripted chain; `HttpRpc` is the
//! production implementation.

use crate::types::Asset;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Endpoint unreachable or responding garbage; retried at cycle level.
    #[error("rpc transport: {0}")]
    Transport(String),
    /// The node answered with an error object.
    #[error("rpc node error {code}: {message}")]
    Node { code: i64, message: String },
}

impl RpcError {
    pub fn is_underpriced(&self) -> bool {
        matches!(self, RpcError::Node { message, .. }
            if message.to_lowercase().contains("underpriced"))
    }

    pub fn is_nonce_error(&self) -> bool {
        matches!(self, RpcError::Node { message, .. }
            if message.to_lowercase().contains("nonce"))
    }

    pub fn is_already_known(&self) -> bool {
        matches!(self, RpcError::Node { message, .. }
            if message.to_lowercase().contains("already known"))
    }
}

/// Transaction receipt fields the submitter consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub status_ok: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// The §6 EVM method set.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;
    /// `eth_getTransactionCount` at the given block tag ("latest" or "pending").
    async fn transaction_count(&self, address: &str, tag: &str) -> Result<u64, RpcError>;
    async fn gas_price(&self) -> Result<u128, RpcError>;
    async fn estimate_gas(&self, from: &str, to: &Asset, data: &[u8]) -> Result<u64, RpcError>;
    /// Returns the transaction hash.
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError>;
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError>;
    async fn block_number(&self) -> Result<u64, RpcError>;
    async fn call(&self, to: &Asset, data: &[u8]) -> Result<Vec<u8>, RpcError>;
}

pub struct HttpRpc {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl HttpRpc {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), request_id: AtomicU64::new(1) }
    }

    #[instrument(skip(self, params), fields(method = method))]
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RpcError::Transport(format!("http {}", response.status())));
        }

        let envelope: RpcEnvelope =
            response.json().await.map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(err) = envelope.error {
            return Err(RpcError::Node { code: err.code, message: err.message });
        }
        // A null result is legitimate (e.g. no receipt yet); let the caller's
        // target type decide whether null is acceptable.
        let result = envelope.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| RpcError::Transport(e.to_string()))
    }
}

/// Parse a 0x-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Transport(format!("bad hex quantity {s:?}: {e}")))
}

pub fn parse_hex_u128(s: &str) -> Result<u128, RpcError> {
    u128::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Transport(format!("bad hex quantity {s:?}: {e}")))
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let hex: String = self.request("eth_chainId", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn transaction_count(&self, address: &str, tag: &str) -> Result<u64, RpcError> {
        let hex: String =
            self.request("eth_getTransactionCount", json!([address, tag])).await?;
        parse_hex_u64(&hex)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let hex: String = self.request("eth_gasPrice", json!([])).await?;
        parse_hex_u128(&hex)
    }

    async fn estimate_gas(&self, from: &str, to: &Asset, data: &[u8]) -> Result<u64, RpcError> {
        let call = json!({
            "from": from,
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(data)),
        });
        let hex: String = self.request("eth_estimateGas", json!([call])).await?;
        parse_hex_u64(&hex)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError> {
        let raw_hex = format!("0x{}", hex::encode(raw));
        let tx_hash: String =
            self.request("eth_sendRawTransaction", json!([raw_hex])).await?;
        debug!(tx_hash, "raw transaction broadcast");
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        let value: Option<Value> =
            self.request("eth_getTransactionReceipt", json!([tx_hash])).await?;
        let Some(value) = value else { return Ok(None) };
        let status = value.get("status").and_then(Value::as_str).unwrap_or("0x0");
        let block_number = value
            .get("blockNumber")
            .and_then(Value::as_str)
            .map(parse_hex_u64)
            .transpose()?
            .unwrap_or(0);
        let gas_used = value
            .get("gasUsed")
            .and_then(Value::as_str)
            .map(parse_hex_u64)
            .transpose()?
            .unwrap_or(0);
        Ok(Some(TxReceipt { status_ok: status == "0x1", block_number, gas_used }))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let hex: String = self.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn call(&self, to: &Asset, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let call = json!({
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(data)),
        });
        let hex: String = self.request("eth_call", json!([call, "latest"])).await?;
        hex::decode(hex.trim_start_matches("0x"))
            .map_err(|e| RpcError::Transport(format!("bad call result: {e}")))
    }
}
