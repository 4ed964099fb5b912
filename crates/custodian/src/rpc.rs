//! JSON-RPC over HTTP for the handful of Ethereum calls the signing service makes.

use crate::{collab::RpcTransport, config::RpcConfig, errors::KeyringError};
use eyre::Context as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct HttpRpcTransport {
    client: Client,
    next_id: AtomicU64,
}

impl HttpRpcTransport {
    pub fn new(cfg: &RpcConfig) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout())
            .connect_timeout(cfg.connect_timeout())
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

/// Pull `result` out of a JSON-RPC response; an `error` member becomes a transport error.
pub fn unwrap_response(method: &str, body: Value) -> eyre::Result<Value> {
    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_owned);
        return Err(KeyringError::Transport(format!("{method}: {msg}")).into());
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| KeyringError::Transport(format!("{method}: response has no result")).into())
}

#[async_trait::async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn request(&self, url: &str, method: &str, params: Value) -> eyre::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body: Value = self
            .client
            .post(url)
            .json(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .send()
            .await
            .with_context(|| format!("{method} request"))?
            .error_for_status()
            .with_context(|| format!("{method} status"))?
            .json()
            .await
            .with_context(|| format!("{method} json"))?;
        unwrap_response(method, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_member_surfaces_as_transport_error() {
        let r = unwrap_response(
            "eth_sendRawTransaction",
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32000, "message": "already known" }
            }),
        );
        let err = r.err();
        assert!(
            matches!(
                err.as_ref().and_then(|e| e.downcast_ref::<KeyringError>()),
                Some(KeyringError::Transport(m)) if m.contains("already known")
            ),
            "{err:?}"
        );
    }

    #[test]
    fn result_member_is_returned() -> eyre::Result<()> {
        let v = unwrap_response(
            "eth_gasPrice",
            json!({ "jsonrpc": "2.0", "id": 1, "result": "0x3b9aca00" }),
        )?;
        assert_eq!(v, json!("0x3b9aca00"));
        Ok(())
    }
}
