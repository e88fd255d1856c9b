use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use super::{error::RpcError, types::JsonRpcResponse};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// JSON-RPC 2.0 over HTTP POST with transient-failure retries.
pub(crate) struct JsonRpcClient {
    endpoint: Url,
    access_token: Option<String>,
    client: reqwest_middleware::ClientWithMiddleware,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn with_config(
        endpoint: Url,
        access_token: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let inner_client = reqwest::Client::builder().timeout(timeout).build()?;

        let client = reqwest_middleware::ClientBuilder::new(inner_client)
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            endpoint,
            access_token: access_token.filter(|t| !t.is_empty()),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Calls `method`, treating a null result as [`RpcError::EmptyResponse`].
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, RpcError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::EmptyResponse(method.to_string()))
    }

    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, RpcError> {
        let start = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        trace!(method = method, id = id; "RPC request");

        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&body)?);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read response body".into());
            return Err(RpcError::ServerError { status, body });
        }

        let response: JsonRpcResponse<T> = resp.json().await?;
        debug!(
            method = method,
            elapsed_ms = start.elapsed().as_millis() as u64;
            "RPC call completed"
        );

        if let Some(err) = response.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result)
    }
}
