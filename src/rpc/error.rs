//! Error types for the chain client.

use thiserror::Error;

/// Errors raised while talking to the Lotus JSON-RPC endpoint.
///
/// Every variant except [`RpcError::Url`] is treated as transient by the
/// scanner: the height is recorded for reconciliation and retried later.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The HTTP request failed due to a network or connection error.
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// An error occurred in the retry middleware, usually after all retries were spent.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    /// The node answered with a non-success HTTP status.
    #[error("Server error {status}: {body}")]
    ServerError { status: reqwest::StatusCode, body: String },

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON-RPC error object returned by the node.
    #[error("[{code}]{message}")]
    Node { code: i64, message: String },

    /// The call succeeded but carried a null result.
    #[error("Empty result for {0}")]
    EmptyResponse(String),

    #[error("Unknown block hash {0}")]
    UnknownBlockHash(String),

    /// A value-bearing message has no receipt yet.
    #[error("block has no receipt yet: {0}")]
    ReceiptUnavailable(String),

    #[error("Malformed node data: {0}")]
    Malformed(String),
}
