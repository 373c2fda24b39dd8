//! Error taxonomy for the runtime.
//!
//! Tool and provider failures are usually carried inside an
//! [`RpcOutcome`](crate::transport::RpcOutcome) so the agent loop can feed
//! them back to the model; `RuntimeError` covers the failures that
//! terminate a request instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Malformed provider or model configuration. Fatal at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network, 5xx, timeout, or malformed JSON-RPC after retries.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response id mismatch or missing required fields.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every candidate model failed; surfaced to callers as a 500-class
    /// response.
    #[error("all model candidates failed: {0}")]
    ModelExhausted(String),
}
