//! Transport drivers for tool providers.
//!
//! Three drivers share one contract: send a JSON-RPC 2.0 request, return
//! an [`RpcOutcome`]. The gateway constructs the right variant from the
//! provider configuration and never branches on transport again.

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpDriver;
pub use sse::SseDriver;
pub use stdio::{StdioChild, StdioDriver};

use crate::config::{ProviderConfig, TransportKind};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub(crate) const MAX_RETRIES: usize = 3;
pub(crate) const BASE_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn retry_backoff(attempt: usize) -> Duration {
    BASE_BACKOFF * (1u32 << attempt.min(8) as u32)
}

// ============================================================================
// Uniform result shape
// ============================================================================

/// Result of one transport call, also used verbatim for tool outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct RpcOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

// ============================================================================
// JSON-RPC plumbing
// ============================================================================

/// Millisecond-timestamp request ids with a counter suffix so concurrent
/// calls in the same millisecond stay distinct.
pub fn next_request_id() -> i64 {
    static COUNTER: AtomicI64 = AtomicI64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
    chrono::Utc::now().timestamp_millis() * 1000 + seq
}

pub fn rpc_request(method: &str, params: Value, id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    })
}

/// Map a matched JSON-RPC response body onto the uniform outcome.
pub(crate) fn outcome_from_response(data: &Value) -> RpcOutcome {
    if let Some(result) = data.get("result") {
        RpcOutcome::success(result.clone())
    } else if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        RpcOutcome::failure(message)
    } else {
        RpcOutcome::failure("response carried neither result nor error")
    }
}

pub(crate) fn response_id_matches(data: &Value, id: i64) -> bool {
    data.get("id").and_then(Value::as_i64) == Some(id)
}

// ============================================================================
// Tagged driver
// ============================================================================

/// One driver per provider, with per-variant private state.
pub enum TransportDriver {
    Http(HttpDriver),
    Sse(SseDriver),
    Stdio(StdioDriver),
}

impl TransportDriver {
    pub fn from_config(cfg: &ProviderConfig, client: &reqwest::Client, timeout: Duration) -> Self {
        match cfg.transport {
            TransportKind::Http => TransportDriver::Http(HttpDriver::new(
                client.clone(),
                cfg.url.clone().unwrap_or_default(),
                timeout,
            )),
            TransportKind::Sse => TransportDriver::Sse(SseDriver::new(
                client.clone(),
                cfg.url.clone().unwrap_or_default(),
                timeout,
            )),
            TransportKind::Stdio => {
                TransportDriver::Stdio(StdioDriver::new(&cfg.name, cfg.cmd.clone(), cfg.env.clone()))
            }
        }
    }

    /// Transport-class failures come back as `Err`; a JSON-RPC `error`
    /// payload means the tool executed and is carried inside the outcome.
    pub async fn call(&self, method: &str, params: Value) -> Result<RpcOutcome, crate::error::RuntimeError> {
        match self {
            TransportDriver::Http(driver) => driver.call(method, params).await,
            TransportDriver::Sse(driver) => driver.call(method, params).await,
            TransportDriver::Stdio(driver) => driver.call(method, params).await,
        }
    }

    pub fn stdio(&self) -> Option<&StdioDriver> {
        match self {
            TransportDriver::Stdio(driver) => Some(driver),
            _ => None,
        }
    }
}
