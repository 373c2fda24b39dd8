//! Request/response HTTP JSON-RPC driver.

use super::{outcome_from_response, response_id_matches, retry_backoff, rpc_request, next_request_id, RpcOutcome, MAX_RETRIES};
use crate::error::RuntimeError;
use log::warn;
use serde_json::Value;
use std::time::Duration;

pub struct HttpDriver {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpDriver {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { client, url, timeout }
    }

    /// POST the request and parse the JSON-RPC response. Network failures
    /// and 5xx responses are retried with exponential backoff; 4xx
    /// responses are terminal. A JSON-RPC `error` payload is a business
    /// error and comes back as `Ok` with `ok=false`.
    pub async fn call(&self, method: &str, params: Value) -> Result<RpcOutcome, RuntimeError> {
        let id = next_request_id();
        let body = rpc_request(method, params, id);

        for attempt in 0..MAX_RETRIES {
            let sent = self
                .client
                .post(&self.url)
                .json(&body)
                .timeout(self.timeout)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(RuntimeError::Transport(format!("failed to reach provider: {err}")));
                }
            };

            let status = resp.status();
            if status.is_server_error() {
                warn!("provider at {} returned {status} (attempt {})", self.url, attempt + 1);
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    continue;
                }
                return Err(RuntimeError::Transport(format!("HTTP {status}")));
            }
            if status.is_client_error() {
                let detail = resp.text().await.unwrap_or_default();
                return Err(RuntimeError::Transport(format!("HTTP {status}: {detail}")));
            }

            let data: Value = resp
                .json()
                .await
                .map_err(|err| RuntimeError::Protocol(format!("invalid JSON-RPC response: {err}")))?;
            if !response_id_matches(&data, id) {
                return Err(RuntimeError::Protocol(format!("response id mismatch (expected {id})")));
            }
            return Ok(outcome_from_response(&data));
        }

        Err(RuntimeError::Transport("max retries exceeded".to_string()))
    }
}
