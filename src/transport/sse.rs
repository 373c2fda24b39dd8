//! Server-sent-events JSON-RPC driver.
//!
//! Some providers answer an RPC POST with an event stream instead of a
//! single body. The driver consumes events until one carries a payload
//! whose id matches the request, which is terminal.

use super::{outcome_from_response, response_id_matches, retry_backoff, rpc_request, next_request_id, RpcOutcome, MAX_RETRIES};
use crate::error::RuntimeError;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, warn};
use serde_json::Value;
use std::time::Duration;

pub struct SseDriver {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl SseDriver {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { client, url, timeout }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<RpcOutcome, RuntimeError> {
        let id = next_request_id();
        let body = rpc_request(method, params, id);

        for attempt in 0..MAX_RETRIES {
            let sent = self
                .client
                .post(&self.url)
                .header("Accept", "text/event-stream, application/json")
                .header("Cache-Control", "no-cache")
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
                return Err(RuntimeError::Transport(format!("HTTP {status}")));
            }

            let mut events = resp.bytes_stream().eventsource();
            let mut stream_error = None;
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
                            debug!("skipping non-JSON SSE event from {}", self.url);
                            continue;
                        };
                        if response_id_matches(&data, id) {
                            return Ok(outcome_from_response(&data));
                        }
                    }
                    Err(err) => {
                        stream_error = Some(err.to_string());
                        break;
                    }
                }
            }

            if attempt + 1 < MAX_RETRIES {
                tokio::time::sleep(retry_backoff(attempt)).await;
                continue;
            }
            return Err(RuntimeError::Transport(match stream_error {
                Some(err) => format!("SSE stream error: {err}"),
                None => "provider stream ended without a matching response".to_string(),
            }));
        }

        Err(RuntimeError::Transport("max retries exceeded".to_string()))
    }
}
