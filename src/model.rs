//! Model client: endpoint routing, candidate fallback, and streaming.
//!
//! Model identifiers are namespaced. `ollama:` and `local:` prefixes
//! resolve to the local endpoint with the prefix stripped, bypassing the
//! governance gateway; everything else goes through the gateway base URL.
//! Each request tries an ordered candidate list `[requested, fallback]`,
//! gated per candidate by the circuit breaker.

use crate::breaker::BreakerRegistry;
use crate::config::RuntimeSettings;
use crate::error::RuntimeError;
use crate::health::HealthState;
use crate::protocol::{ChatChunk, ChatCompletion, FunctionTool, Message};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, RuntimeError>> + Send>>;

/// Seam between the agent loop and the model backends, mockable in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[FunctionTool],
    ) -> Result<ChatCompletion, RuntimeError>;

    async fn chat_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[FunctionTool],
    ) -> Result<ChunkStream, RuntimeError>;
}

/// Local models bypass the gateway and never require internet.
pub fn is_local_model(model: &str) -> bool {
    model.starts_with("ollama:") || model.starts_with("local:")
}

pub struct ModelClient {
    client: reqwest::Client,
    settings: Arc<RuntimeSettings>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthState>,
    /// Per-model context-window overrides; anything absent uses the
    /// configured default.
    context_windows: HashMap<&'static str, u64>,
}

impl ModelClient {
    pub fn new(
        client: reqwest::Client,
        settings: Arc<RuntimeSettings>,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthState>,
    ) -> Self {
        let context_windows: HashMap<&'static str, u64> = [
            ("llama3.3:70b", 32_768),
            ("qwen2.5:32b", 32_768),
            ("llama3.1:latest", 32_768),
            ("llama3.2:latest", 32_768),
            ("qwen2.5:7b-instruct", 32_768),
        ]
        .into_iter()
        .collect();

        Self {
            client,
            settings,
            breakers,
            health,
            context_windows,
        }
    }

    /// Resolve a namespaced model id to `(endpoint URL, wire model name)`.
    fn resolve_endpoint(&self, model: &str) -> (String, String) {
        for prefix in ["ollama:", "local:"] {
            if let Some(stripped) = model.strip_prefix(prefix) {
                let base = self.settings.local_model_base.trim_end_matches('/');
                return (format!("{base}/v1/chat/completions"), stripped.to_string());
            }
        }
        let base = self.settings.gateway_base.trim_end_matches('/');
        (format!("{base}/v1/chat/completions"), model.to_string())
    }

    /// Ordered candidate list. When offline, a non-local requested model
    /// is rewritten to the fallback *before* the list is built, so the
    /// remote endpoint is never consulted.
    fn candidates(&self, requested: Option<&str>) -> Vec<String> {
        let mut target = requested.unwrap_or(&self.settings.agent_model).to_string();

        if !self.health.internet_available() && !is_local_model(&target) {
            warn!(
                "offline: rewriting remote model '{target}' to fallback '{}'",
                self.settings.fallback_model
            );
            target = self.settings.fallback_model.clone();
        }

        let mut list = vec![target];
        if self.settings.fallback_enabled && !list.contains(&self.settings.fallback_model) {
            list.push(self.settings.fallback_model.clone());
        }
        list
    }

    fn num_ctx_for(&self, wire_model: &str) -> u64 {
        self.context_windows
            .get(wire_model)
            .copied()
            .unwrap_or(self.settings.num_ctx)
    }

    fn payload(&self, wire_model: &str, messages: &[Message], tools: &[FunctionTool], stream: bool) -> Value {
        let mut payload = json!({
            "model": wire_model,
            "messages": messages,
            "tools": tools,
            "tool_choice": "auto",
            "stream": stream,
            "options": {"num_ctx": self.num_ctx_for(wire_model)},
        });
        if stream {
            payload["stream_options"] = json!({"include_usage": true});
            payload["logprobs"] = json!(true);
            payload["top_logprobs"] = json!(1);
        }
        payload
    }

    fn request(&self, url: &str, payload: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .json(payload)
            .timeout(self.settings.http_timeout);
        if let Some(token) = &self.settings.router_auth_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }
}

#[async_trait]
impl ChatBackend for ModelClient {
    async fn chat(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[FunctionTool],
    ) -> Result<ChatCompletion, RuntimeError> {
        let candidates = self.candidates(model);
        let mut last_error = String::from("no candidates");

        for attempt_model in &candidates {
            if !self.breakers.is_allowed(attempt_model) {
                debug!("model '{attempt_model}' is circuit broken, skipping");
                last_error = format!("model '{attempt_model}' is circuit broken");
                continue;
            }

            let (url, wire_model) = self.resolve_endpoint(attempt_model);
            let payload = self.payload(&wire_model, messages, tools, false);

            let sent = self.request(&url, &payload).send().await;
            let resp = match sent {
                Ok(resp) => resp,
                Err(err) => {
                    self.breakers.record_failure(attempt_model, 1, Some(&err.to_string()));
                    last_error = err.to_string();
                    continue;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let detail = resp.text().await.unwrap_or_default();
                let message = format!("HTTP {status}: {detail}");
                self.breakers.record_failure(attempt_model, 1, Some(&message));
                last_error = message;
                continue;
            }

            match resp.json::<ChatCompletion>().await {
                Ok(completion) => {
                    self.breakers.record_success(attempt_model);
                    if Some(attempt_model.as_str()) != model && model.is_some() {
                        info!("recovered using fallback model '{attempt_model}'");
                    }
                    return Ok(completion);
                }
                Err(err) => {
                    let message = format!("malformed completion: {err}");
                    self.breakers.record_failure(attempt_model, 1, Some(&message));
                    last_error = message;
                }
            }
        }

        Err(RuntimeError::ModelExhausted(last_error))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[FunctionTool],
    ) -> Result<ChunkStream, RuntimeError> {
        let candidates = self.candidates(model);
        let mut last_error = String::from("no candidates");

        for attempt_model in &candidates {
            if !self.breakers.is_allowed(attempt_model) {
                last_error = format!("model '{attempt_model}' is circuit broken");
                continue;
            }

            let (url, wire_model) = self.resolve_endpoint(attempt_model);
            let payload = self.payload(&wire_model, messages, tools, true);

            let sent = self.request(&url, &payload).send().await;
            let resp = match sent {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    let message = format!("HTTP {}", resp.status());
                    self.breakers.record_failure(attempt_model, 1, Some(&message));
                    last_error = message;
                    continue;
                }
                Err(err) => {
                    self.breakers.record_failure(attempt_model, 1, Some(&err.to_string()));
                    last_error = err.to_string();
                    continue;
                }
            };

            let breakers = self.breakers.clone();
            let model_name = attempt_model.clone();
            let stream = async_stream::stream! {
                let mut events = resp.bytes_stream().eventsource();
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => {
                            if event.data == "[DONE]" {
                                break;
                            }
                            // Providers occasionally interleave keep-alive
                            // or vendor frames; skip what doesn't parse.
                            match serde_json::from_str::<ChatChunk>(&event.data) {
                                Ok(chunk) => yield Ok(chunk),
                                Err(err) => debug!("skipping unparseable stream frame: {err}"),
                            }
                        }
                        Err(err) => {
                            breakers.record_failure(&model_name, 1, Some(&err.to_string()));
                            yield Err(RuntimeError::Transport(format!("stream error: {err}")));
                            return;
                        }
                    }
                }
                breakers.record_success(&model_name);
            };
            return Ok(Box::pin(stream));
        }

        Err(RuntimeError::ModelExhausted(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use axum::routing::post;
    use axum::Json;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_settings(local: &str, gateway: &str) -> RuntimeSettings {
        RuntimeSettings {
            local_model_base: local.to_string(),
            gateway_base: gateway.to_string(),
            agent_model: "ollama:llama3.1:latest".to_string(),
            fallback_model: "ollama:llama3.2:latest".to_string(),
            ..RuntimeSettings::default()
        }
    }

    fn client_with(settings: RuntimeSettings) -> (ModelClient, Arc<HealthState>) {
        let health = Arc::new(HealthState::new());
        let client = ModelClient::new(
            reqwest::Client::new(),
            Arc::new(settings),
            Arc::new(BreakerRegistry::new(HashSet::new(), None)),
            health.clone(),
        );
        (client, health)
    }

    /// Minimal chat-completions endpoint counting the POSTs it receives.
    async fn mock_backend(content: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            post(move |Json(_body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "id": "chatcmpl-test",
                        "object": "chat.completion",
                        "created": 0,
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": content},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, hits)
    }

    #[test]
    fn test_endpoint_routing_strips_prefixes() {
        let (client, _) = client_with(test_settings("http://local:11434", "http://gw:5455"));

        let (url, wire) = client.resolve_endpoint("ollama:llama3.1:latest");
        assert_eq!(url, "http://local:11434/v1/chat/completions");
        assert_eq!(wire, "llama3.1:latest");

        let (url, wire) = client.resolve_endpoint("local:mistral");
        assert_eq!(url, "http://local:11434/v1/chat/completions");
        assert_eq!(wire, "mistral");

        let (url, wire) = client.resolve_endpoint("remote:gpt-x");
        assert_eq!(url, "http://gw:5455/v1/chat/completions");
        assert_eq!(wire, "remote:gpt-x");
    }

    #[test]
    fn test_candidates_dedup_and_fallback() {
        let (client, _) = client_with(test_settings("http://l", "http://g"));

        let list = client.candidates(Some("remote:gpt-x"));
        assert_eq!(list, vec!["remote:gpt-x", "ollama:llama3.2:latest"]);

        // Requesting the fallback itself yields a single candidate.
        let list = client.candidates(Some("ollama:llama3.2:latest"));
        assert_eq!(list, vec!["ollama:llama3.2:latest"]);
    }

    #[test]
    fn test_offline_rewrites_before_candidate_list() {
        let (client, health) = client_with(test_settings("http://l", "http://g"));
        health.set_internet(false);

        // Remote models are rewritten to the fallback up front.
        let list = client.candidates(Some("remote:gpt-x"));
        assert_eq!(list, vec!["ollama:llama3.2:latest"]);

        // Local models pass through untouched.
        let list = client.candidates(Some("ollama:llama3.1:latest"));
        assert_eq!(list, vec!["ollama:llama3.1:latest", "ollama:llama3.2:latest"]);
    }

    #[test]
    fn test_stream_payload_flags() {
        let (client, _) = client_with(test_settings("http://l", "http://g"));
        let payload = client.payload("m", &[], &[], true);
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["stream_options"]["include_usage"], true);
        assert_eq!(payload["logprobs"], true);
        assert_eq!(payload["options"]["num_ctx"], 32_768);

        let payload = client.payload("m", &[], &[], false);
        assert!(payload.get("stream_options").is_none());
    }

    #[tokio::test]
    async fn test_breaker_fallback_dispatches_to_local_only() {
        let (local_addr, local_hits) = mock_backend("local says hi").await;
        let (remote_addr, remote_hits) = mock_backend("remote says hi").await;

        let settings = test_settings(
            &format!("http://{local_addr}"),
            &format!("http://{remote_addr}"),
        );
        let health = Arc::new(HealthState::new());
        let breakers = Arc::new(BreakerRegistry::new(HashSet::new(), None));
        let client = ModelClient::new(reqwest::Client::new(), Arc::new(settings), breakers.clone(), health);

        // Pre-open the primary's breaker.
        for _ in 0..5 {
            breakers.record_failure("remote:gpt-x", 1, None);
        }

        let messages = vec![Message::user("Hi")];
        let completion = client.chat(&messages, Some("remote:gpt-x"), &[]).await.unwrap();

        assert_eq!(completion.message().unwrap().text(), "local says hi");
        assert_eq!(local_hits.load(Ordering::SeqCst), 1);
        assert_eq!(remote_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_offline_never_consults_remote() {
        let (local_addr, local_hits) = mock_backend("local").await;
        let (remote_addr, remote_hits) = mock_backend("remote").await;

        let settings = test_settings(
            &format!("http://{local_addr}"),
            &format!("http://{remote_addr}"),
        );
        let (client, health) = {
            let health = Arc::new(HealthState::new());
            let client = ModelClient::new(
                reqwest::Client::new(),
                Arc::new(settings),
                Arc::new(BreakerRegistry::new(HashSet::new(), None)),
                health.clone(),
            );
            (client, health)
        };
        health.set_internet(false);

        let messages = vec![Message::user("Hi")];
        let completion = client.chat(&messages, Some("remote:gpt-x"), &[]).await.unwrap();
        assert_eq!(completion.message().unwrap().role, Role::Assistant);
        assert_eq!(local_hits.load(Ordering::SeqCst), 1);
        assert_eq!(remote_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_candidates_failed() {
        // Nothing is listening on these ports.
        let settings = test_settings("http://127.0.0.1:1", "http://127.0.0.1:1");
        let (client, _) = client_with(settings);

        let messages = vec![Message::user("Hi")];
        let err = client.chat(&messages, Some("remote:gpt-x"), &[]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ModelExhausted(_)));
    }
}
