//! Runtime settings and tool-provider configuration.
//!
//! Settings are read once from the environment at startup. Providers are
//! loaded from a JSON file keyed by provider name; the resilience fabric
//! writes `enabled`/`disabled_reason` back through the [`ConfigStore`]
//! trait so disable decisions survive a restart.

use crate::error::RuntimeError;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Runtime settings
// ============================================================================

/// Process-wide knobs, read once from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Base URL of the governed model gateway (remote models).
    pub gateway_base: String,
    /// Base URL of the local model endpoint (`ollama:`/`local:` models).
    pub local_model_base: String,
    /// Default model used when a request does not name one.
    pub agent_model: String,
    /// Process-wide fallback model, expected to be local.
    pub fallback_model: String,
    pub fallback_enabled: bool,
    /// Bearer token attached to gateway-routed model calls.
    pub router_auth_token: Option<String>,
    /// Bearer token required on the inbound surface, when set.
    pub server_auth_token: Option<String>,
    pub http_timeout: Duration,
    pub context_prune_limit: usize,
    pub max_tool_steps: usize,
    pub max_tool_count: usize,
    /// Default context window forwarded as `options.num_ctx`.
    pub num_ctx: u64,
    pub internet_check_interval: Duration,
    pub core_recovery_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            gateway_base: "http://127.0.0.1:5455".to_string(),
            local_model_base: "http://127.0.0.1:11434".to_string(),
            agent_model: "ollama:llama3.1:latest".to_string(),
            fallback_model: "ollama:llama3.2:latest".to_string(),
            fallback_enabled: true,
            router_auth_token: None,
            server_auth_token: None,
            http_timeout: Duration::from_secs(120),
            context_prune_limit: 50,
            max_tool_steps: 8,
            max_tool_count: 24,
            num_ctx: 32_768,
            internet_check_interval: Duration::from_secs(5),
            core_recovery_interval: Duration::from_secs(300),
        }
    }
}

impl RuntimeSettings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gateway_base: env_string("GATEWAY_BASE", &defaults.gateway_base),
            local_model_base: env_string("LOCAL_MODEL_BASE", &defaults.local_model_base),
            agent_model: env_string("AGENT_MODEL", &defaults.agent_model),
            fallback_model: env_string("FALLBACK_MODEL", &defaults.fallback_model),
            fallback_enabled: env_parse("FALLBACK_ENABLED", defaults.fallback_enabled),
            router_auth_token: std::env::var("ROUTER_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            server_auth_token: std::env::var("SERVER_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 120u64)),
            context_prune_limit: env_parse("CONTEXT_PRUNE_LIMIT", defaults.context_prune_limit),
            max_tool_steps: env_parse("MAX_TOOL_STEPS", defaults.max_tool_steps),
            max_tool_count: env_parse("MAX_TOOL_COUNT", defaults.max_tool_count),
            num_ctx: env_parse("NUM_CTX", defaults.num_ctx),
            internet_check_interval: Duration::from_secs(env_parse("INTERNET_CHECK_INTERVAL_SECS", 5u64)),
            core_recovery_interval: Duration::from_secs(env_parse("CORE_RECOVERY_INTERVAL_SECS", 300u64)),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

// ============================================================================
// Provider records
// ============================================================================

/// Transport a provider speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Sse,
    Stdio,
}

/// Why a provider is disabled, persisted alongside the `enabled` flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    UserDisabled,
    CircuitBreakerOpened,
    PermanentlyDisabled,
}

/// Configuration record for one tool-provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Filled from the map key on load.
    #[serde(default)]
    pub name: String,

    pub transport: TransportKind,

    /// Endpoint for `http`/`sse` providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Command line for `stdio` providers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub requires_internet: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<DisabledReason>,

    /// Core providers get relaxed breaker thresholds and eager recovery.
    #[serde(default)]
    pub core: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), RuntimeError> {
        match self.transport {
            TransportKind::Http | TransportKind::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(RuntimeError::Config(format!(
                        "provider '{}' uses {:?} transport but has no url",
                        self.name, self.transport
                    )));
                }
            }
            TransportKind::Stdio => {
                if self.cmd.is_empty() {
                    return Err(RuntimeError::Config(format!(
                        "provider '{}' uses stdio transport but has an empty cmd",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load and validate the provider file (a JSON object keyed by name).
pub fn load_providers(path: &Path) -> Result<HashMap<String, ProviderConfig>, RuntimeError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_providers(&raw)
}

pub fn parse_providers(raw: &str) -> Result<HashMap<String, ProviderConfig>, RuntimeError> {
    let mut providers: HashMap<String, ProviderConfig> = serde_json::from_str(raw)
        .map_err(|e| RuntimeError::Config(format!("invalid provider file: {e}")))?;
    for (name, cfg) in providers.iter_mut() {
        cfg.name = name.clone();
        cfg.validate()?;
    }
    Ok(providers)
}

// ============================================================================
// Persistence hook
// ============================================================================

/// Destination for debounced breaker disable-state writes.
///
/// Persistence failure is logged by callers but never propagated.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn persist_provider_state(
        &self,
        name: &str,
        enabled: bool,
        reason: Option<DisabledReason>,
    ) -> Result<(), RuntimeError>;
}

/// Writes `enabled`/`disabled_reason` back into the provider JSON file.
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn persist_provider_state(
        &self,
        name: &str,
        enabled: bool,
        reason: Option<DisabledReason>,
    ) -> Result<(), RuntimeError> {
        let _guard = self.write_lock.lock().await;

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

        let Some(entry) = doc.get_mut(name).and_then(|v| v.as_object_mut()) else {
            warn!("persist skipped: provider '{name}' not present in {}", self.path.display());
            return Ok(());
        };

        entry.insert("enabled".to_string(), serde_json::Value::Bool(enabled));
        match reason {
            Some(reason) => {
                entry.insert("disabled_reason".to_string(), serde_json::to_value(reason)?);
            }
            None => {
                entry.remove("disabled_reason");
            }
        }

        let rendered = serde_json::to_string_pretty(&doc)?;
        tokio::fs::write(&self.path, rendered).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "search": {
            "transport": "http",
            "url": "http://127.0.0.1:7010/rpc",
            "requires_internet": true
        },
        "files": {
            "transport": "stdio",
            "cmd": ["npx", "-y", "@example/files-server"],
            "env": {"ROOT": "/tmp"},
            "core": true
        }
    }"#;

    #[test]
    fn test_parse_providers_fills_names_and_defaults() {
        let providers = parse_providers(SAMPLE).unwrap();
        let search = &providers["search"];
        assert_eq!(search.name, "search");
        assert_eq!(search.transport, TransportKind::Http);
        assert!(search.enabled);
        assert!(search.requires_internet);
        assert!(!search.core);

        let files = &providers["files"];
        assert_eq!(files.cmd.len(), 3);
        assert!(files.core);
        assert!(!files.requires_internet);
    }

    #[test]
    fn test_parse_providers_rejects_missing_url() {
        let raw = r#"{"broken": {"transport": "sse"}}"#;
        let err = parse_providers(raw).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_parse_providers_rejects_empty_cmd() {
        let raw = r#"{"broken": {"transport": "stdio", "cmd": []}}"#;
        assert!(parse_providers(raw).is_err());
    }

    #[test]
    fn test_disabled_reason_wire_names() {
        let reason = serde_json::to_value(DisabledReason::CircuitBreakerOpened).unwrap();
        assert_eq!(reason, "circuit_breaker_opened");
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = FileConfigStore::new(&path);
        store
            .persist_provider_state("search", false, Some(DisabledReason::CircuitBreakerOpened))
            .await
            .unwrap();

        let providers = load_providers(&path).unwrap();
        assert!(!providers["search"].enabled);
        assert_eq!(
            providers["search"].disabled_reason,
            Some(DisabledReason::CircuitBreakerOpened)
        );

        // Re-enable clears the reason.
        store.persist_provider_state("search", true, None).await.unwrap();
        let providers = load_providers(&path).unwrap();
        assert!(providers["search"].enabled);
        assert!(providers["search"].disabled_reason.is_none());
    }

    #[tokio::test]
    async fn test_file_store_unknown_provider_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = FileConfigStore::new(&path);
        store.persist_provider_state("ghost", false, None).await.unwrap();
        assert_eq!(load_providers(&path).unwrap().len(), 2);
    }
}
