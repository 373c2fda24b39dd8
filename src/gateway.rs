//! Tool-provider gateway.
//!
//! Presents a stable `call(provider, tool, arguments)` surface to the
//! agent loop, independent of transport, plus tool discovery and a cached
//! catalog so requests never re-query providers for their tool lists.

use crate::breaker::BreakerRegistry;
use crate::config::ProviderConfig;
use crate::error::RuntimeError;
use crate::health::HealthState;
use crate::protocol::{FunctionTool, ToolCall, ToolDescriptor};
use crate::tools::BuiltinRegistry;
use crate::transport::{RpcOutcome, TransportDriver};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Hard deadline around every transport call, regardless of driver.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(20);
/// A cached unhealthy verdict younger than this short-circuits calls.
const HEALTH_FRESH_WINDOW: Duration = Duration::from_secs(60);
/// Tools listed per provider in the menu summary before eliding.
const MENU_TOOL_PREVIEW: usize = 8;

/// One configured provider and its transport driver.
pub struct ProviderRuntime {
    pub config: ProviderConfig,
    pub driver: TransportDriver,
}

/// Seam between the agent loop and tool execution, mockable in tests.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Execute one tool call; never raises, errors ride in the outcome.
    async fn execute_tool(&self, call: &ToolCall) -> RpcOutcome;

    /// Catalog snapshot: builtins plus provider tools, optionally
    /// filtered to a provider subset (core providers always included).
    fn catalog(&self, filter: Option<&HashSet<String>>) -> Vec<FunctionTool>;
}

pub struct ToolGateway {
    providers: RwLock<HashMap<String, Arc<ProviderRuntime>>>,
    catalog: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
    menu_summary: RwLock<String>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthState>,
    builtins: Arc<BuiltinRegistry>,
    client: reqwest::Client,
    http_timeout: Duration,
}

impl ToolGateway {
    pub fn new(
        configs: HashMap<String, ProviderConfig>,
        client: reqwest::Client,
        http_timeout: Duration,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthState>,
        builtins: Arc<BuiltinRegistry>,
    ) -> Self {
        let providers = configs
            .into_iter()
            .map(|(name, config)| {
                let driver = TransportDriver::from_config(&config, &client, http_timeout);
                (name, Arc::new(ProviderRuntime { config, driver }))
            })
            .collect();

        Self {
            providers: RwLock::new(providers),
            catalog: RwLock::new(HashMap::new()),
            menu_summary: RwLock::new(String::new()),
            breakers,
            health,
            builtins,
            client,
            http_timeout,
        }
    }

    fn runtime(&self, name: &str) -> Option<Arc<ProviderRuntime>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn provider_config(&self, name: &str) -> Option<ProviderConfig> {
        self.runtime(name).map(|r| r.config.clone())
    }

    pub fn core_provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.config.core)
            .map(|r| r.config.name.clone())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Query every enabled provider for its tools (bypassing breakers)
    /// and rebuild the catalog cache and menu summary. Idempotent: a
    /// second run without configuration changes yields the same catalog
    /// and spawns no additional stdio children.
    pub async fn discover(&self) {
        let names = self.provider_names();
        for name in names {
            let Some(runtime) = self.runtime(&name) else { continue };
            if !runtime.config.enabled {
                debug!("discovery: skipping disabled provider '{name}'");
                continue;
            }
            match self.fetch_tools(&runtime).await {
                Ok(tools) => {
                    info!("discovered {} tools from provider '{name}'", tools.len());
                    self.catalog
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(name.clone(), tools);
                }
                Err(err) => {
                    warn!("discovery failed for provider '{name}': {err}");
                }
            }
        }
        self.rebuild_menu();
    }

    async fn fetch_tools(&self, runtime: &ProviderRuntime) -> Result<Vec<ToolDescriptor>, String> {
        let listed = tokio::time::timeout(CALL_TIMEOUT, runtime.driver.call("tools/list", json!({})))
            .await
            .map_err(|_| format!("timeout after {}s", CALL_TIMEOUT.as_secs()))?
            .map_err(|err| err.to_string())?;

        if !listed.ok {
            return Err(listed.error_text().to_string());
        }

        let tools = listed
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .iter()
            .map(|raw| ToolDescriptor {
                name: raw.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                description: raw
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: raw
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect())
    }

    fn rebuild_menu(&self) {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);

        let mut lines = Vec::new();
        let mut names: Vec<&String> = catalog.keys().collect();
        names.sort();
        for name in names {
            let tools = &catalog[name];
            if tools.is_empty() {
                continue;
            }
            // Core providers are always offered; the menu exists for
            // intent classification over the optional ones.
            if providers.get(name).is_some_and(|r| r.config.core) {
                continue;
            }
            let mut preview: Vec<&str> = tools.iter().take(MENU_TOOL_PREVIEW).map(|t| t.name.as_str()).collect();
            if tools.len() > MENU_TOOL_PREVIEW {
                preview.push("...");
            }
            lines.push(format!("{name}: {}", preview.join(", ")));
        }

        let summary = if lines.is_empty() {
            "(No external tools available)".to_string()
        } else {
            lines.join("\n")
        };
        *self.menu_summary.write().unwrap_or_else(PoisonError::into_inner) = summary;
    }

    /// Short provider/tool overview string for intent classification.
    pub fn menu_summary(&self) -> String {
        self.menu_summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cached_tools(&self, provider: &str) -> Vec<ToolDescriptor> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Call one tool on one provider. Ordered checks: configured and
    /// enabled, internet, circuit breaker, cached health, then transport
    /// under the overall safety timeout. Outcomes are recorded on the
    /// breaker either way.
    pub async fn call(&self, provider: &str, tool: &str, arguments: Value, bypass_breaker: bool) -> RpcOutcome {
        let Some(runtime) = self.runtime(provider) else {
            return RpcOutcome::failure("server_disabled: provider not configured");
        };
        if !runtime.config.enabled {
            warn!("call to disabled provider '{provider}' (tool should have been filtered)");
            return RpcOutcome::failure("server_disabled");
        }

        if runtime.config.requires_internet && !self.health.internet_available() {
            debug!("blocked offline call to {provider}::{tool}");
            return RpcOutcome::failure("internet_unavailable");
        }

        if !bypass_breaker {
            if !self.breakers.is_allowed(provider) {
                return RpcOutcome::failure("server_unavailable");
            }
            // Fast binary health check; only a *recent* unhealthy verdict
            // short-circuits, a stale one lets the call proceed under the
            // safety timeout.
            if let Some(health) = self.health.provider(provider) {
                if !health.healthy && health.checked_within(HEALTH_FRESH_WINDOW) {
                    let reason = health.error.unwrap_or_else(|| "unhealthy".to_string());
                    return RpcOutcome::failure(format!("server_unavailable: {reason}"));
                }
            }
        }

        // Accept both qualified and bare tool names.
        let qualified_prefix = format!("{provider}__");
        let bare = tool.strip_prefix(&qualified_prefix).unwrap_or(tool);
        let (method, params) = if bare == "tools/list" {
            ("tools/list", json!({}))
        } else {
            ("tools/call", json!({"name": bare, "arguments": arguments}))
        };

        match tokio::time::timeout(CALL_TIMEOUT, runtime.driver.call(method, params)).await {
            Err(_) => {
                self.health.mark_unhealthy(provider, "request timeout");
                self.breakers.record_failure(provider, 2, Some("request timeout"));
                RpcOutcome::failure("transport error: request timeout")
            }
            Ok(Err(err)) => {
                let text = err.to_string();
                self.breakers.record_failure(provider, 1, Some(&text));
                RpcOutcome::failure(text)
            }
            Ok(Ok(outcome)) => {
                // A JSON-RPC business error still means the provider is
                // serving traffic.
                self.breakers.record_success(provider);
                outcome
            }
        }
    }

    /// Lightweight health probe: `tools/list` straight through the driver
    /// (no breaker gate, no breaker recording). A provider that responds
    /// with zero tools counts as failing.
    pub async fn probe(&self, provider: &str, timeout: Duration) -> Result<usize, String> {
        let Some(runtime) = self.runtime(provider) else {
            return Err("provider not configured".to_string());
        };

        let listed = tokio::time::timeout(timeout, runtime.driver.call("tools/list", json!({})))
            .await
            .map_err(|_| format!("health check timeout ({}s)", timeout.as_secs()))?
            .map_err(|err| err.to_string())?;

        if !listed.ok {
            return Err(listed.error_text().to_string());
        }
        let count = listed
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if count == 0 {
            return Err("server responds but provides no tools".to_string());
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Stdio lifecycle helpers (used by the health scheduler)
    // ------------------------------------------------------------------

    /// Clear slots of exited stdio children. Returns how many were swept.
    pub async fn sweep_stdio_children(&self) -> usize {
        let runtimes: Vec<Arc<ProviderRuntime>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut swept = 0;
        for runtime in runtimes {
            if let Some(driver) = runtime.driver.stdio() {
                if driver.sweep().await {
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Pids of our live stdio children.
    pub async fn stdio_child_pids(&self) -> Vec<u32> {
        let runtimes: Vec<Arc<ProviderRuntime>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut pids = Vec::new();
        for runtime in runtimes {
            if let Some(driver) = runtime.driver.stdio() {
                if let Some(pid) = driver.child_pid().await {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    /// Program names of configured stdio providers, for the zombie scan.
    pub fn stdio_command_names(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|r| r.driver.stdio().and_then(|d| d.command_line().first().cloned()))
            .collect()
    }

    /// Terminate all stdio children (graceful shutdown).
    pub async fn shutdown_stdio_children(&self) {
        let runtimes: Vec<Arc<ProviderRuntime>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for runtime in runtimes {
            if let Some(driver) = runtime.driver.stdio() {
                driver.shutdown().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Provider add/remove
    // ------------------------------------------------------------------

    /// Register (or replace) a provider at runtime and discover its tools.
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<usize, RuntimeError> {
        let name = config.name.clone();
        if name.is_empty() {
            return Err(RuntimeError::Config("provider name must not be empty".to_string()));
        }

        let driver = TransportDriver::from_config(&config, &self.client, self.http_timeout);
        let runtime = Arc::new(ProviderRuntime { config, driver });
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), runtime.clone());

        let count = match self.fetch_tools(&runtime).await {
            Ok(tools) => {
                let count = tools.len();
                self.catalog
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.clone(), tools);
                count
            }
            Err(err) => {
                warn!("discovery failed for new provider '{name}': {err}");
                0
            }
        };
        self.rebuild_menu();
        Ok(count)
    }

    /// Remove a provider, terminating its stdio child if any.
    pub async fn remove_provider(&self, name: &str) -> bool {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let Some(runtime) = removed else { return false };

        if let Some(driver) = runtime.driver.stdio() {
            driver.shutdown().await;
        }
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.rebuild_menu();
        true
    }
}

#[async_trait]
impl ToolDispatch for ToolGateway {
    async fn execute_tool(&self, call: &ToolCall) -> RpcOutcome {
        let name = call.function.name.as_str();
        let args = call.function.parsed_arguments();

        if self.builtins.has(name) {
            if let Some(outcome) = self.builtins.invoke(name, args.clone()).await {
                return outcome;
            }
        }

        match name.split_once("__") {
            Some((provider, tool)) => self.call(provider, tool, args, false).await,
            None => RpcOutcome::failure(format!("unknown tool '{name}'")),
        }
    }

    fn catalog(&self, filter: Option<&HashSet<String>>) -> Vec<FunctionTool> {
        let mut tools = self.builtins.descriptors();

        let offline = !self.health.internet_available();
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);

        let mut names: Vec<&String> = providers.keys().collect();
        names.sort();
        for name in names {
            let runtime = &providers[name];
            if !runtime.config.enabled {
                continue;
            }
            if runtime.config.requires_internet && offline {
                continue;
            }
            let included = runtime.config.core || filter.map_or(true, |f| f.contains(name));
            if !included {
                continue;
            }
            for tool in catalog.get(name).into_iter().flatten() {
                tools.push(FunctionTool::new(ToolDescriptor {
                    name: format!("{name}__{}", tool.name),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                }));
            }
        }
        tools
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::collections::HashSet;

    /// Shell provider that lists one tool and echoes the called tool name.
    const PROVIDER_SCRIPT: &str = r#"
while read -r line; do
  id=$(printf '%s' "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
  [ -z "$id" ] && continue
  case "$line" in
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"lookup","description":"Look things up","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*)
      name=$(printf '%s' "$line" | grep -o '"name":"[^"]*"' | head -n1 | cut -d'"' -f4)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"called":"%s"}}\n' "$id" "$name"
      ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

    fn stdio_config(name: &str, script: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            url: None,
            cmd: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: HashMap::new(),
            requires_internet: false,
            enabled: true,
            disabled_reason: None,
            core: false,
        }
    }

    fn gateway_with(configs: Vec<ProviderConfig>) -> ToolGateway {
        let map: HashMap<String, ProviderConfig> =
            configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        ToolGateway::new(
            map,
            reqwest::Client::new(),
            Duration::from_secs(5),
            Arc::new(BreakerRegistry::new(HashSet::new(), None)),
            Arc::new(HealthState::new()),
            Arc::new(BuiltinRegistry::new().register(crate::tools::ClockTool)),
        )
    }

    #[tokio::test]
    async fn test_discovery_and_qualified_catalog() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);
        gateway.discover().await;

        let tools = gateway.catalog(None);
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"get_current_time"));
        assert!(names.contains(&"files__lookup"));

        assert_eq!(gateway.menu_summary(), "files: lookup");
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_discovery_idempotence() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);
        gateway.discover().await;
        let first = gateway.cached_tools("files");
        let pid = gateway.stdio_child_pids().await;

        gateway.discover().await;
        let second = gateway.cached_tools("files");
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
        // No additional child beyond the first invocation.
        assert_eq!(gateway.stdio_child_pids().await, pid);
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_call_strips_qualified_name() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);

        let outcome = gateway
            .call("files", "files__lookup", json!({"q": "x"}), false)
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.result.unwrap()["called"], "lookup");

        let outcome = gateway.call("files", "lookup", json!({}), false).await;
        assert!(outcome.ok, "bare names must also be accepted");
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_call_ordered_checks() {
        let mut disabled = stdio_config("files", PROVIDER_SCRIPT);
        disabled.enabled = false;
        let mut online_only = stdio_config("web", PROVIDER_SCRIPT);
        online_only.requires_internet = true;

        let gateway = gateway_with(vec![disabled, online_only]);
        gateway.health.set_internet(false);

        let outcome = gateway.call("ghost", "x", json!({}), false).await;
        assert!(outcome.error_text().starts_with("server_disabled"));

        let outcome = gateway.call("files", "lookup", json!({}), false).await;
        assert_eq!(outcome.error_text(), "server_disabled");

        let outcome = gateway.call("web", "lookup", json!({}), false).await;
        assert_eq!(outcome.error_text(), "internet_unavailable");
    }

    #[tokio::test]
    async fn test_call_blocked_by_breaker_and_bypass() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);
        for _ in 0..5 {
            gateway.breakers.record_failure("files", 1, None);
        }

        let outcome = gateway.call("files", "lookup", json!({}), false).await;
        assert_eq!(outcome.error_text(), "server_unavailable");

        // Bypass skips the gate; the call goes through.
        let outcome = gateway.call("files", "lookup", json!({}), true).await;
        assert!(outcome.ok);
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_cached_unhealthy_short_circuits() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);
        gateway.health.mark_unhealthy("files", "process died");

        let outcome = gateway.call("files", "lookup", json!({}), false).await;
        assert_eq!(outcome.error_text(), "server_unavailable: process died");
    }

    #[tokio::test]
    async fn test_probe_zero_tools_is_failure() {
        let empty_script = r#"
while read -r line; do
  id=$(printf '%s' "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
  [ -z "$id" ] && continue
  case "$line" in
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;
        let gateway = gateway_with(vec![stdio_config("empty", empty_script)]);
        let err = gateway.probe("empty", Duration::from_secs(10)).await.unwrap_err();
        assert!(err.contains("no tools"));
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_execute_routes_builtins_and_providers() {
        let gateway = gateway_with(vec![stdio_config("files", PROVIDER_SCRIPT)]);

        let builtin = crate::protocol::ToolCall::new("a", "get_current_time", &json!({}));
        let outcome = gateway.execute_tool(&builtin).await;
        assert!(outcome.ok);

        let qualified = crate::protocol::ToolCall::new("b", "files__lookup", &json!({}));
        let outcome = gateway.execute_tool(&qualified).await;
        assert!(outcome.ok);

        let unknown = crate::protocol::ToolCall::new("c", "nope", &json!({}));
        let outcome = gateway.execute_tool(&unknown).await;
        assert!(!outcome.ok);
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_catalog_filter_keeps_core() {
        let mut core = stdio_config("memory", PROVIDER_SCRIPT);
        core.core = true;
        let gateway = gateway_with(vec![core, stdio_config("files", PROVIDER_SCRIPT)]);
        gateway.discover().await;

        let filter: HashSet<String> = HashSet::new();
        let tools = gateway.catalog(Some(&filter));
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"memory__lookup"));
        assert!(!names.contains(&"files__lookup"));
        gateway.shutdown_stdio_children().await;
    }

    #[tokio::test]
    async fn test_add_and_remove_provider() {
        let gateway = gateway_with(vec![]);
        let count = gateway.add_provider(stdio_config("late", PROVIDER_SCRIPT)).await.unwrap();
        assert_eq!(count, 1);
        assert!(gateway.provider_config("late").is_some());

        assert!(gateway.remove_provider("late").await);
        assert!(gateway.provider_config("late").is_none());
        assert!(gateway.cached_tools("late").is_empty());
    }
}
