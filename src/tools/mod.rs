//! Built-in core tools, always present in the catalog.
//!
//! Provider tools come and go with discovery; the handlers registered
//! here are compiled in and never depend on a provider being reachable.

pub mod clock;
pub mod status;

pub use clock::ClockTool;
pub use status::StatusTool;

use crate::protocol::{FunctionTool, ToolDescriptor};
use crate::transport::RpcOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Polymorphic handler behind every builtin tool. The agent loop only
/// ever sees the trait; concrete handlers are registered at startup.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema object describing the argument shape.
    fn parameters(&self) -> Value;

    /// Execute with parsed arguments. `Err` carries a message the model
    /// can act on; it is not a transport failure.
    async fn invoke(&self, args: Value) -> Result<Value, String>;
}

/// Registry mapping tool names to handlers.
pub struct BuiltinRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: ToolHandler + 'static>(mut self, tool: T) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Catalog entries in the function-tool shape models expect.
    pub fn descriptors(&self) -> Vec<FunctionTool> {
        let mut tools: Vec<FunctionTool> = self
            .tools
            .values()
            .map(|handler| {
                FunctionTool::new(ToolDescriptor {
                    name: handler.name().to_string(),
                    description: handler.description().to_string(),
                    parameters: handler.parameters(),
                })
            })
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Execute a builtin by name. `None` when the tool is not registered,
    /// so the caller can fall through to provider dispatch.
    pub async fn invoke(&self, name: &str, args: Value) -> Option<RpcOutcome> {
        let handler = self.tools.get(name)?.clone();
        Some(match handler.invoke(args).await {
            Ok(result) => RpcOutcome::success(result),
            Err(error) => RpcOutcome::failure(error),
        })
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn invoke(&self, args: Value) -> Result<Value, String> {
            args.get("text")
                .cloned()
                .ok_or_else(|| "missing 'text' argument".to_string())
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = BuiltinRegistry::new().register(EchoTool);
        assert!(registry.has("echo"));

        let outcome = registry.invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.result.unwrap(), json!("hi"));

        let outcome = registry.invoke("echo", json!({})).await.unwrap();
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_none() {
        let registry = BuiltinRegistry::new();
        assert!(registry.invoke("nope", json!({})).await.is_none());
    }

    #[test]
    fn test_descriptors_shape() {
        let registry = BuiltinRegistry::new().register(EchoTool);
        let tools = registry.descriptors();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].kind, "function");
        assert_eq!(tools[0].name(), "echo");
    }
}
