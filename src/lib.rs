//! Autonomous agent runtime core.
//!
//! A long-lived orchestration service: it accepts OpenAI-compatible
//! chat-completion requests, drives a bounded reason-act loop against
//! language-model backends, invokes tool providers over HTTP, SSE, or
//! stdio JSON-RPC, and streams normalized events back to callers — with
//! circuit breakers and health scheduling protecting against partial
//! failure of any backend or provider.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod model;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

// Re-export commonly used items for convenience
pub use agent::AgentEngine;
pub use breaker::{BreakerPolicy, BreakerRegistry, BreakerState, CircuitBreaker};
pub use config::{ConfigStore, DisabledReason, ProviderConfig, RuntimeSettings, TransportKind};
pub use error::RuntimeError;
pub use gateway::{ToolDispatch, ToolGateway};
pub use health::{HealthMonitor, HealthState};
pub use model::{ChatBackend, ChunkStream, ModelClient};
pub use protocol::{AgentEvent, ChatCompletion, FunctionTool, Message, Role, ToolCall};
pub use transport::RpcOutcome;
