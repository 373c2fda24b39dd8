//! Runtime status tool.
//!
//! Lets the model answer "is the search server down?" style questions
//! from live breaker and health data instead of guessing.

use super::ToolHandler;
use crate::breaker::BreakerRegistry;
use crate::health::HealthState;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct StatusTool {
    health: Arc<HealthState>,
    breakers: Arc<BreakerRegistry>,
}

impl StatusTool {
    pub fn new(health: Arc<HealthState>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { health, breakers }
    }
}

#[async_trait]
impl ToolHandler for StatusTool {
    fn name(&self) -> &str {
        "system_status"
    }

    fn description(&self) -> &str {
        "Report runtime health: internet reachability, tool-provider health, and circuit-breaker states."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn invoke(&self, _args: Value) -> Result<Value, String> {
        let providers = self.health.report();
        let healthy = providers.values().filter(|p| p.healthy).count();

        let breakers: Vec<Value> = self
            .breakers
            .snapshots()
            .into_iter()
            .map(|snap| {
                json!({
                    "name": snap.name,
                    "state": snap.state,
                    "permanently_disabled": snap.permanently_disabled,
                })
            })
            .collect();

        Ok(json!({
            "internet_available": self.health.internet_available(),
            "providers_healthy": healthy,
            "providers_total": providers.len(),
            "providers": serde_json::to_value(&providers).map_err(|e| e.to_string())?,
            "breakers": breakers,
        }))
    }
}
