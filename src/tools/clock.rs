//! Wall-clock tool.
//!
//! Smaller local models lean on this constantly, and the rescue path
//! normalizes the common `get_time` misspelling to this tool's name.

use super::ToolHandler;
use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Value};

pub struct ClockTool;

#[async_trait]
impl ToolHandler for ClockTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, both local and UTC."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn invoke(&self, _args: Value) -> Result<Value, String> {
        let local = Local::now();
        Ok(json!({
            "local": local.format("%Y-%m-%d %H:%M:%S").to_string(),
            "utc": Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "timestamp": local.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_both_clocks() {
        let result = ClockTool.invoke(json!({})).await.unwrap();
        assert!(result["local"].is_string());
        assert!(result["utc"].is_string());
        assert!(result["timestamp"].is_i64());
    }
}
