//! Rescue of tool calls the model emitted as raw text.
//!
//! Smaller local models often stream the JSON of an intended tool call
//! as plain content instead of using the tool-call API. When a response
//! has no structured tool calls but its content parses as
//! `{"name": ..., "parameters": ...}` (or an array of such objects,
//! possibly inside a Markdown fence), we synthesize real tool calls from
//! it. Parsing is strictly best-effort: any failure leaves the message
//! untouched.

use crate::protocol::ToolCall;
use serde_json::Value;

/// Fuzzy tool-name normalizations observed in the wild.
pub fn normalize_tool_name(name: &str) -> &str {
    match name {
        "get_time" => "get_current_time",
        other => other,
    }
}

/// Try to interpret free-text content as intended tool calls.
pub fn rescue_tool_calls(content: &str) -> Option<Vec<ToolCall>> {
    let stripped = content.trim();
    if stripped.is_empty() {
        return None;
    }

    // Allow a generic text prefix before the JSON signature.
    let object_start = stripped.find('{');
    let array_start = stripped.find('[');
    let candidate = match (object_start, array_start) {
        (Some(obj), Some(arr)) if obj < arr => &stripped[obj..],
        (Some(obj), None) => &stripped[obj..],
        (_, Some(arr)) => &stripped[arr..],
        (None, None) => return None,
    };
    if !candidate.contains("\"name\"") {
        return None;
    }

    let cleaned = clean_markdown(candidate);
    let data: Value = serde_json::from_str(&cleaned).ok()?;
    let items = match data {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => return None,
    };

    let millis = chrono::Utc::now().timestamp_millis();
    let mut calls = Vec::new();
    for item in &items {
        let Some(name) = item.get("name").and_then(Value::as_str) else {
            continue;
        };
        let name = normalize_tool_name(name);

        let args = item
            .get("parameters")
            .or_else(|| item.get("arguments"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        // Arguments may themselves arrive as a JSON-encoded string.
        let args = match args {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        };

        calls.push(ToolCall::new(
            format!("call_h_{millis}_{}", calls.len()),
            name,
            &args,
        ));
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn clean_markdown(candidate: &str) -> String {
    let mut cleaned = candidate.trim();
    if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest.split_once('\n').map_or(rest, |(_, body)| body);
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest.rsplit_once('\n').map_or(rest, |(body, _)| body);
    }
    let mut cleaned = cleaned.trim_matches('`').trim();
    if let Some(rest) = cleaned.strip_prefix("json") {
        cleaned = rest.trim_start();
    }
    cleaned.to_string()
}
