//! Per-tool failure history.
//!
//! The loop consults this before fanning out tool calls so a tool that
//! keeps failing stops being retried on every step. History is global to
//! the process and decays by recency.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Consecutive failures before a tool is skipped.
const SKIP_THRESHOLD: u32 = 3;
/// Failures older than this no longer justify skipping.
const FAILURE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct ToolRecord {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
}

#[derive(Default)]
pub struct ToolTracker {
    records: Mutex<HashMap<String, ToolRecord>>,
}

impl ToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, success: bool) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = records.entry(tool.to_string()).or_default();
        entry.total_calls += 1;
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            entry.total_failures += 1;
            entry.last_failure = Some(Instant::now());
        }
    }

    /// Reason to skip the tool, when its recent history is bad enough.
    pub fn should_skip(&self, tool: &str) -> Option<String> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.get(tool)?;
        if record.consecutive_failures < SKIP_THRESHOLD {
            return None;
        }
        let recent = record.last_failure.is_some_and(|t| t.elapsed() < FAILURE_WINDOW);
        if !recent {
            return None;
        }
        Some(format!(
            "{} consecutive failures within the last {} minutes",
            record.consecutive_failures,
            FAILURE_WINDOW.as_secs() / 60
        ))
    }
}
