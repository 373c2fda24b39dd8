//! The bounded reason-act agent loop.
//!
//! One [`AgentEngine`] serves every request in the process. It drives a
//! model conversation step by step, fanning tool calls out through the
//! gateway and feeding their results back, until the model produces a
//! final answer or a stopping condition fires.

pub mod exit;
pub mod rescue;
pub mod stream;
pub mod tracker;

use crate::config::RuntimeSettings;
use crate::error::RuntimeError;
use crate::gateway::ToolDispatch;
use crate::model::ChatBackend;
use crate::protocol::{ChatCompletion, FunctionTool, Message, Role, ToolCall};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracker::ToolTracker;

/// Total wall-clock budget for one loop before it is forced to exit.
const LOOP_WALL_CLOCK_CAP: Duration = Duration::from_secs(30);
/// The wall-clock exit never fires before this many steps.
const WALL_CLOCK_MIN_STEPS: usize = 3;

pub struct AgentEngine {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<dyn ToolDispatch>,
    settings: Arc<RuntimeSettings>,
    tracker: ToolTracker,
}

impl AgentEngine {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        tools: Arc<dyn ToolDispatch>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            backend,
            tools,
            settings,
            tracker: ToolTracker::new(),
        }
    }

    /// Prune to the last `limit` entries, then pop tool-role heads so the
    /// conversation never starts with an unpaired tool result.
    pub(crate) fn prune_context(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
        if messages.len() > limit {
            let original = messages.len();
            messages.drain(..original - limit);
            while messages.first().map(|m| m.role) == Some(Role::Tool) {
                messages.remove(0);
            }
            debug!("context pruned: {original} -> {} messages", messages.len());
        }
        messages
    }

    fn snapshot_tools(&self, explicit: Option<Vec<FunctionTool>>) -> Vec<FunctionTool> {
        let mut tools = explicit.unwrap_or_else(|| self.tools.catalog(None));
        if tools.len() > self.settings.max_tool_count {
            warn!(
                "tool count {} exceeds limit, truncating to {}",
                tools.len(),
                self.settings.max_tool_count
            );
            tools.truncate(self.settings.max_tool_count);
        }
        tools
    }

    /// Run the loop to completion and return the final chat completion.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        explicit_tools: Option<Vec<FunctionTool>>,
        request_id: &str,
    ) -> Result<ChatCompletion, RuntimeError> {
        let mut messages = Self::prune_context(messages, self.settings.context_prune_limit);
        let active_tools = self.snapshot_tools(explicit_tools);

        let mut step = 0usize;
        let mut recent_responses: Vec<String> = Vec::new();
        let loop_started = Instant::now();
        let mut response: Option<ChatCompletion> = None;

        while step < self.settings.max_tool_steps {
            step += 1;
            debug!(
                "[{request_id}] step {step}/{}: calling model with {} tools",
                self.settings.max_tool_steps,
                active_tools.len()
            );

            let completion = match self.backend.chat(&messages, model, &active_tools).await {
                Ok(completion) => completion,
                Err(err) => {
                    // One retry without tools before giving up; a plain
                    // answer beats a hard failure.
                    warn!("[{request_id}] model call failed ({err}), retrying without tools");
                    match self.backend.chat(&messages, model, &[]).await {
                        Ok(completion) => completion,
                        Err(fallback_err) => {
                            error!("[{request_id}] fallback model call failed too: {fallback_err}");
                            let apology = Message::assistant(
                                "I'm currently unable to process this request due to a technical issue. \
                                 Please try again later or rephrase your question.",
                            );
                            return Ok(ChatCompletion::from_message(request_id, model, apology, "stop"));
                        }
                    }
                }
            };

            let mut completion = completion;
            let Some(mut message) = completion.message().cloned() else {
                return Err(RuntimeError::Protocol("model response carried no choices".to_string()));
            };

            // Rescue tool calls the model emitted as raw text.
            if !message.has_tool_calls() {
                if let Some(calls) = rescue::rescue_tool_calls(message.text()) {
                    warn!(
                        "[{request_id}] converted free-text response into {} tool calls",
                        calls.len()
                    );
                    message.tool_calls = Some(calls);
                    message.content = None;
                }
            }

            let body = message.text().to_string();
            recent_responses.push(body.clone());
            if recent_responses.len() > 3 {
                recent_responses.remove(0);
            }

            // Keep the stored response in sync with any rescue rewrite.
            if let Some(choice) = completion.choices.first_mut() {
                choice.message = message.clone();
            }
            messages.push(message.clone());
            response = Some(completion);

            if message.has_tool_calls() {
                let calls = message.tool_calls.clone().unwrap_or_default();
                let tool_messages = self.fan_out(&calls, request_id).await;
                messages.extend(tool_messages);

                // Guards against runaway tool loops.
                if step >= 3 && recent_responses.len() >= 3 {
                    let similarity = exit::response_similarity(&recent_responses);
                    if similarity > exit::SIMILARITY_EXIT_THRESHOLD {
                        info!("[{request_id}] exit: responses stabilized (similarity {similarity:.2})");
                        break;
                    }
                }
                if !body.is_empty() && exit::indicates_completion(&body) {
                    info!("[{request_id}] exit: completion signal alongside tool calls");
                    break;
                }
                if loop_started.elapsed() > LOOP_WALL_CLOCK_CAP && step >= WALL_CLOCK_MIN_STEPS {
                    warn!(
                        "[{request_id}] exit: loop running {:.1}s, forcing out",
                        loop_started.elapsed().as_secs_f64()
                    );
                    break;
                }
                continue;
            }

            // A reply without tool calls is the final answer.
            info!("[{request_id}] loop complete: {step} steps in {:.2}s", loop_started.elapsed().as_secs_f64());
            break;
        }

        let mut completion =
            response.ok_or_else(|| RuntimeError::Protocol("agent loop made no model calls".to_string()))?;
        backfill_empty_content(&mut completion, &messages);
        Ok(completion)
    }

    /// Execute tool calls concurrently and return one tool message per
    /// call, in the same order as the assistant's `tool_calls` array
    /// regardless of completion order.
    pub(crate) async fn fan_out(&self, calls: &[ToolCall], request_id: &str) -> Vec<Message> {
        let mut skipped: HashMap<usize, String> = HashMap::new();
        let mut valid: Vec<(usize, ToolCall)> = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            match self.tracker.should_skip(&call.function.name) {
                Some(reason) => {
                    warn!(
                        "[{request_id}] skipping tool '{}' ({reason})",
                        call.function.name
                    );
                    skipped.insert(index, reason);
                }
                None => valid.push((index, call.clone())),
            }
        }

        if !valid.is_empty() {
            debug!("[{request_id}] executing {} tools in parallel", valid.len());
        }

        // Each execution yields (index, message); results are collected
        // into slots so no shared buffer is mutated during the parallel
        // region.
        let executions = valid.into_iter().map(|(index, call)| {
            let tools = self.tools.clone();
            async move {
                let outcome = tools.execute_tool(&call).await;
                (index, call, outcome)
            }
        });
        let results = futures::future::join_all(executions).await;

        let mut slots: Vec<Option<Message>> = vec![None; calls.len()];
        for (index, call, outcome) in results {
            self.tracker.record(&call.function.name, outcome.ok);
            let content = if outcome.ok {
                outcome
                    .result
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "null".to_string())
            } else {
                serde_json::json!({"ok": false, "error": outcome.error_text()}).to_string()
            };
            slots[index] = Some(Message::tool(call.id.clone(), call.function.name.clone(), content));
        }
        for (index, reason) in skipped {
            slots[index] = Some(Message::tool(
                calls[index].id.clone(),
                calls[index].function.name.clone(),
                format!("skipped: {reason}"),
            ));
        }

        slots.into_iter().flatten().collect()
    }
}

/// If the final message came back empty, reuse the most recent non-empty
/// assistant (then tool) content so callers never see a blank reply.
fn backfill_empty_content(completion: &mut ChatCompletion, messages: &[Message]) {
    let Some(choice) = completion.choices.first_mut() else { return };
    if !choice.message.text().is_empty() || choice.message.has_tool_calls() {
        return;
    }

    let from_assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.text().is_empty());
    let fallback = from_assistant
        .or_else(|| messages.iter().rev().find(|m| m.role == Role::Tool && !m.text().is_empty()));

    if let Some(source) = fallback {
        warn!("final response was empty; reusing prior message content");
        choice.message.content = Some(source.text().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            role,
            content: Some(content.to_string()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    #[test]
    fn test_prune_keeps_tail_and_pairing() {
        let mut messages = vec![msg(Role::User, "start")];
        messages.push(msg(Role::Assistant, "calling"));
        messages.push(Message::tool("a", "t", "result-a"));
        messages.push(Message::tool("b", "t", "result-b"));
        messages.push(msg(Role::User, "next"));
        messages.push(msg(Role::Assistant, "done"));

        // Limit of 4 would start at a tool message; those heads must go.
        let pruned = AgentEngine::prune_context(messages, 4);
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].role, Role::User);
        assert_eq!(pruned[0].text(), "next");
    }

    #[test]
    fn test_prune_noop_under_limit() {
        let messages = vec![msg(Role::User, "hi")];
        let pruned = AgentEngine::prune_context(messages, 50);
        assert_eq!(pruned.len(), 1);
    }

    #[test]
    fn test_backfill_empty_final_content() {
        let mut completion =
            ChatCompletion::from_message("req", None, msg(Role::Assistant, ""), "stop");
        completion.choices[0].message.content = None;

        let history = vec![
            msg(Role::User, "question"),
            Message::tool("a", "t", "tool output"),
            msg(Role::Assistant, "earlier draft"),
        ];
        backfill_empty_content(&mut completion, &history);
        assert_eq!(completion.message().unwrap().text(), "earlier draft");
    }

    #[test]
    fn test_backfill_falls_back_to_tool_content() {
        let mut completion =
            ChatCompletion::from_message("req", None, msg(Role::Assistant, ""), "stop");
        let history = vec![msg(Role::User, "question"), Message::tool("a", "t", "tool output")];
        backfill_empty_content(&mut completion, &history);
        assert_eq!(completion.message().unwrap().text(), "tool output");
    }
}
