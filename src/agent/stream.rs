//! Streaming finalizer.
//!
//! Consumes the model's incremental chat-completion stream, accumulates
//! text and sparse tool-call fragments, rescues tool calls emitted as
//! raw text, fans tool executions out, and re-enters the loop. The
//! caller sees a normalized [`AgentEvent`] stream that always terminates
//! with exactly one `done` or one `error`.

use super::rescue;
use super::AgentEngine;
use crate::protocol::{AgentEvent, FunctionCall, Message, Role, StreamMetrics, ToolCall, Usage};
use futures::{Stream, StreamExt};
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sparse accumulator slot for one tool call assembled from deltas.
#[derive(Debug, Clone, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl AgentEngine {
    /// Run the streaming loop in a background task; events arrive on the
    /// returned stream. Dropping the stream cancels the loop at its next
    /// event; tool executions already in flight run to completion and
    /// their results are discarded.
    pub fn stream(
        self: &Arc<Self>,
        messages: Vec<Message>,
        model: Option<String>,
        request_id: String,
    ) -> impl Stream<Item = AgentEvent> + Send {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.stream_task(messages, model, request_id, tx).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn stream_task(
        &self,
        messages: Vec<Message>,
        model: Option<String>,
        request_id: String,
        tx: mpsc::UnboundedSender<AgentEvent>,
    ) {
        let mut messages = Self::prune_context(messages, self.settings.context_prune_limit);
        let active_tools = self.snapshot_tools(None);

        let mut step = 0usize;
        let mut finished = false;

        while step < self.settings.max_tool_steps {
            step += 1;

            let mut chunks = match self
                .backend
                .chat_stream(&messages, model.as_deref(), &active_tools)
                .await
            {
                Ok(chunks) => chunks,
                Err(err) => {
                    let _ = tx.send(AgentEvent::Error {
                        error: format!("Streaming failed: {err}"),
                        request_id: request_id.clone(),
                    });
                    return;
                }
            };

            let mut content = String::new();
            let mut content_emitted = false;
            let mut pending: Vec<PendingToolCall> = Vec::new();
            let mut usage: Option<Usage> = None;

            let started = Instant::now();
            let mut first_token: Option<Instant> = None;
            let mut token_count = 0u64;
            let mut prob_total = 0f64;
            let mut prob_count = 0u64;

            while let Some(item) = chunks.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(AgentEvent::Error {
                            error: format!("Streaming failed: {err}"),
                            request_id: request_id.clone(),
                        });
                        return;
                    }
                };

                if let Some(chunk_usage) = chunk.usage {
                    usage = Some(chunk_usage);
                }

                for choice in &chunk.choices {
                    if let Some(logprobs) = &choice.logprobs {
                        for token in &logprobs.content {
                            prob_total += token.logprob.exp();
                            prob_count += 1;
                        }
                    }

                    if let Some(text) = &choice.delta.content {
                        if !text.is_empty() {
                            if first_token.is_none() {
                                let ttft = started.elapsed();
                                first_token = Some(Instant::now());
                                info!("[{request_id}] stream TTFT {:.0?}", ttft);
                            }
                            token_count += 1;
                            content.push_str(text);
                            content_emitted = true;
                            if tx.send(AgentEvent::Token { content: text.clone() }).is_err() {
                                return;
                            }
                        }
                    }

                    // Accumulate tool-call fragments into a sparse array;
                    // fragments without an index belong to slot zero.
                    if let Some(deltas) = &choice.delta.tool_calls {
                        for delta in deltas {
                            let index = delta.index.unwrap_or(0);
                            while pending.len() <= index {
                                pending.push(PendingToolCall::default());
                            }
                            let slot = &mut pending[index];
                            if let Some(id) = &delta.id {
                                slot.id.push_str(id);
                            }
                            if let Some(function) = &delta.function {
                                if let Some(name) = &function.name {
                                    slot.name.push_str(name);
                                }
                                if let Some(arguments) = &function.arguments {
                                    slot.arguments.push_str(arguments);
                                }
                            }
                        }
                    }
                }
            }

            // End of model stream: normalize the accumulated tool calls.
            let millis = chrono::Utc::now().timestamp_millis();
            let mut calls: Vec<ToolCall> = pending
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.name.is_empty())
                .map(|(index, slot)| ToolCall {
                    id: if slot.id.is_empty() {
                        format!("call_{millis}_{index}")
                    } else {
                        slot.id.clone()
                    },
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: rescue::normalize_tool_name(&slot.name).to_string(),
                        arguments: if slot.arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            slot.arguments.clone()
                        },
                    },
                })
                .collect();

            if calls.is_empty() {
                if let Some(rescued) = rescue::rescue_tool_calls(&content) {
                    warn!(
                        "[{request_id}] converted streamed text into {} tool calls",
                        rescued.len()
                    );
                    calls = rescued;
                }
            }

            if !calls.is_empty() {
                messages.push(Message {
                    role: Role::Assistant,
                    content: if content.is_empty() { None } else { Some(content.clone()) },
                    name: None,
                    tool_call_id: None,
                    tool_calls: Some(calls.clone()),
                });

                if tx.send(AgentEvent::ThinkingStart { count: calls.len() }).is_err() {
                    return;
                }
                for call in &calls {
                    let event = AgentEvent::ToolStart {
                        tool: call.function.name.clone(),
                        input: call.function.parsed_arguments(),
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }

                let tool_messages = self.fan_out(&calls, &request_id).await;
                for message in tool_messages {
                    let event = AgentEvent::ToolEnd {
                        tool: message.name.clone().unwrap_or_default(),
                        output: message.text().to_string(),
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                    messages.push(message);
                }

                // Model observes the tool output on the next iteration.
                continue;
            }

            // No tool calls: this was the final answer. Never leave the
            // client with a blank stream.
            if !content_emitted && content.trim().is_empty() {
                content = "How can I help?".to_string();
                if tx.send(AgentEvent::Token { content: content.clone() }).is_err() {
                    return;
                }
            }
            messages.push(Message::assistant(content.clone()));

            let metrics = StreamMetrics {
                ttft_ms: first_token
                    .map(|t| t.duration_since(started).as_millis() as u64)
                    .unwrap_or(0),
                tokens: token_count,
                duration_ms: started.elapsed().as_millis() as u64,
                confidence: (prob_count > 0).then(|| prob_total / prob_count as f64),
            };
            let _ = tx.send(AgentEvent::Done {
                usage,
                metrics: Some(metrics),
            });
            finished = true;
            break;
        }

        // Step budget exhausted on a tool round: the stream still ends
        // with exactly one terminal event.
        if !finished {
            let _ = tx.send(AgentEvent::Done {
                usage: None,
                metrics: None,
            });
        }
    }
}
