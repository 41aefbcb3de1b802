// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The bounded model ↔ tool iteration loop.
//!
//! One [`Orchestrator::run`] call answers one user message: it streams model
//! output, executes requested tools concurrently, feeds compacted results
//! back, and terminates within the iteration budget.  Every observable step
//! leaves through the event channel; exactly one `done` (or a terminal
//! `error`) ends the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tove_model::{
    classify::{classify, FailReason},
    with_retries, ChatMessage, Content, GenEvent, GenRequest, ModelClient, Part, ProviderError,
    ToolMode,
};
use tove_tools::{run_tool, ResultCompactor, ToolRegistry, ToolResult};

use crate::events::{StreamEvent, ToolCallRecord};

/// Per-run knobs, resolved by the gateway from config.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model: String,
    pub system_instruction: String,
    pub agent_id: String,
    pub thinking_budget: Option<u32>,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub soft_limit: u32,
    pub tool_timeout: Duration,
    pub enable_tools: bool,
    pub max_fanout: usize,
    pub max_attempts: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".into(),
            system_instruction: String::new(),
            agent_id: "agent".into(),
            thinking_budget: None,
            temperature: None,
            max_iterations: 8,
            soft_limit: 6,
            tool_timeout: Duration::from_secs(30),
            enable_tools: true,
            max_fanout: 8,
            max_attempts: 3,
        }
    }
}

/// A buffered function call awaiting execution at the end of the model turn.
struct PendingCall {
    id: String,
    name: String,
    args: Value,
    thought_signature: Option<String>,
}

/// Per-tool invocation counters for the budget summary.
#[derive(Default)]
struct ToolMetrics {
    per_tool: HashMap<String, (u64, u64)>, // count, total latency ms
}

impl ToolMetrics {
    fn record(&mut self, tool: &str, latency_ms: u64) {
        let entry = self.per_tool.entry(tool.to_string()).or_default();
        entry.0 += 1;
        entry.1 += latency_ms;
    }

    /// `tool=X count=N avg=Mms; …`, sorted by count descending.
    fn summary(&self) -> String {
        let mut rows: Vec<(&str, u64, u64)> = self
            .per_tool
            .iter()
            .map(|(name, (count, total))| (name.as_str(), *count, total / (*count).max(1)))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        rows.iter()
            .map(|(name, count, avg)| format!("tool={name} count={count} avg={avg}ms"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn is_empty(&self) -> bool {
        self.per_tool.is_empty()
    }
}

/// How one streamed model turn ended.
enum TurnEnd {
    /// Stream drained; zero or more function calls are pending.
    Finished(Vec<PendingCall>),
    /// The provider rejected or aborted on context size; the caller
    /// terminates with whatever has accumulated.
    ContextOverflow,
    Cancelled,
    Failed(String),
}

pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    results: Arc<ResultCompactor>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        results: Arc<ResultCompactor>,
    ) -> Self {
        Self {
            client,
            registry,
            results,
        }
    }

    /// Run one generation.  All output leaves through `tx`; the call returns
    /// when the terminal `done` or `error` event has been emitted (or the
    /// receiver disappeared).
    pub async fn run(
        &self,
        cfg: RunConfig,
        initial_contents: Vec<Content>,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut contents = initial_contents;
        let mut all_tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut full_content = String::new();
        let mut metrics = ToolMetrics::default();
        let mut call_seq = 0usize;
        let mut iteration = 0u32;

        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(StreamEvent::Error { message: "cancelled".into() }).await;
                return;
            }

            // Budget exhausted: one final tool-free synthesis pass when tools
            // ran but no user-visible text was ever produced.
            if iteration >= cfg.max_iterations {
                if full_content.is_empty() && !all_tool_calls.is_empty() {
                    debug!(agent = %cfg.agent_id, "iteration budget reached, running final synthesis");
                    let system = format!(
                        "{}\n\n{}",
                        cfg.system_instruction,
                        synthesis_block(&metrics)
                    );
                    match self
                        .stream_turn(&cfg, &contents, &system, false, &cancel, &tx, &mut full_content, &mut call_seq)
                        .await
                    {
                        TurnEnd::Cancelled => {
                            let _ = tx.send(StreamEvent::Error { message: "cancelled".into() }).await;
                            return;
                        }
                        // Whatever happened, the budget is spent: finish with
                        // whatever text exists.
                        TurnEnd::Finished(_) | TurnEnd::ContextOverflow | TurnEnd::Failed(_) => {}
                    }
                }
                self.emit_done(&tx, &full_content, &all_tool_calls).await;
                return;
            }

            // Soft limit: nudge the model toward synthesis.
            let mut system = cfg.system_instruction.clone();
            if iteration >= cfg.soft_limit {
                let remaining = cfg.max_iterations - iteration;
                system.push_str(&format!("\n\n{}", budget_block(remaining, &metrics)));
            }

            let with_tools = cfg.enable_tools && !self.registry.is_empty();
            let turn = self
                .stream_turn(&cfg, &contents, &system, with_tools, &cancel, &tx, &mut full_content, &mut call_seq)
                .await;

            let pending = match turn {
                TurnEnd::Finished(pending) => pending,
                TurnEnd::ContextOverflow => {
                    // The pre-generation compaction should have prevented
                    // this; end the turn with what we have.
                    warn!(agent = %cfg.agent_id, "context overflow mid-generation, terminating");
                    self.emit_done(&tx, &full_content, &all_tool_calls).await;
                    return;
                }
                TurnEnd::Cancelled => {
                    let _ = tx.send(StreamEvent::Error { message: "cancelled".into() }).await;
                    return;
                }
                TurnEnd::Failed(message) => {
                    let _ = tx.send(StreamEvent::Error { message }).await;
                    return;
                }
            };

            if pending.is_empty() {
                self.emit_done(&tx, &full_content, &all_tool_calls).await;
                return;
            }

            // Echo the model turn with its function calls (and any thought
            // signatures) before the responses.
            contents.push(Content::model(
                pending
                    .iter()
                    .map(|p| {
                        Part::function_call(&p.name, p.args.clone(), p.thought_signature.clone())
                    })
                    .collect(),
            ));

            let outcomes = self.execute_pending(&cfg, &pending, &cancel).await;

            let mut response_parts = Vec::with_capacity(outcomes.len());
            for (call, (result, latency_ms)) in pending.iter().zip(outcomes) {
                metrics.record(&call.name, latency_ms);
                all_tool_calls.push(ToolCallRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.args.clone(),
                    thought_signature: call.thought_signature.clone(),
                });
                let _ = tx
                    .send(StreamEvent::ToolEnd {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        result: result.clone(),
                    })
                    .await;

                let response = match &result.error {
                    Some(e) => json!({ "error": e }),
                    None => {
                        let compacted =
                            self.results
                                .compact(&call.name, result.text(), &cfg.agent_id, iteration);
                        json!({ "output": compacted })
                    }
                };
                response_parts.push(Part::function_response(&call.name, response));
            }
            contents.push(Content::user(response_parts));

            // Cancellation observed during the tool phase ends the run here:
            // tool_end events above are already out, no new model turn starts.
            if cancel.is_cancelled() {
                let _ = tx.send(StreamEvent::Error { message: "cancelled".into() }).await;
                return;
            }

            iteration += 1;
        }
    }

    /// Stream one model call, forwarding text deltas and buffering function
    /// calls.  `full_content` and `call_seq` persist across iterations.
    #[allow(clippy::too_many_arguments)]
    async fn stream_turn(
        &self,
        cfg: &RunConfig,
        contents: &[Content],
        system_instruction: &str,
        with_tools: bool,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<StreamEvent>,
        full_content: &mut String,
        call_seq: &mut usize,
    ) -> TurnEnd {
        let req = GenRequest {
            model: cfg.model.clone(),
            contents: contents.to_vec(),
            system_instruction: Some(system_instruction.to_string()),
            tools: if with_tools {
                self.registry.definitions()
            } else {
                Vec::new()
            },
            tool_mode: if with_tools { ToolMode::Auto } else { ToolMode::None },
            max_output_tokens: None,
            temperature: cfg.temperature,
            thinking_budget: cfg.thinking_budget,
        };

        let mut stream = match with_retries(cfg.max_attempts, cancel, || {
            self.client.stream(&req, cancel.child_token())
        })
        .await
        {
            Ok(s) => s,
            Err(e) => return classify_turn_failure(e),
        };

        let mut pending: Vec<PendingCall> = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(GenEvent::TextDelta(delta)) => {
                    full_content.push_str(&delta);
                    if tx
                        .send(StreamEvent::TextDelta { delta })
                        .await
                        .is_err()
                    {
                        return TurnEnd::Cancelled;
                    }
                }
                Ok(GenEvent::FunctionCall {
                    name,
                    args,
                    thought_signature,
                }) => {
                    if !with_tools {
                        // Tools are off for this turn (final synthesis); a
                        // stray call cannot be executed, so it is dropped
                        // rather than surfaced as an unpaired tool_start.
                        warn!(tool = %name, "ignoring function call in tool-free turn");
                        continue;
                    }
                    *call_seq += 1;
                    let call = PendingCall {
                        id: format!("call_{call_seq}"),
                        name,
                        args,
                        thought_signature,
                    };
                    if tx
                        .send(StreamEvent::ToolStart {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.args.clone(),
                            thought_signature: call.thought_signature.clone(),
                        })
                        .await
                        .is_err()
                    {
                        return TurnEnd::Cancelled;
                    }
                    pending.push(call);
                }
                Ok(GenEvent::Done { .. }) => break,
                Err(e) => return classify_turn_failure(e),
            }
        }

        if cancel.is_cancelled() {
            return TurnEnd::Cancelled;
        }
        TurnEnd::Finished(pending)
    }

    /// Execute the pending calls concurrently with bounded fan-out, returning
    /// `(result, latency_ms)` per call in request order.
    async fn execute_pending(
        &self,
        cfg: &RunConfig,
        pending: &[PendingCall],
        cancel: &CancellationToken,
    ) -> Vec<(ToolResult, u64)> {
        let semaphore = Arc::new(Semaphore::new(cfg.max_fanout.max(1)));
        let mut tasks = Vec::with_capacity(pending.len());

        for call in pending {
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&semaphore);
            let token = cancel.child_token();
            let timeout = cfg.tool_timeout;
            let (id, name, args) = (call.id.clone(), call.name.clone(), call.args.clone());
            tasks.push(tokio::spawn(async move {
                // A closed semaphore cannot happen; treat failure as cancel.
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let result = match registry.get(&name) {
                    Some(tool) => run_tool(tool, &id, &args, timeout, token).await,
                    None => ToolResult::err(&id, format!("unknown tool: {name}")),
                };
                (result, started.elapsed().as_millis() as u64)
            }));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (call, task) in pending.iter().zip(tasks) {
            let outcome = match task.await {
                Ok(o) => o,
                Err(e) => (
                    ToolResult::err(&call.id, format!("tool panicked: {e}")),
                    0,
                ),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn emit_done(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        full_content: &str,
        all_tool_calls: &[ToolCallRecord],
    ) {
        let message = ChatMessage::assistant(strip_reasoning_tags(full_content));
        let tool_calls = if all_tool_calls.is_empty() {
            None
        } else {
            Some(all_tool_calls.to_vec())
        };
        let _ = tx.send(StreamEvent::Done { message, tool_calls }).await;
    }
}

fn classify_turn_failure(e: ProviderError) -> TurnEnd {
    if matches!(e, ProviderError::Cancelled) {
        return TurnEnd::Cancelled;
    }
    match classify(&e).reason {
        FailReason::ContextOverflow => TurnEnd::ContextOverflow,
        _ => TurnEnd::Failed(e.to_string()),
    }
}

fn budget_block(remaining: u32, metrics: &ToolMetrics) -> String {
    let mut block = format!(
        "Tool Budget: {remaining} rounds remaining. Finish gathering what you \
         still need and move toward your final answer."
    );
    if !metrics.is_empty() {
        block.push_str(&format!("\nTool usage so far: {}", metrics.summary()));
    }
    block
}

fn synthesis_block(metrics: &ToolMetrics) -> String {
    let mut block = String::from(
        "Tool Budget: no rounds remaining. Do not call any more tools. Using \
         the tool results above, write your final answer for the user now.",
    );
    if !metrics.is_empty() {
        block.push_str(&format!("\nTool usage so far: {}", metrics.summary()));
    }
    block
}

/// Strip `<think>…</think>` wrappers before the message is persisted.  An
/// unclosed block (the model was cut off mid-thought) is dropped to the end
/// of the text.
fn strip_reasoning_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
