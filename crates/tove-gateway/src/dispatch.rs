// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Frame dispatch — the transport-agnostic half of the gateway.
//!
//! Frames come in, [`ServerFrame`]s go out over a bounded channel; the
//! WebSocket layer in `server.rs` is a thin shim on both sides.  Keeping the
//! dispatch free of socket types makes every flow testable in-process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tove_config::{Config, PromptMode};
use tove_core::{
    build_system_prompt, compact_if_needed, estimate_tokens, should_compact, CompactPhase,
    Orchestrator, PromptInputs, QueuedMessage, RunConfig, RuntimeInfo, SessionStore, StreamEvent,
};
use tove_model::{adapter::to_provider_contents, ChatMessage, ModelClient};
use tove_tools::{ContextStore, ResultCompactor, ToolRegistry};

use crate::frames::{ClientFrame, ControlFrame, ServerFrame};

pub struct Gateway {
    config: Config,
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    context: Arc<dyn ContextStore>,
    store: Arc<SessionStore>,
    orchestrator: Orchestrator,
    runtime: RuntimeInfo,
}

impl Gateway {
    pub fn new(
        config: Config,
        client: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        context: Arc<dyn ContextStore>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(Duration::from_secs(
            config.gateway.session_ttl_secs,
        )));
        let orchestrator = Orchestrator::new(
            client.clone(),
            registry.clone(),
            Arc::new(ResultCompactor::new(context.clone())),
        );
        let runtime = RuntimeInfo {
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            os: std::env::consts::OS.to_string(),
            model: config.model.name.clone(),
            default_model: config.model.name.clone(),
            capabilities: Vec::new(),
            thinking: match config.model.thinking_budget {
                Some(b) => b.to_string(),
                None => "off".into(),
            },
        };
        Self {
            config,
            client,
            registry,
            context,
            store,
            orchestrator,
            runtime,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Handle one inbound frame for `session_id`.  `Resume` is handled by
    /// the connection layer (it rebinds the connection's session) and routed
    /// to [`Gateway::resume`].
    pub async fn handle_frame(
        self: Arc<Self>,
        session_id: &str,
        frame: ClientFrame,
        out: &mpsc::Sender<ServerFrame>,
    ) {
        match frame {
            ClientFrame::Send {
                text,
                character_state,
            } => {
                if text.trim().is_empty() {
                    let _ = out
                        .send(ServerFrame::Control(ControlFrame::Error {
                            message: "empty message".into(),
                        }))
                        .await;
                    return;
                }
                let draft = QueuedMessage {
                    text,
                    character_state,
                };
                if self.store.is_busy(session_id) {
                    let position = self.store.enqueue(session_id, draft);
                    debug!(session = session_id, position, "draft queued");
                    let _ = out
                        .send(ServerFrame::Control(ControlFrame::Queued { position }))
                        .await;
                    return;
                }
                let sid = session_id.to_string();
                let out = out.clone();
                tokio::spawn(async move { self.generation_loop(sid, draft, out).await });
            }
            ClientFrame::Cancel => {
                self.store.cancel(session_id);
            }
            ClientFrame::Reset => {
                info!(session = session_id, "session reset");
                self.store.reset(session_id);
            }
            ClientFrame::Resume { session_id: sid } => {
                self.resume(&sid, out).await;
            }
        }
    }

    /// Reply with the history length, then mirror the history itself.
    pub async fn resume(&self, session_id: &str, out: &mpsc::Sender<ServerFrame>) {
        let messages = self.store.snapshot(session_id);
        debug!(session = session_id, count = messages.len(), "session resumed");
        let _ = out
            .send(ServerFrame::Control(ControlFrame::SessionResumed {
                count: messages.len(),
            }))
            .await;
        let _ = out
            .send(ServerFrame::Control(ControlFrame::History { messages }))
            .await;
    }

    /// Run one generation, then keep draining the queue until it is empty.
    /// One queued draft starts per completion, so a `cancel` between flushes
    /// applies to exactly one generation.
    async fn generation_loop(
        self: Arc<Self>,
        session_id: String,
        first: QueuedMessage,
        out: mpsc::Sender<ServerFrame>,
    ) {
        let mut next = Some(first);
        while let Some(draft) = next.take() {
            let Some(token) = self.store.begin_generation(&session_id) else {
                // Lost the race against another connection: queue it instead.
                let position = self.store.enqueue(&session_id, draft);
                let _ = out
                    .send(ServerFrame::Control(ControlFrame::Queued { position }))
                    .await;
                return;
            };
            self.run_one(&session_id, draft, token, &out).await;
            self.store.end_generation(&session_id);
            next = self.store.flush_next(&session_id);
            if next.is_some() {
                debug!(session = %session_id, "starting queued draft");
            }
        }
    }

    /// One full generation: append the user message, build the prompt, run
    /// the compaction check, stream the orchestrator, persist the result.
    async fn run_one(
        &self,
        session_id: &str,
        draft: QueuedMessage,
        token: tokio_util::sync::CancellationToken,
        out: &mpsc::Sender<ServerFrame>,
    ) {
        self.store.append(session_id, ChatMessage::user(draft.text));

        let context_files = self.load_context_files();
        let system_prompt = build_system_prompt(&PromptInputs {
            agent: &self.config.agent,
            registry: &self.registry,
            context_files: &context_files,
            workspace_dir: &self.config.workspace.dir,
            runtime: &self.runtime,
            character_state: draft.character_state.as_deref(),
            reaction_guidance: None,
        });

        // Compaction check before the generation; frames bracket the model
        // call so the client can show progress.
        let messages = self.store.snapshot(session_id);
        let system_tokens = estimate_tokens(&system_prompt);
        let limit = self.config.agent.context_limit;
        let messages = if should_compact(system_tokens, &messages, limit) {
            let _ = out
                .send(ServerFrame::Event(StreamEvent::Compacting {
                    phase: CompactPhase::Start,
                    messages_compacted: None,
                }))
                .await;
            let result = compact_if_needed(
                self.client.as_ref(),
                &self.config.model.name,
                messages,
                system_tokens,
                limit,
            )
            .await;
            let _ = out
                .send(ServerFrame::Event(StreamEvent::Compacting {
                    phase: CompactPhase::Done,
                    messages_compacted: Some(result.messages_compacted),
                }))
                .await;
            if result.compacted {
                info!(
                    session = session_id,
                    tokens_before = result.tokens_before,
                    tokens_after = result.tokens_after,
                    "history compacted"
                );
                self.store.replace(session_id, result.messages.clone());
            }
            result.messages
        } else {
            messages
        };

        let cfg = RunConfig {
            model: self.config.model.name.clone(),
            system_instruction: system_prompt,
            agent_id: session_id.to_string(),
            thinking_budget: self.config.model.thinking_budget,
            temperature: self.config.model.temperature,
            max_iterations: self.config.agent.max_iterations,
            soft_limit: self.config.agent.soft_limit,
            tool_timeout: Duration::from_secs(self.config.tools.timeout_secs),
            enable_tools: true,
            max_fanout: self.config.tools.max_fanout,
            max_attempts: self.config.model.max_attempts,
        };
        let contents = to_provider_contents(&messages);

        let (etx, mut erx) = mpsc::channel::<StreamEvent>(self.config.gateway.channel_capacity);
        let run = self.orchestrator.run(cfg, contents, token.clone(), etx);
        let forward = async {
            while let Some(event) = erx.recv().await {
                if let StreamEvent::Done { message, .. } = &event {
                    self.store.append(session_id, message.clone());
                }
                if out.send(ServerFrame::Event(event)).await.is_err() {
                    // Client gone: tear the generation down promptly.
                    warn!(session = session_id, "client write failed, cancelling");
                    token.cancel();
                }
            }
        };
        tokio::join!(run, forward);
    }

    /// Read every context file from the store when the prompt mode embeds
    /// them.  Binary or unreadable entries are skipped.
    fn load_context_files(&self) -> Vec<(String, String)> {
        if self.config.agent.prompt_mode != PromptMode::Full {
            return Vec::new();
        }
        self.context
            .list()
            .into_iter()
            .filter_map(|path| {
                let bytes = self.context.read(&path)?;
                let text = String::from_utf8(bytes).ok()?;
                Some((path, text))
            })
            .collect()
    }
}

// ─── Dispatch tests ──────────────────────────────────────────────────────────
