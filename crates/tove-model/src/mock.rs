// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{GenEventStream, ModelClient},
    GenEvent, GenRequest, GenResponse, ProviderError,
};

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Emit these events in order (include a `Done` to end the turn cleanly).
    Events(Vec<GenEvent>),
    /// Fail the call itself with an HTTP error.
    Fail { status: u16, body: String },
}

/// A pre-scripted mock client.  Each `stream`/`generate` call pops the next
/// turn from the front of the queue, so tests specify exact event sequences
/// — including tool calls and failures — without network access.
pub struct ScriptedMockClient {
    turns: Arc<Mutex<Vec<MockTurn>>>,
    /// Every request seen, in call order, so tests can inspect what was sent.
    pub requests: Arc<Mutex<Vec<GenRequest>>>,
}

impl ScriptedMockClient {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: client that answers every call with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![MockTurn::Events(vec![
            GenEvent::TextDelta(r),
            GenEvent::Done { usage: None },
        ])])
    }

    /// Convenience: a tool call on the first turn, a text reply on the second.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            MockTurn::Events(vec![
                GenEvent::FunctionCall {
                    name: tool_name.into(),
                    args,
                    thought_signature: None,
                },
                GenEvent::Done { usage: None },
            ]),
            MockTurn::Events(vec![
                GenEvent::TextDelta(final_text.into()),
                GenEvent::Done { usage: None },
            ]),
        ])
    }

    pub fn last_request(&self) -> Option<GenRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn pop(&self, req: &GenRequest) -> MockTurn {
        self.requests.lock().unwrap().push(req.clone());
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            // Default fallback when all turns are consumed.
            MockTurn::Events(vec![
                GenEvent::TextDelta("[no more scripts]".into()),
                GenEvent::Done { usage: None },
            ])
        } else {
            turns.remove(0)
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    async fn generate(&self, req: &GenRequest) -> Result<GenResponse, ProviderError> {
        match self.pop(req) {
            MockTurn::Fail { status, body } => Err(ProviderError::Http { status, body }),
            MockTurn::Events(events) => {
                let mut out = GenResponse::default();
                for ev in events {
                    match ev {
                        GenEvent::TextDelta(t) => out.text.push_str(&t),
                        GenEvent::FunctionCall { name, args, .. } => out
                            .function_calls
                            .push(crate::FunctionCall { name, args }),
                        GenEvent::Done { usage } => out.usage = usage,
                    }
                }
                Ok(out)
            }
        }
    }

    async fn stream(
        &self,
        req: &GenRequest,
        _cancel: CancellationToken,
    ) -> Result<GenEventStream, ProviderError> {
        match self.pop(req) {
            MockTurn::Fail { status, body } => Err(ProviderError::Http { status, body }),
            MockTurn::Events(events) => {
                let items: Vec<Result<GenEvent, ProviderError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
