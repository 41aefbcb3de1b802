// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use tove_core::StreamEvent;
use tove_model::ChatMessage;

/// Frames the client sends over the channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Send {
        text: String,
        #[serde(default)]
        character_state: Option<String>,
    },
    Cancel,
    Reset,
    Resume {
        session_id: String,
    },
}

/// Gateway-originated control frames, alongside the forwarded stream events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    /// The session was busy; the draft waits at this queue position.
    Queued { position: usize },
    SessionResumed { count: usize },
    /// History mirror sent right after `session_resumed`.
    History { messages: Vec<ChatMessage> },
    Error { message: String },
}

/// Everything that goes to the client: orchestrator events verbatim, plus
/// the control frames above.  Untagged — both carry their own `type` field.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(StreamEvent),
    Control(ControlFrame),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
