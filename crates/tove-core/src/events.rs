// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::Value;
use tove_model::ChatMessage;
use tove_tools::ToolResult;

/// A tool call recorded during a generation; echoed in the final `done`
/// event so clients can render the full call history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactPhase {
    Start,
    Done,
}

/// Events emitted by one generation, in emission order.  The gateway
/// forwards them to the client verbatim; `done` is always last on the
/// success path, `error` on the failure/cancel path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    TextDelta {
        delta: String,
    },
    ToolStart {
        call_id: String,
        name: String,
        arguments: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ToolEnd {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    Compacting {
        phase: CompactPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages_compacted: Option<usize>,
    },
    Done {
        message: ChatMessage,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallRecord>>,
    },
    Error {
        message: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
