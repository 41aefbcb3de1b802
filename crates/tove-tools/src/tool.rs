// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single text item in a tool result.  Structured payloads are JSON
/// encoded into `text`; the result wire shape stays a one-element list so
/// the contract can grow other part kinds without breaking clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl TextPart {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: text.into(),
        }
    }
}

/// The reply of one tool invocation.  Failures are values, not errors: a
/// failed execution carries `error` and is fed back to the model so it can
/// recover or abandon the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: Vec<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result with a single text part.
    pub fn ok(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.into(),
            content: vec![TextPart::new(text)],
            error: None,
        }
    }

    /// Failed result; `msg` doubles as the visible content so the model sees
    /// what went wrong.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            tool_call_id: call_id.into(),
            content: vec![TextPart::new(msg.clone())],
            error: Some(msg),
        }
    }

    /// The first text part, or "" for an empty result.
    pub fn text(&self) -> &str {
        self.content.first().map(|p| p.text.as_str()).unwrap_or("")
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Trait every pluggable capability implements.
///
/// Implementations must be cancel-safe: execution may be abandoned at any
/// await point when the per-call timeout fires or the generation is
/// cancelled (see [`crate::wrap::run_tool`]).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Identifier matching `^[a-zA-Z_][a-zA-Z0-9_]*$`.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON object-schema for the arguments.
    fn parameters_schema(&self) -> Value;
    /// Group label used when the system prompt lists tools.
    fn group(&self) -> &str {
        "general"
    }
    /// Execute the call.  Failures should be returned via [`ToolResult::err`].
    async fn execute(&self, call_id: &str, args: &Value) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
