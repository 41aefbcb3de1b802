// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the session history.  Immutable once created; system
/// messages carry compaction summaries and always sit at the head of history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A system message carrying an explicit id (compaction summaries use
    /// `summary_<ts>` so they are recognizable in exported histories).
    pub fn system_with_id(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(Role::System, content)
        }
    }
}

// ─── Provider wire types ──────────────────────────────────────────────────────

/// One element of the provider's message array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: ContentRole,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: ContentRole::User,
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: ContentRole::Model,
            parts,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    User,
    Model,
}

/// A typed fragment inside a [`Content`] entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
        #[serde(rename = "thoughtSignature", skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    Text { text: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn function_call(
        name: impl Into<String>,
        args: Value,
        thought_signature: Option<String>,
    ) -> Self {
        Self::FunctionCall {
            function_call: FunctionCall {
                name: name.into(),
                args,
            },
            thought_signature,
        }
    }

    pub fn function_response(name: impl Into<String>, response: Value) -> Self {
        Self::FunctionResponse {
            function_response: FunctionResponse {
                name: name.into(),
                response,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Function-calling mode forwarded as `toolConfig.functionCallingConfig.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolMode {
    #[default]
    Auto,
    Any,
    None,
}

impl ToolMode {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Any => "ANY",
            Self::None => "NONE",
        }
    }
}

/// A tool declaration sent to the provider.  `parameters` must already obey
/// the restricted schema dialect (see [`crate::schema::sanitize`]); the
/// Gemini client applies it once more at request-build time as a safety net.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One provider request, streaming or not.
#[derive(Debug, Clone, Default)]
pub struct GenRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDecl>,
    pub tool_mode: ToolMode,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking_budget: Option<u32>,
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Terminal usage statistics from `usageMetadata`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMeta {
    pub prompt_tokens: u32,
    pub candidates_tokens: u32,
    pub total_tokens: u32,
}

/// A single event decoded from the provider stream.
#[derive(Debug, Clone)]
pub enum GenEvent {
    TextDelta(String),
    FunctionCall {
        name: String,
        args: Value,
        thought_signature: Option<String>,
    },
    Done { usage: Option<UsageMeta> },
}

/// A fully-read non-streaming response.
#[derive(Debug, Clone, Default)]
pub struct GenResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    pub usage: Option<UsageMeta>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failures surfaced by a [`crate::ModelClient`].  The classifier
/// ([`crate::classify`]) maps these onto a retry policy by inspecting the
/// rendered message, so `Display` includes the status code and body.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timeout")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
