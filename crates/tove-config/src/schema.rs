// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name forwarded to the Gemini API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override.  Useful for proxies and record/replay harnesses.
    pub base_url: Option<String>,
    /// Per-request ceiling for provider calls, streaming or not.
    pub request_timeout_secs: u64,
    /// Maximum attempts for retryable provider failures.
    pub max_attempts: u32,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Token budget forwarded as `thinkingConfig.thinkingBudget`.
    pub thinking_budget: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gemini-2.0-flash".into(),
            api_key_env: Some("GEMINI_API_KEY".into()),
            api_key: None,
            base_url: None,
            request_timeout_secs: 120,
            max_attempts: 3,
            temperature: None,
            thinking_budget: None,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: explicit value first, then the configured env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        if let Some(env) = &self.api_key_env {
            return std::env::var(env).ok();
        }
        None
    }
}

/// How much of the system prompt to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Every section, including memory, workspace files and project context.
    #[default]
    Full,
    /// Core sections only; memory, reactions, workspace-file enumeration and
    /// project-context bodies are omitted.
    Minimal,
    /// A one-line identity, nothing else.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Display name injected into the identity preamble.
    pub name: String,
    /// Optional custom identity section appended after the preamble.
    pub identity: Option<String>,
    /// Optional response-style override.
    pub response_style: Option<String>,
    /// Text appended verbatim near the end of the system prompt.
    pub extra_system_prompt: Option<String>,
    #[serde(default)]
    pub prompt_mode: PromptMode,
    /// Hard ceiling on model↔tool rounds per generation.
    pub max_iterations: u32,
    /// Round at which the tool-budget nudge is appended to the prompt.
    pub soft_limit: u32,
    /// Context window the compactor defends, in estimated tokens.
    pub context_limit: usize,
    /// Ask the model to wrap chain-of-thought in reasoning tags.
    #[serde(default)]
    pub reasoning_tags: bool,
    /// IANA timezone used for the time block.
    pub timezone: String,
    /// Channel label reported in the runtime line (e.g. "websocket").
    pub channel: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "tove".into(),
            identity: None,
            response_style: None,
            extra_system_prompt: None,
            prompt_mode: PromptMode::Full,
            max_iterations: 8,
            soft_limit: 6,
            context_limit: 128_000,
            reasoning_tags: false,
            timezone: "UTC".into(),
            channel: "websocket".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Per-invocation wall-clock limit before a tool is abandoned.
    pub timeout_secs: u64,
    /// Cap on concurrently running tools within one iteration.
    pub max_fanout: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_fanout: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// TCP bind address for the WebSocket server.
    pub bind: String,
    /// Outbound event-channel capacity per connection.  Writes block the
    /// generation when the client cannot keep up.
    pub channel_capacity: usize,
    /// Idle sessions older than this are dropped.
    pub session_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8474".into(),
            channel_capacity: 64,
            session_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory backing the context store (spilled tool results, context
    /// files embedded into the prompt).
    pub dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: "./workspace".into(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
