// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod compact;
mod events;
mod orchestrator;
mod prompts;
mod session;
mod tokens;
#[cfg(test)]
mod tests;

pub use compact::{compact_if_needed, CompactionResult, SUMMARY_PREFIX};
pub use events::{CompactPhase, StreamEvent, ToolCallRecord};
pub use orchestrator::{Orchestrator, RunConfig};
pub use prompts::{build_system_prompt, PromptInputs, RuntimeInfo};
pub use session::{QueuedMessage, SessionStore};
pub use tokens::{
    chunk_by_tokens, estimate_messages_tokens, estimate_tokens, should_compact,
    split_for_compaction, CompactionSplit, RECENT_TURNS_TO_KEEP,
};
