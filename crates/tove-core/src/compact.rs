// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model-assisted history compaction.
//!
//! When the estimated context usage crosses the trigger threshold, the older
//! prefix of the history is summarized by the model itself and replaced with
//! a single system message.  The recent tail — the last few user turns and
//! their responses — is always preserved verbatim.
//!
//! Every provider failure degrades to a deterministic turn-limit fallback so
//! compaction can never leave a session unusable.

use tove_model::{ChatMessage, Content, GenRequest, ModelClient, Part, Role, ToolMode};
use tracing::{debug, warn};

use crate::tokens::{
    chunk_by_tokens, estimate_messages_tokens, should_compact, split_for_compaction,
    RECENT_TURNS_TO_KEEP,
};

/// Marker prefix of the summary system message.
pub const SUMMARY_PREFIX: &str = "[Conversation Summary]";

/// Fraction of the context window a single summarization call may consume.
const SUMMARIZATION_CHUNK_FRACTION: f64 = 0.40;
/// Per-message clip applied before transcript formatting, chars.
const TRANSCRIPT_MESSAGE_CAP: usize = 8000;
/// Sampling temperature for summarization calls.
const SUMMARY_TEMPERATURE: f32 = 0.3;
/// Output budget for summarization calls.
const SUMMARY_MAX_OUTPUT_TOKENS: u32 = 4096;

const SUMMARIZE_PROMPT: &str = "You are a conversation compaction assistant. Produce a concise \
     summary of the conversation that preserves key facts the user shared, topics discussed, \
     decisions made, and ongoing context. Write in the third person. Organize by topic, not \
     chronologically. Target roughly 20% of the original length. If a previous summary is \
     provided, merge its content with the new conversation.";

const MERGE_PROMPT: &str = "You are a conversation compaction assistant. Merge the following \
     partial summaries of one conversation into a single coherent summary. Keep every distinct \
     fact, decision and open thread. Write in the third person and organize by topic.";

/// Outcome of [`compact_if_needed`].
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub compacted: bool,
    pub messages: Vec<ChatMessage>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_compacted: usize,
}

impl CompactionResult {
    fn untouched(messages: Vec<ChatMessage>, tokens: usize) -> Self {
        Self {
            compacted: false,
            messages,
            tokens_before: tokens,
            tokens_after: tokens,
            messages_compacted: 0,
        }
    }
}

/// Compact `messages` when the estimate crosses the threshold; otherwise
/// return them untouched.
pub async fn compact_if_needed(
    client: &dyn ModelClient,
    model: &str,
    messages: Vec<ChatMessage>,
    system_tokens: usize,
    limit: usize,
) -> CompactionResult {
    let tokens_before = estimate_messages_tokens(&messages);
    if !should_compact(system_tokens, &messages, limit) {
        return CompactionResult::untouched(messages, tokens_before);
    }

    let split = split_for_compaction(&messages);
    if split.to_compact.is_empty() {
        return CompactionResult::untouched(messages, tokens_before);
    }
    let messages_compacted = split.to_compact.len();

    // A prior summary is merged rather than re-summarized as prose.
    let (previous_summary, to_summarize): (Option<String>, Vec<ChatMessage>) = {
        let mut prev = None;
        let mut rest = Vec::with_capacity(split.to_compact.len());
        for m in split.to_compact {
            if m.role == Role::System && m.content.starts_with(SUMMARY_PREFIX) && prev.is_none() {
                prev = Some(
                    m.content
                        .trim_start_matches(SUMMARY_PREFIX)
                        .trim_start()
                        .to_string(),
                );
            } else {
                rest.push(m);
            }
        }
        (prev, rest)
    };

    let chunk_max = (SUMMARIZATION_CHUNK_FRACTION * limit as f64) as usize;
    let summary = if estimate_messages_tokens(&to_summarize) <= chunk_max {
        summarize_once(client, model, previous_summary.as_deref(), &to_summarize).await
    } else {
        summarize_chunked(client, model, previous_summary.as_deref(), &to_summarize, chunk_max)
            .await
    };

    match summary {
        Ok(summary) if !summary.trim().is_empty() => {
            let summary_msg = ChatMessage::system_with_id(
                format!("summary_{}", chrono::Utc::now().timestamp_millis()),
                format!("{SUMMARY_PREFIX}\n{}", summary.trim()),
            );
            let mut new_messages = Vec::with_capacity(1 + split.to_keep.len());
            new_messages.push(summary_msg);
            new_messages.extend(split.to_keep);
            let tokens_after = estimate_messages_tokens(&new_messages);
            debug!(
                tokens_before,
                tokens_after, messages_compacted, "history compacted"
            );
            CompactionResult {
                compacted: true,
                messages: new_messages,
                tokens_before,
                tokens_after,
                messages_compacted,
            }
        }
        outcome => {
            if let Err(e) = outcome {
                warn!("summarization failed, falling back to turn limiting: {e}");
            } else {
                warn!("summarization returned empty text, falling back to turn limiting");
            }
            let new_messages = turn_limit_fallback(&messages);
            let tokens_after = estimate_messages_tokens(&new_messages);
            CompactionResult {
                compacted: true,
                messages: new_messages,
                tokens_before,
                tokens_after,
                messages_compacted,
            }
        }
    }
}

/// One-shot summarization of a set that fits the chunk budget.
async fn summarize_once(
    client: &dyn ModelClient,
    model: &str,
    previous_summary: Option<&str>,
    messages: &[ChatMessage],
) -> anyhow::Result<String> {
    let transcript = format_transcript(messages);
    let body = match previous_summary {
        Some(prev) => format!("Previous summary:\n{prev}\n\nConversation:\n{transcript}"),
        None => format!("Conversation:\n{transcript}"),
    };
    let resp = client
        .generate(&summary_request(model, SUMMARIZE_PROMPT, body))
        .await?;
    Ok(resp.text)
}

/// Map/merge path for oversized sets: summarize each chunk independently,
/// then merge the partials (and any previous summary) with a second call.
/// A failed merge degrades to concatenation.
async fn summarize_chunked(
    client: &dyn ModelClient,
    model: &str,
    previous_summary: Option<&str>,
    messages: &[ChatMessage],
    chunk_max: usize,
) -> anyhow::Result<String> {
    let chunks = chunk_by_tokens(messages, chunk_max);
    debug!(chunks = chunks.len(), "chunked summarization");

    let mut partials: Vec<String> = Vec::with_capacity(chunks.len() + 1);
    if let Some(prev) = previous_summary {
        partials.push(prev.to_string());
    }
    for chunk in &chunks {
        let resp = client
            .generate(&summary_request(
                model,
                SUMMARIZE_PROMPT,
                format!("Conversation:\n{}", format_transcript(chunk)),
            ))
            .await?;
        partials.push(resp.text);
    }

    let joined = partials.join("\n\n");
    match client
        .generate(&summary_request(model, MERGE_PROMPT, joined.clone()))
        .await
    {
        Ok(resp) if !resp.text.trim().is_empty() => Ok(resp.text),
        Ok(_) => Ok(joined),
        Err(e) => {
            warn!("summary merge failed, concatenating partials: {e}");
            Ok(joined)
        }
    }
}

fn summary_request(model: &str, prompt: &str, body: String) -> GenRequest {
    GenRequest {
        model: model.to_string(),
        contents: vec![Content::user(vec![Part::text(body)])],
        system_instruction: Some(prompt.to_string()),
        tools: Vec::new(),
        tool_mode: ToolMode::None,
        max_output_tokens: Some(SUMMARY_MAX_OUTPUT_TOKENS),
        temperature: Some(SUMMARY_TEMPERATURE),
        thinking_budget: None,
    }
}

/// Deterministic fallback: keep only the tail starting at the
/// `RECENT_TURNS_TO_KEEP + 2`-th most recent user turn, dropping system
/// summaries entirely.
fn turn_limit_fallback(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let keep_turns = RECENT_TURNS_TO_KEEP + 2;
    let mut seen_users = 0usize;
    let mut keep_from = 0usize;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::User {
            seen_users += 1;
            if seen_users == keep_turns {
                keep_from = i;
                break;
            }
        }
    }
    messages[keep_from..]
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect()
}

fn format_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            let mut text = m.content.as_str();
            if text.len() > TRANSCRIPT_MESSAGE_CAP {
                let mut end = TRANSCRIPT_MESSAGE_CAP;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text = &text[..end];
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tove_model::{GenEvent, MockTurn, ScriptedMockClient};

    /// Test window: small enough that the arithmetic is checkable by hand.
    const LIMIT: usize = 4000;

    /// 5 user/assistant pairs of ~1000 chars (~290 tokens each, ~2 900
    /// total): crosses the 75% trigger of [`LIMIT`], while the two-message
    /// to-compact prefix stays under the 40% single-call budget.
    fn large_history() -> Vec<ChatMessage> {
        let mut msgs = Vec::new();
        for i in 0..5 {
            msgs.push(ChatMessage::user(format!("q{i}-{}", "x".repeat(995))));
            msgs.push(ChatMessage::assistant(format!("a{i}-{}", "y".repeat(995))));
        }
        msgs
    }

    /// 8 pairs: enough user turns that the turn-limit fallback has something
    /// to drop, and a to-compact prefix too big for one summarization call.
    fn fallback_history() -> Vec<ChatMessage> {
        let mut msgs = Vec::new();
        for i in 0..8 {
            msgs.push(ChatMessage::user(format!("q{i}-{}", "x".repeat(995))));
            msgs.push(ChatMessage::assistant(format!("a{i}-{}", "y".repeat(995))));
        }
        msgs
    }

    fn text_turn(text: &str) -> MockTurn {
        MockTurn::Events(vec![
            GenEvent::TextDelta(text.into()),
            GenEvent::Done { usage: None },
        ])
    }

    #[tokio::test]
    async fn below_threshold_is_untouched() {
        let client = ScriptedMockClient::always_text("never called");
        let msgs = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let out = compact_if_needed(&client, "m", msgs.clone(), 100, 128_000).await;
        assert!(!out.compacted);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.tokens_before, out.tokens_after);
        assert!(client.requests.lock().unwrap().is_empty(), "no provider call");
    }

    #[tokio::test]
    async fn compaction_replaces_prefix_with_summary() {
        let client = ScriptedMockClient::new(vec![text_turn("User likes X. Discussed Y.")]);
        let msgs = large_history();
        let out = compact_if_needed(&client, "m", msgs.clone(), 100, LIMIT).await;

        assert!(out.compacted);
        assert!(out.tokens_after < out.tokens_before);
        // Head: exactly one system summary.
        assert_eq!(out.messages[0].role, Role::System);
        assert!(out
            .messages[0]
            .content
            .starts_with("[Conversation Summary]\n"));
        assert!(out.messages[0].content.contains("User likes X. Discussed Y."));
        assert!(out.messages[0].id.starts_with("summary_"));
        // Tail: the last 4 user turns and their responses, in order.
        let tail = &out.messages[1..];
        assert_eq!(tail.len(), 8);
        assert!(tail[0].content.starts_with("q1"));
        assert!(tail[7].content.starts_with("a4"));
        assert_eq!(out.messages_compacted, 2);
    }

    #[tokio::test]
    async fn previous_summary_is_fed_back_into_the_prompt() {
        let client = ScriptedMockClient::new(vec![text_turn("merged summary")]);
        let mut msgs = vec![ChatMessage::system(
            "[Conversation Summary]\nolder facts about the user",
        )];
        msgs.extend(large_history());
        let out = compact_if_needed(&client, "m", msgs, 100, LIMIT).await;

        assert!(out.compacted);
        let req = client.last_request().unwrap();
        let sent = req.contents[0].text();
        assert!(sent.contains("Previous summary:"));
        assert!(sent.contains("older facts about the user"));
        // The old summary message itself is not kept.
        let summaries = out
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(summaries, 1);
    }

    #[tokio::test]
    async fn oversized_set_is_chunked_and_merged() {
        // Chunk budget = 40% of 4000 = 1600 tokens; each turn is ~296 tokens,
        // so the ~50-message to_compact set spans several chunks.
        let turns: Vec<MockTurn> = (0..30).map(|i| text_turn(&format!("part {i}"))).collect();
        let client = ScriptedMockClient::new(turns);

        let mut msgs = Vec::new();
        for i in 0..30 {
            msgs.push(ChatMessage::user(format!("q{i}-{}", "x".repeat(995))));
            msgs.push(ChatMessage::assistant(format!("a{i}-{}", "y".repeat(995))));
        }
        let out = compact_if_needed(&client, "m", msgs, 100, 4000).await;

        assert!(out.compacted);
        let requests = client.requests.lock().unwrap();
        assert!(requests.len() >= 3, "several chunk calls plus a merge call");
        let merge_req = requests.last().unwrap();
        assert_eq!(
            merge_req.system_instruction.as_deref().map(|s| s.contains("Merge")),
            Some(true)
        );
        assert!(out.messages[0].content.starts_with(SUMMARY_PREFIX));
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_turn_limiting() {
        let client = ScriptedMockClient::new(vec![MockTurn::Fail {
            status: 500,
            body: "internal".into(),
        }]);
        let out = compact_if_needed(&client, "m", fallback_history(), 100, LIMIT).await;

        assert!(out.compacted, "fallback still reports compaction");
        assert!(out.tokens_after < out.tokens_before);
        // No summary message; only the recent 6 user turns + responses.
        assert!(out.messages.iter().all(|m| m.role != Role::System));
        let users = out
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        assert_eq!(users, RECENT_TURNS_TO_KEEP + 2);
    }

    #[tokio::test]
    async fn transcript_clips_each_message() {
        let m = ChatMessage::user("z".repeat(10_000));
        let t = format_transcript(std::slice::from_ref(&m));
        assert!(t.len() < 9000);
        assert!(t.starts_with("User: "));
    }
}
