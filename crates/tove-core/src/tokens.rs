// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token estimation and history splitting for compaction.
//!
//! Estimates are heuristic (chars / 3.5, rounded up) — good enough to keep
//! the conversation safely inside the provider window without an exact
//! tokenizer dependency.

use tove_model::{ChatMessage, Role};

/// Fixed structural overhead charged per message on top of its text.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;
/// User turns preserved verbatim when older history is summarized.
pub const RECENT_TURNS_TO_KEEP: usize = 4;
/// Safety multiplier applied to estimates before the threshold check.
const ESTIMATE_HEADROOM: f64 = 1.2;
/// Fraction of the window the estimate may fill before compaction triggers.
const COMPACT_AT_FRACTION: f64 = 0.75;
/// Histories shorter than this are never compacted.
const MIN_MESSAGES_TO_COMPACT: usize = 6;

/// `ceil(len / 3.5)`.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 3.5).ceil() as usize
}

pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    estimate_tokens(&msg.content) + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// True when the history is worth summarizing: enough messages, and the
/// padded estimate crosses the trigger fraction of the window.
pub fn should_compact(system_tokens: usize, messages: &[ChatMessage], limit: usize) -> bool {
    if messages.len() < MIN_MESSAGES_TO_COMPACT {
        return false;
    }
    let estimated = (system_tokens + estimate_messages_tokens(messages)) as f64;
    estimated * ESTIMATE_HEADROOM > COMPACT_AT_FRACTION * limit as f64
}

/// The split decided by [`split_for_compaction`]: `to_compact` is the older
/// prefix, `to_keep` starts at the oldest of the preserved recent user turns.
#[derive(Debug, Clone, Default)]
pub struct CompactionSplit {
    pub to_compact: Vec<ChatMessage>,
    pub to_keep: Vec<ChatMessage>,
}

/// Scan from the end until [`RECENT_TURNS_TO_KEEP`] user turns have passed;
/// everything earlier is up for summarization.  Histories with fewer user
/// turns are kept whole.
pub fn split_for_compaction(messages: &[ChatMessage]) -> CompactionSplit {
    let mut seen_users = 0usize;
    let mut keep_from: Option<usize> = None;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::User {
            seen_users += 1;
            if seen_users == RECENT_TURNS_TO_KEEP {
                keep_from = Some(i);
                break;
            }
        }
    }
    match keep_from {
        Some(i) => CompactionSplit {
            to_compact: messages[..i].to_vec(),
            to_keep: messages[i..].to_vec(),
        },
        None => CompactionSplit {
            to_compact: Vec::new(),
            to_keep: messages.to_vec(),
        },
    }
}

/// Greedily pack messages into chunks whose estimated token sum stays under
/// `max_tokens`.  A single oversized message becomes its own chunk.
pub fn chunk_by_tokens(messages: &[ChatMessage], max_tokens: usize) -> Vec<Vec<ChatMessage>> {
    let mut chunks: Vec<Vec<ChatMessage>> = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();
    let mut current_tokens = 0usize;

    for m in messages {
        let t = estimate_message_tokens(m);
        if !current.is_empty() && current_tokens + t > max_tokens {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += t;
        current.push(m.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
