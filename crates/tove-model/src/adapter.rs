// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation history → provider content array.
//!
//! The provider requires strict user/model alternation starting with a user
//! turn, and has no first-class system role inside `contents`.  This adapter
//! folds system messages into the first user turn and repairs the sequence.

use crate::{ChatMessage, Content, ContentRole, Part, Role};

/// Joined system text is prefixed to the first user turn under this banner
/// when no user turn exists to attach it to.
const CONTEXT_PLACEHOLDER: &str = "(conversation context)";

/// Map session history to the provider's `contents` array.
///
/// - system messages are concatenated (blank-line separated) and prepended
///   into the first user turn, or injected as a synthetic leading user turn;
/// - `user` → `user`, `assistant` → `model`;
/// - consecutive same-role turns merge their parts;
/// - a sequence that would start with `model` gets a placeholder user turn.
pub fn to_provider_contents(messages: &[ChatMessage]) -> Vec<Content> {
    let system_text = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut contents: Vec<Content> = Vec::new();
    let mut system_pending = !system_text.is_empty();

    for m in messages {
        let (role, text) = match m.role {
            Role::System => continue,
            Role::User => {
                if system_pending {
                    system_pending = false;
                    (ContentRole::User, format!("{system_text}\n\n{}", m.content))
                } else {
                    (ContentRole::User, m.content.clone())
                }
            }
            Role::Assistant => (ContentRole::Model, m.content.clone()),
        };

        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.push(Part::text(text)),
            _ => contents.push(Content {
                role,
                parts: vec![Part::text(text)],
            }),
        }
    }

    // System content with no user turn to carry it.
    if system_pending {
        contents.insert(
            0,
            Content::user(vec![Part::text(format!(
                "{CONTEXT_PLACEHOLDER}\n\n{system_text}"
            ))]),
        );
    }

    // Strict alternation demands a leading user turn.
    if contents
        .first()
        .map(|c| c.role == ContentRole::Model)
        .unwrap_or(false)
    {
        contents.insert(0, Content::user(vec![Part::text(CONTEXT_PLACEHOLDER)]));
    }

    contents
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
