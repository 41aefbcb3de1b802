// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-result compaction.
//!
//! Raw tool output is written back into the next provider request, so an
//! unbounded result would eat the context window in one iteration.  Three
//! policies apply before a result is attached:
//!
//! - search-style lists keep the top entries with clipped snippets;
//! - long documents are spilled to the context store and replaced by a
//!   pointer with a preview;
//! - unparseable text is hard-capped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::ContextStore;

/// Search results kept per list.
const SEARCH_TOP_N: usize = 5;
/// Snippet clip length, chars.
const SNIPPET_MAX: usize = 120;
/// Documents above this many bytes move to the context store.
const SPILL_THRESHOLD: usize = 4096;
/// Hard cap for unparseable results, chars.
const RAW_TEXT_CAP: usize = 4096;
/// Preview length carried inline after a spill, chars.
const PREVIEW_LEN: usize = 400;

/// Stateful compactor: owns the spill store and the monotonic counter that
/// keeps spill filenames unique across concurrent tools.
pub struct ResultCompactor {
    store: Arc<dyn ContextStore>,
    counter: AtomicU64,
}

impl ResultCompactor {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self {
            store,
            counter: AtomicU64::new(0),
        }
    }

    /// Compact one raw result text before it joins the next provider request.
    pub fn compact(&self, tool_name: &str, raw: &str, agent_id: &str, iteration: u32) -> String {
        let parsed: Option<Value> = serde_json::from_str(raw).ok();

        match parsed {
            Some(v) if is_search_shaped(&v) => compact_search(&v),
            Some(_) if raw.len() > SPILL_THRESHOLD => {
                self.spill(tool_name, raw, agent_id, iteration)
            }
            Some(_) => raw.to_string(),
            None => clip_raw(raw),
        }
    }

    /// Write the full body to the store and return a pointer payload.
    fn spill(&self, tool_name: &str, raw: &str, agent_id: &str, iteration: u32) -> String {
        let filename = self.spill_filename(tool_name, raw);
        if let Err(e) = self.store.write(&filename, raw.as_bytes()) {
            warn!(tool = tool_name, error = %e, "spill write failed; clipping inline");
            return clip_raw(raw);
        }
        debug!(
            tool = tool_name,
            agent = agent_id,
            iteration,
            file = %filename,
            bytes = raw.len(),
            "tool result spilled to context store"
        );
        json!({
            "savedTo": filename,
            "hint": format!(
                "Full {tool_name} result ({} bytes) saved during iteration {iteration}. \
                 Ask for it by filename if the preview is not enough.",
                raw.len()
            ),
            "preview": clip_chars(raw, PREVIEW_LEN),
        })
        .to_string()
    }

    /// `<tool>-<counter>-<hash>.txt` — counter keeps names unique, hash makes
    /// them stable for identical payloads within a run.
    fn spill_filename(&self, tool_name: &str, raw: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::digest(raw.as_bytes());
        let hash = hex::encode(&digest[..4]);
        format!("{tool_name}-{n}-{hash}.txt")
    }
}

fn is_search_shaped(v: &Value) -> bool {
    v.get("results").map(Value::is_array).unwrap_or(false)
}

/// Keep `{query, count, tookMs}` plus the top results with clipped snippets.
fn compact_search(v: &Value) -> String {
    let mut out = Map::new();
    for key in ["query", "count", "tookMs"] {
        if let Some(val) = v.get(key) {
            out.insert(key.into(), val.clone());
        }
    }

    let results = v["results"].as_array().cloned().unwrap_or_default();
    let total = results.len();
    let kept: Vec<Value> = results
        .into_iter()
        .take(SEARCH_TOP_N)
        .map(|entry| {
            let mut slim = Map::new();
            for key in ["title", "url", "siteName"] {
                if let Some(val) = entry.get(key) {
                    slim.insert(key.into(), val.clone());
                }
            }
            if let Some(snippet) = entry.get("snippet").and_then(Value::as_str) {
                slim.insert("snippet".into(), json!(clip_chars(snippet, SNIPPET_MAX)));
            }
            Value::Object(slim)
        })
        .collect();

    if total > SEARCH_TOP_N {
        out.insert("truncatedResults".into(), json!(total - SEARCH_TOP_N));
    }
    out.insert("results".into(), Value::Array(kept));
    Value::Object(out).to_string()
}

fn clip_raw(raw: &str) -> String {
    if raw.len() <= RAW_TEXT_CAP {
        return raw.to_string();
    }
    format!("{}[...truncated]", clip_chars(raw, RAW_TEXT_CAP))
}

/// Char-boundary-safe prefix.
fn clip_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
