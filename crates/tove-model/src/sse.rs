// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Server-sent-event framing.
//!
//! The provider responds with `text/event-stream` framed as
//! `data: <json>\n\n` plus `data: [DONE]` sentinels.  Chunk boundaries from
//! the HTTP body do not align with event boundaries, so the decoder keeps the
//! unterminated remainder across [`SseDecoder::feed`] calls.

/// Incremental SSE event splitter.  Bytes in, complete `data:` payloads out.
#[derive(Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns every complete event payload it closed.
    ///
    /// Within an event, all `data:` lines are concatenated with newlines (the
    /// SSE multi-line rule); non-`data:` lines and comments are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        // Events are delimited by a blank line: \n\n or \r\n\r\n.
        loop {
            let Some((end, sep_len)) = find_event_boundary(&self.buf) else {
                break;
            };
            let event = self.buf[..end].to_string();
            self.buf.drain(..end + sep_len);
            if let Some(payload) = extract_data(&event) {
                out.push(payload);
            }
        }
        out
    }

    /// Flush whatever remains after the body ended without a trailing blank
    /// line.  Some servers close the connection right after the last event.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        extract_data(&rest)
    }
}

/// Find the first `\r?\n\r?\n` boundary; returns (event_end, separator_len).
fn find_event_boundary(buf: &str) -> Option<(usize, usize)> {
    let bytes = buf.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            if j < bytes.len() && bytes[j] == b'\r' {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'\n' {
                // Strip a trailing \r from the event text.
                let end = if i > 0 && bytes[i - 1] == b'\r' { i - 1 } else { i };
                return Some((end, j + 1 - end));
            }
        }
        i += 1;
    }
    None
}

fn extract_data(event: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(data_lines.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
