// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Execution wrappers around raw tool calls.
//!
//! Order matters: the timeout bounds the tool itself, and the cancellation
//! guard cuts across both so a cancelled generation never waits out a slow
//! tool's timeout.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Tool, ToolResult};

/// Run one tool invocation under the shared timeout and cancellation handle.
///
/// Never fails: a timeout yields `error: "timeout"`, a tripped token yields
/// `error: "cancelled"`, and the tool's own failures arrive as error-carrying
/// results per the [`Tool`] contract.
pub async fn run_tool(
    tool: Arc<dyn Tool>,
    call_id: &str,
    args: &Value,
    timeout: Duration,
    cancel: CancellationToken,
) -> ToolResult {
    let name = tool.name().to_string();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(tool = %name, call_id, "tool cancelled");
            ToolResult::err(call_id, "cancelled")
        }
        outcome = tokio::time::timeout(timeout, tool.execute(call_id, args)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(tool = %name, call_id, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                    ToolResult::err(call_id, "timeout")
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
