// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod adapter;
pub mod classify;
pub mod schema;
mod client;
mod gemini;
mod mock;
mod retry;
mod sse;
mod types;

pub use client::{GenEventStream, ModelClient};
pub use gemini::GeminiClient;
pub use mock::{MockTurn, ScriptedMockClient};
pub use retry::with_retries;
pub use types::*;
