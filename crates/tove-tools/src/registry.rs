// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use tove_model::ToolDecl;

use crate::{Tool, ToolResult};

/// Central registry holding all available tools.  Read-only after startup;
/// shared behind an `Arc` and safe for concurrent lookup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  The name must match `^[a-zA-Z_][a-zA-Z0-9_]*$`;
    /// re-registering a name replaces the previous tool.
    pub fn register(&mut self, tool: impl Tool + 'static) -> anyhow::Result<()> {
        if !valid_name(tool.name()) {
            bail!("invalid tool name: {:?}", tool.name());
        }
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Declarations for every registered tool, sorted by name.  Parameter
    /// schemas are handed over as-declared; the provider client sanitizes
    /// them when building the request.
    pub fn definitions(&self) -> Vec<ToolDecl> {
        let mut decls: Vec<ToolDecl> = self
            .tools
            .values()
            .map(|t| ToolDecl {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// `(group, name, description)` triples for the prompt builder, grouped
    /// and sorted for deterministic output.
    pub fn listing(&self) -> Vec<(String, String, String)> {
        let mut rows: Vec<(String, String, String)> = self
            .tools
            .values()
            .map(|t| {
                (
                    t.group().to_string(),
                    t.name().to_string(),
                    t.description().to_string(),
                )
            })
            .collect();
        rows.sort();
        rows
    }

    /// Dispatch by name; an unknown tool becomes an error-carrying result
    /// rather than a hard failure.
    pub async fn execute(&self, name: &str, call_id: &str, args: &serde_json::Value) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) => tool.execute(call_id, args).await,
            None => ToolResult::err(call_id, format!("unknown tool: {name}")),
        }
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
