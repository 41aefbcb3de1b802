// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;

/// Key/value byte store backing large-result spill and prompt context files.
///
/// Filenames written by the runtime carry a monotonic counter, so concurrent
/// writers never contend on a path.
pub trait ContextStore: Send + Sync {
    fn list(&self) -> Vec<String>;
    fn read(&self, path: &str) -> Option<Vec<u8>>;
    fn write(&self, path: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// In-memory store; the default for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStore for MemoryStore {
    fn list(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    fn write(&self, path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Filesystem store rooted at one directory.  Paths are flat file names; no
/// subdirectories, no traversal.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.contains('/') || path.contains("..") || path.is_empty() {
            anyhow::bail!("invalid store path: {path:?}");
        }
        Ok(self.root.join(path))
    }
}

impl ContextStore for DirStore {
    fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        let p = self.resolve(path).ok()?;
        std::fs::read(p).ok()
    }

    fn write(&self, path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let p = self.resolve(path)?;
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        std::fs::write(&p, bytes).with_context(|| format!("writing {}", p.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
