// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tove_model::ChatMessage;
use tracing::debug;

/// A draft submitted while a generation was active, waiting its turn.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub character_state: Option<String>,
}

#[derive(Default)]
struct Session {
    messages: Vec<ChatMessage>,
    /// Cancellation handle of the active generation; `Some` means busy.
    active: Option<CancellationToken>,
    queue: VecDeque<QueuedMessage>,
    last_access: Option<Instant>,
}

/// Per-session state, keyed by session id.
///
/// All mutation goes through this store under the session's lock; readers
/// get cheap snapshots.  Sessions expire `ttl` after their last access.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a session, creating it on first use.  Every access resets the
    /// TTL timer.
    fn get_or_create(&self, id: &str) -> Arc<Mutex<Session>> {
        let mut map = self.sessions.lock().unwrap();
        let session = map
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session = id, "session created");
                Arc::new(Mutex::new(Session::default()))
            })
            .clone();
        session.lock().unwrap().last_access = Some(Instant::now());
        session
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    pub fn append(&self, id: &str, msg: ChatMessage) {
        let session = self.get_or_create(id);
        session.lock().unwrap().messages.push(msg);
    }

    /// Atomically replace the whole history (compaction commits through here).
    pub fn replace(&self, id: &str, messages: Vec<ChatMessage>) {
        let session = self.get_or_create(id);
        session.lock().unwrap().messages = messages;
    }

    /// Shallow copy of the current history.
    pub fn snapshot(&self, id: &str) -> Vec<ChatMessage> {
        let session = self.get_or_create(id);
        let guard = session.lock().unwrap();
        guard.messages.clone()
    }

    /// Claim the single active-generation slot.  Returns the fresh
    /// cancellation handle, or `None` when a generation is already running.
    pub fn begin_generation(&self, id: &str) -> Option<CancellationToken> {
        let session = self.get_or_create(id);
        let mut guard = session.lock().unwrap();
        if guard.active.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        guard.active = Some(token.clone());
        Some(token)
    }

    /// Release the active-generation slot (success, error or cancel alike).
    pub fn end_generation(&self, id: &str) {
        let session = self.get_or_create(id);
        session.lock().unwrap().active = None;
    }

    pub fn is_busy(&self, id: &str) -> bool {
        let session = self.get_or_create(id);
        let guard = session.lock().unwrap();
        guard.active.is_some()
    }

    /// Trip the active generation's cancellation handle.  Idempotent; a
    /// session without an active generation is left untouched.
    pub fn cancel(&self, id: &str) {
        let session = self.get_or_create(id);
        let guard = session.lock().unwrap();
        if let Some(token) = &guard.active {
            debug!(session = id, "cancelling active generation");
            token.cancel();
        }
    }

    pub fn enqueue(&self, id: &str, draft: QueuedMessage) -> usize {
        let session = self.get_or_create(id);
        let mut guard = session.lock().unwrap();
        guard.queue.push_back(draft);
        guard.queue.len()
    }

    /// Pop the next queued draft, FIFO.
    pub fn flush_next(&self, id: &str) -> Option<QueuedMessage> {
        let session = self.get_or_create(id);
        let mut guard = session.lock().unwrap();
        guard.queue.pop_front()
    }

    /// Cancel anything active, then clear history and queue.
    pub fn reset(&self, id: &str) {
        let session = self.get_or_create(id);
        let mut guard = session.lock().unwrap();
        if let Some(token) = &guard.active {
            token.cancel();
        }
        guard.messages.clear();
        guard.queue.clear();
    }

    /// Drop sessions idle longer than the TTL.  Sessions with an active
    /// generation are kept regardless.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.sessions.lock().unwrap();
        let before = map.len();
        map.retain(|id, session| {
            let guard = session.lock().unwrap();
            let keep = guard.active.is_some()
                || guard
                    .last_access
                    .map(|t| now.duration_since(t) < self.ttl)
                    .unwrap_or(true);
            if !keep {
                debug!(session = id.as_str(), "session expired");
            }
            keep
        });
        before - map.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
