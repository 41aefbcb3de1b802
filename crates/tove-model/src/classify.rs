// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-error classification and backoff policy.
//!
//! Detection is substring-based on the lower-cased rendered error, so it
//! works uniformly for HTTP bodies, reqwest messages and upstream JSON error
//! envelopes.  Order matters: a 413 "request too large" must classify as a
//! context overflow, not as a generic client error.

use std::time::Duration;

use crate::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Auth,
    Billing,
    RateLimit,
    ContextOverflow,
    Timeout,
    Overloaded,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub reason: FailReason,
    pub retryable: bool,
    /// Base delay before the next attempt; jitter and exponential growth are
    /// applied by [`backoff_delay`].
    pub retry_delay: Option<Duration>,
}

impl Classification {
    const fn of(reason: FailReason, retryable: bool, delay_secs: Option<u64>) -> Self {
        Self {
            reason,
            retryable,
            retry_delay: match delay_secs {
                Some(s) => Some(Duration::from_secs(s)),
                None => None,
            },
        }
    }
}

/// Map a provider failure onto the retry policy.
///
/// Cancellation is not an error in this taxonomy; it is never retried.
pub fn classify(err: &ProviderError) -> Classification {
    if matches!(err, ProviderError::Cancelled) {
        return Classification::of(FailReason::Unknown, false, None);
    }
    classify_message(&err.to_string())
}

/// Substring table over the lower-cased message.
pub fn classify_message(message: &str) -> Classification {
    let m = message.to_lowercase();
    let has = |needle: &str| m.contains(needle);

    if has("request_too_large")
        || has("context length exceeded")
        || has("prompt is too long")
        || (has("413") && has("too large"))
    {
        return Classification::of(FailReason::ContextOverflow, false, None);
    }
    if has("rate limit") || has("429") || has("quota exceeded") {
        return Classification::of(FailReason::RateLimit, true, Some(30));
    }
    if has("401") || has("403") || has("unauthorized") || has("invalid api key") {
        return Classification::of(FailReason::Auth, false, None);
    }
    if has("billing") || has("payment") || has("insufficient funds") {
        return Classification::of(FailReason::Billing, false, None);
    }
    if has("timeout") || has("504") || has("deadline exceeded") {
        return Classification::of(FailReason::Timeout, true, Some(5));
    }
    if has("overloaded") || has("503") || has("service unavailable") {
        return Classification::of(FailReason::Overloaded, true, Some(10));
    }
    Classification::of(FailReason::Unknown, true, Some(2))
}

/// Exponential backoff for attempt `attempt` (0-based) with ±1 s jitter,
/// capped at 60 s.
pub fn backoff_delay(class: &Classification, attempt: u32) -> Duration {
    let base = class.retry_delay.unwrap_or(Duration::from_secs(2));
    let grown = base.saturating_mul(1u32 << attempt.min(5));
    let jitter_ms: i64 = rand::Rng::gen_range(&mut rand::thread_rng(), -1000..=1000);
    let with_jitter = grown.as_millis() as i64 + jitter_ms;
    Duration::from_millis(with_jitter.max(0) as u64).min(Duration::from_secs(60))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
