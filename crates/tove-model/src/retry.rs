// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{backoff_delay, classify};
use crate::ProviderError;

/// Run `call` until it succeeds, a non-retryable failure surfaces, or
/// `max_attempts` is exhausted.  Sleeps are cancellation-aware: tripping
/// `cancel` during a backoff wait returns [`ProviderError::Cancelled`].
pub async fn with_retries<T, F, Fut>(
    max_attempts: u32,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match call().await {
            Ok(v) => return Ok(v),
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
            Err(e) => {
                let class = classify(&e);
                if !class.retryable || attempt + 1 >= max_attempts {
                    return Err(e);
                }
                let delay = backoff_delay(&class, attempt);
                warn!(
                    attempt,
                    reason = ?class.reason,
                    delay_ms = delay.as_millis() as u64,
                    "provider call failed, retrying: {e}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                debug!(attempt, "resuming after backoff");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
