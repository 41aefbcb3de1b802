// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{GenEvent, GenRequest, GenResponse, ProviderError};

pub type GenEventStream = Pin<Box<dyn Stream<Item = Result<GenEvent, ProviderError>> + Send>>;

/// The seam between the agent runtime and the text-generation provider.
///
/// Implementations must be safe to share across tasks; the runtime holds one
/// client behind an `Arc` and multiplexes every concurrent generation and
/// compaction call through it.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Non-streaming request; the full response body is read before returning.
    async fn generate(&self, req: &GenRequest) -> Result<GenResponse, ProviderError>;

    /// Streaming request.  The returned stream yields decoded events lazily;
    /// cancelling `cancel` makes the underlying read loop exit promptly and
    /// end the stream.
    async fn stream(
        &self,
        req: &GenRequest,
        cancel: CancellationToken,
    ) -> Result<GenEventStream, ProviderError>;
}
