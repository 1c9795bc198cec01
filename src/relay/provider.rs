//! Seams for the two remote services the relay depends on.
//!
//! The pipeline only sees these traits, so tests drive it with scripted
//! clients and production wires in the OpenAI adapters from `openai.rs`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Limits passed along with a summarization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryConstraints {
    pub max_output_tokens: u32,
}

#[async_trait]
pub trait SummaryClient: Send + Sync {
    /// Condense `text`, returning the summary to be spoken instead.
    async fn summarize(
        &self,
        text: &str,
        constraints: SummaryConstraints,
    ) -> Result<String, ProviderError>;

    /// Model identifier, for logs and `/config`.
    fn model(&self) -> &str;
}

#[async_trait]
pub trait SpeechClient: Send + Sync {
    /// Synthesize one segment into encoded audio bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Builds the provider clients for one request's credential.
pub trait ProviderFactory: Send + Sync {
    fn speech(&self, api_key: &str) -> Arc<dyn SpeechClient>;

    fn summary(&self, api_key: &str) -> Arc<dyn SummaryClient>;
}
