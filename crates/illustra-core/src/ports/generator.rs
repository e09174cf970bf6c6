//! IllustrationGenerator port - the external image generation client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context passed with every prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub page_number: u32,
    pub total_pages: u32,
    /// Earlier artifact to keep characters visually consistent.
    pub previous_artifact: Option<String>,
    pub is_global_reference: bool,
}

/// Failure classification drives retry: transient errors back off and
/// retry, permanent ones fail the task immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Network timeout, rate limit, 5xx.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// Invalid prompt, permanent 4xx, content policy rejection.
    #[error("permanent generation failure: {0}")]
    Permanent(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}

#[async_trait]
pub trait IllustrationGenerator: Send + Sync {
    /// Generate image bytes for `prompt`. May take several seconds; callers
    /// may drop the future to cancel.
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<Vec<u8>, GenerationError>;
}
