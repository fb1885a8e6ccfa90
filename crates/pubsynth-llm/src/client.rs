//! Generation client: one prompt in, generated text out.
//!
//! Layering, innermost first: backend call, retry, cache. Provider limits
//! are left to backoff, so there is no rate limiter on this path.

use std::sync::Arc;

use pubsynth_common::cache::{CacheKey, ResponseCache};
use pubsynth_common::{PubsynthError, Result, RetryPolicy};
use tracing::{info, instrument, warn};

use crate::backend::{LlmBackend, LlmRequest};

/// Prompt used by [`GenerationClient::validate_credentials`].
pub const PING_PROMPT: &str = "ping";

pub struct GenerationClient {
    backend: Arc<dyn LlmBackend>,
    retry: RetryPolicy,
    cache: Option<Arc<ResponseCache<String>>>,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend, retry: RetryPolicy::default(), cache: None }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache<String>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The backend's configured model.
    pub fn default_model(&self) -> &str {
        self.backend.model_id()
    }

    pub fn provider(&self) -> &'static str {
        self.backend.provider()
    }

    /// Generate text for `prompt` with `model`, served from the cache when an
    /// unexpired entry exists for the pair.
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn generate(&self, prompt: &str, model: &str) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(PubsynthError::InvalidInput("prompt is empty".to_string()));
        }
        match &self.cache {
            Some(cache) => {
                let key = CacheKey::new("generate", prompt, model);
                cache.get_or_compute(key, || self.generate_uncached(prompt, model)).await
            }
            None => self.generate_uncached(prompt, model).await,
        }
    }

    async fn generate_uncached(&self, prompt: &str, model: &str) -> Result<String> {
        let backend = &self.backend;
        self.retry
            .run("generate", move || async move {
                let resp = backend.complete(LlmRequest::prompt(prompt, model)).await?;
                Ok::<_, PubsynthError>(resp.content)
            })
            .await
    }

    /// One minimal call confirming the credential and model are usable.
    /// Never retried and never cached.
    #[instrument(skip(self))]
    pub async fn validate_credentials(&self, model: &str) -> Result<()> {
        let req = LlmRequest::prompt(PING_PROMPT, model).with_max_tokens(8);
        match self.backend.complete(req).await {
            Ok(_) => {
                info!(provider = self.provider(), model, "credential check passed");
                Ok(())
            }
            Err(e) => {
                warn!(provider = self.provider(), model, error = %e, "credential check failed");
                Err(e)
            }
        }
    }
}
