//! Backend dispatch (C7): picks the one active upstream backend, retries
//! transient failures, and never retries once a stream has started.

use std::{sync::Arc, time::Duration};

use crate::{
    config::Config,
    context::RequestContext,
    error::LlmError,
    messages::unified::{UnifiedRequest, UnifiedResponse},
    model_mapper,
    provider::{ChatCompletionStream, Provider, azure_databricks::AzureDatabricksProvider,
        openrouter_direct::OpenRouterDirectProvider, openrouter_litellm::OpenRouterLiteLlmProvider},
};

/// The one upstream this process was configured to talk to.
///
/// Fixed at three variants on purpose: this crate does not implement a
/// provider registry, only a choice among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Talk to OpenRouter's OpenAI-compatible API directly.
    DirectOpenAiCompatible,
    /// Talk to OpenRouter through an embedded translation library instead of
    /// raw HTTP, exercising a different request/response code path.
    TranslationLibrary,
    /// Talk to an Azure Databricks-hosted Claude endpoint.
    AzureDatabricks,
}

const BASE_BACKOFF: Duration = Duration::from_millis(200);

pub(crate) struct Dispatcher {
    backend: Backend,
    provider: Arc<dyn Provider>,
    max_retries: u32,
    big_model: String,
    small_model: String,
}

impl Dispatcher {
    pub(crate) fn new(config: &Config) -> anyhow::Result<Self> {
        let provider: Arc<dyn Provider> = match config.backend {
            Backend::DirectOpenAiCompatible => Arc::new(OpenRouterDirectProvider::new(config)?),
            Backend::TranslationLibrary => Arc::new(OpenRouterLiteLlmProvider::new(config)?),
            Backend::AzureDatabricks => Arc::new(AzureDatabricksProvider::new(config)?),
        };

        Ok(Self {
            backend: config.backend,
            provider,
            max_retries: config.max_retries,
            big_model: config.big_model.clone(),
            small_model: config.small_model.clone(),
        })
    }

    fn map_model(&self, request: &mut UnifiedRequest) {
        let mapping = model_mapper::resolve(&request.model, self.backend, &self.big_model, &self.small_model);
        request.model = mapping.canonical_model;
    }

    /// Dispatch a non-streaming completion, retrying transient failures with
    /// exponential backoff up to `max_retries` attempts.
    pub(crate) async fn completions(
        &self,
        mut request: UnifiedRequest,
        context: &RequestContext,
    ) -> crate::Result<UnifiedResponse> {
        self.map_model(&mut request);

        let mut attempt = 0u32;
        loop {
            if context.is_cancelled() {
                return Err(LlmError::ConnectionError("request cancelled".to_string()));
            }

            match self.provider.chat_completion(request.clone(), context).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    log::warn!(
                        "{}: retrying after transient error (attempt {}/{}): {error}",
                        context.correlation_id,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Dispatch a streaming completion. Retries apply only to establishing
    /// the stream; once the first chunk has been yielded, failures surface
    /// as a terminal [`LlmError::StreamError`] instead of a retry.
    pub(crate) async fn completions_stream(
        &self,
        mut request: UnifiedRequest,
        context: &RequestContext,
    ) -> crate::Result<ChatCompletionStream> {
        if !self.provider.supports_streaming() {
            return Err(LlmError::StreamingNotSupported);
        }

        self.map_model(&mut request);

        let mut attempt = 0u32;
        loop {
            if context.is_cancelled() {
                return Err(LlmError::ConnectionError("request cancelled".to_string()));
            }

            match self.provider.chat_completion_stream(request.clone(), context).await {
                Ok(stream) => return Ok(stream),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    log::warn!(
                        "{}: retrying stream establishment (attempt {}/{}): {error}",
                        context.correlation_id,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_variants_are_distinct() {
        assert_ne!(Backend::DirectOpenAiCompatible, Backend::TranslationLibrary);
        assert_ne!(Backend::TranslationLibrary, Backend::AzureDatabricks);
    }
}
