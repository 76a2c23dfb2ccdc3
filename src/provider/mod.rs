//! The provider abstraction each backend implements, plus the shared HTTP
//! client construction every backend reuses.

pub(crate) mod azure_databricks;
pub(crate) mod http_client;
pub(crate) mod openrouter_direct;
pub(crate) mod openrouter_litellm;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use reqwest::{Client, Method, RequestBuilder};

use crate::{
    context::RequestContext,
    messages::unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse},
};

pub(crate) type ChatCompletionStream = Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>;

/// One upstream backend capable of serving a unified chat completion.
///
/// Implementations must never panic on malformed upstream content; degrade
/// in place and let the dispatcher decide whether a failure is surfaced.
#[async_trait]
pub(crate) trait Provider: Send + Sync {
    async fn chat_completion(&self, request: UnifiedRequest, context: &RequestContext)
    -> crate::Result<UnifiedResponse>;

    async fn chat_completion_stream(
        &self,
        request: UnifiedRequest,
        context: &RequestContext,
    ) -> crate::Result<ChatCompletionStream>;

    fn supports_streaming(&self) -> bool;

    fn name(&self) -> &str;
}

/// Shared plumbing for providers that speak plain HTTP/JSON upstream.
pub(crate) trait HttpProvider {
    fn http_client(&self) -> &Client;

    /// Build a request carrying the caller's correlation ID and the
    /// process-wide request timeout. Callers still attach auth headers and
    /// the body themselves.
    fn request_builder(&self, method: Method, url: &str, context: &RequestContext) -> RequestBuilder {
        self.http_client()
            .request(method, url)
            .header(crate::context::CORRELATION_ID_HEADER, context.correlation_id.clone())
    }
}
