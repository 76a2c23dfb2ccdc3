//! Direct HTTP calls to OpenRouter's OpenAI-compatible API.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Method, header::AUTHORIZATION};
use secrecy::ExposeSecret;

use crate::{
    config::Config,
    context::RequestContext,
    error::LlmError,
    messages::{
        openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
        unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse},
    },
    provider::{ChatCompletionStream, HttpProvider, Provider, http_client::default_http_client_builder},
};

pub(crate) struct OpenRouterDirectProvider {
    client: Client,
    base_url: String,
    api_key: secrecy::SecretString,
    extensions: crate::config::OpenRouterExtensions,
}

impl OpenRouterDirectProvider {
    pub(crate) fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = config
            .openrouter_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENROUTER_API_KEY is required for this backend"))?;

        let client = default_http_client_builder(reqwest::header::HeaderMap::new())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build OpenRouter HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: config.openrouter_base_url.clone(),
            api_key,
            extensions: config.openrouter_extensions.clone(),
        })
    }

    fn apply_extensions(&self, request: &mut ChatCompletionRequest) {
        if !self.extensions.fallback_models.is_empty() {
            request.models = Some(self.extensions.fallback_models.clone());
        }
        if let Some(strategy) = &self.extensions.routing_strategy {
            request.route = Some(strategy.clone());
        }
        if let Some(preferences) = &self.extensions.provider_preferences {
            request.provider = Some(preferences.clone());
        }
        if !self.extensions.transforms.is_empty() {
            request.transforms = Some(self.extensions.transforms.clone());
        }
        request.min_p = self.extensions.min_p;
        request.top_a = self.extensions.top_a;
    }

    async fn status_error(response: reqwest::Response) -> LlmError {
        let status = response.status();
        let message = response.text().await.unwrap_or_else(|_| "unknown error".to_string());

        match status.as_u16() {
            401 => LlmError::AuthenticationFailed(message),
            403 => LlmError::PermissionDenied(message),
            404 => LlmError::ModelNotFound(message),
            429 => LlmError::RateLimitExceeded { message },
            400 => LlmError::InvalidRequest(message),
            503 => LlmError::Overloaded(message),
            other => LlmError::UpstreamStatusError { status: other, message },
        }
    }
}

impl HttpProvider for OpenRouterDirectProvider {
    fn http_client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Provider for OpenRouterDirectProvider {
    async fn chat_completion(&self, request: UnifiedRequest, context: &RequestContext) -> crate::Result<UnifiedResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let original_model = request.model.clone();

        let mut body = ChatCompletionRequest::from(request);
        body.stream = Some(false);
        self.apply_extensions(&mut body);

        let payload = sonic_rs::to_vec(&body)
            .map_err(|e| LlmError::InvalidRequest(format!("failed to serialize request: {e}")))?;

        let response = self
            .request_builder(Method::POST, &url, context)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key.expose_secret()))
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach OpenRouter: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to read OpenRouter response: {e}")))?;

        let parsed: ChatCompletionResponse = sonic_rs::from_str(&text).map_err(|e| {
            log::error!("failed to parse OpenRouter response: {e}");
            LlmError::InternalError(None)
        })?;

        let mut unified = UnifiedResponse::from(parsed);
        unified.model = original_model;

        Ok(unified)
    }

    async fn chat_completion_stream(
        &self,
        request: UnifiedRequest,
        context: &RequestContext,
    ) -> crate::Result<ChatCompletionStream> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = ChatCompletionRequest::from(request);
        body.stream = Some(true);
        self.apply_extensions(&mut body);

        let payload = sonic_rs::to_vec(&body)
            .map_err(|e| LlmError::InvalidRequest(format!("failed to serialize request: {e}")))?;

        let response = self
            .request_builder(Method::POST, &url, context)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key.expose_secret()))
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach OpenRouter: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = futures::stream::unfold(Box::pin(event_stream), |mut stream| async move {
            loop {
                let event = stream.next().await?;

                let Ok(event) = event else {
                    log::warn!("SSE parsing error in OpenRouter stream");
                    continue;
                };

                if event.data == "[DONE]" {
                    return None;
                }

                let chunk: ChatCompletionChunk = match sonic_rs::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("failed to parse OpenRouter streaming chunk: {e}");
                        continue;
                    }
                };

                return Some((Ok(UnifiedChunk::from(chunk)), stream));
            }
        });

        Ok(Box::pin(chunk_stream))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "openrouter-direct"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::unified::{UnifiedContentContainer, UnifiedMessage, UnifiedRole};

    async fn capture_handler(
        State(state): State<Arc<Mutex<Option<(HeaderMap, Value)>>>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        *state.lock().unwrap() = Some((headers, body));
        Json(json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "created": 0,
            "model": "openrouter/anthropic/claude-3.5-sonnet",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        }))
    }

    #[tokio::test]
    async fn sends_bearer_auth_and_openrouter_extensions() {
        let captured = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route("/chat/completions", post(capture_handler))
            .with_state(captured.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let provider = OpenRouterDirectProvider {
            client: default_http_client_builder(reqwest::header::HeaderMap::new())
                .build()
                .unwrap(),
            base_url: format!("http://{addr}"),
            api_key: SecretString::from("sk-test".to_string()),
            extensions: crate::config::OpenRouterExtensions {
                fallback_models: vec!["openai/gpt-4o".to_string()],
                ..Default::default()
            },
        };

        let request = UnifiedRequest {
            model: "openrouter/anthropic/claude-3.5-sonnet".to_string(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContentContainer::Text("hello".to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            system: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: None,
            stream: Some(false),
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            metadata: None,
        };

        let context = RequestContext::new();
        let response = provider.chat_completion(request, &context).await.unwrap();
        assert_eq!(response.model, "openrouter/anthropic/claude-3.5-sonnet");

        let (headers, body) = captured.lock().unwrap().take().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(body["models"], json!(["openai/gpt-4o"]));
    }
}
