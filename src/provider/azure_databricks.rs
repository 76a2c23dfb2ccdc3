//! Azure Databricks-hosted Claude serving endpoints.
//!
//! The wire body sent upstream is Anthropic-shaped; what comes back is
//! OpenAI-shaped. Authentication is HTTP Basic with the token as the
//! password half, per Databricks serving-endpoint convention.

use async_trait::async_trait;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Method, header::AUTHORIZATION};
use secrecy::ExposeSecret;

use crate::{
    config::Config,
    context::RequestContext,
    error::LlmError,
    messages::{
        anthropic::AnthropicChatRequest,
        openai::{ChatCompletionChunk, ChatCompletionResponse},
        unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse},
    },
    provider::{ChatCompletionStream, HttpProvider, Provider, http_client::default_http_client_builder},
};

pub(crate) struct AzureDatabricksProvider {
    client: Client,
    invocation_url: String,
    basic_auth: String,
}

impl AzureDatabricksProvider {
    pub(crate) fn new(config: &Config) -> anyhow::Result<Self> {
        let host = config
            .databricks_host
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABRICKS_HOST is required for this backend"))?;
        let token = config
            .databricks_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABRICKS_TOKEN is required for this backend"))?;
        let endpoint = config
            .databricks_endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABRICKS_ENDPOINT_NAME is required for this backend"))?;

        let client = default_http_client_builder(reqwest::header::HeaderMap::new())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build Databricks HTTP client: {e}"))?;

        let invocation_url = format!("https://{host}/serving-endpoints/{endpoint}/invocations");
        let credentials = format!("token:{}", token.expose_secret());
        let basic_auth = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(credentials));

        Ok(Self {
            client,
            invocation_url,
            basic_auth,
        })
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

impl HttpProvider for AzureDatabricksProvider {
    fn http_client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Provider for AzureDatabricksProvider {
    async fn chat_completion(&self, request: UnifiedRequest, context: &RequestContext) -> crate::Result<UnifiedResponse> {
        let original_model = request.model.clone();

        let mut body = AnthropicChatRequest::from(request);
        body.stream = Some(false);

        let payload = sonic_rs::to_vec(&body)
            .map_err(|e| LlmError::InvalidRequest(format!("failed to serialize request: {e}")))?;

        let response = self
            .request_builder(Method::POST, &self.invocation_url, context)
            .header(AUTHORIZATION, &self.basic_auth)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach Databricks: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to read Databricks response: {e}")))?;

        let parsed: ChatCompletionResponse = sonic_rs::from_str(&text).map_err(|e| {
            log::error!("failed to parse Databricks response: {e}");
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
        let mut body = AnthropicChatRequest::from(request);
        body.stream = Some(true);

        let payload = sonic_rs::to_vec(&body)
            .map_err(|e| LlmError::InvalidRequest(format!("failed to serialize request: {e}")))?;

        let response = self
            .request_builder(Method::POST, &self.invocation_url, context)
            .header(AUTHORIZATION, &self.basic_auth)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach Databricks: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = futures::stream::unfold(Box::pin(event_stream), |mut stream| async move {
            loop {
                let event = stream.next().await?;

                let Ok(event) = event else {
                    log::warn!("SSE parsing error in Databricks stream");
                    continue;
                };

                if event.data == "[DONE]" {
                    return None;
                }

                let chunk: ChatCompletionChunk = match sonic_rs::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("failed to parse Databricks streaming chunk: {e}");
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
        "azure-databricks"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};
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
            "model": "claude-3-opus",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        }))
    }

    #[tokio::test]
    async fn sends_basic_auth_and_anthropic_shaped_body() {
        let captured = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route("/invocations", post(capture_handler))
            .with_state(captured.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let provider = AzureDatabricksProvider {
            client: default_http_client_builder(reqwest::header::HeaderMap::new())
                .build()
                .unwrap(),
            invocation_url: format!("http://{addr}/invocations"),
            basic_auth: "Basic dG9rZW46c2VjcmV0".to_string(),
        };

        let request = UnifiedRequest {
            model: "claude-3-opus".to_string(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContentContainer::Text("hello".to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            system: None,
            max_tokens: Some(100),
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
        assert_eq!(response.model, "claude-3-opus");

        let (headers, body) = captured.lock().unwrap().take().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Basic dG9rZW46c2VjcmV0");
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }
}
