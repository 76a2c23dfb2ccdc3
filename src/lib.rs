use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

mod cache;
pub mod config;
mod context;
mod dispatcher;
mod error;
mod messages;
mod model_mapper;
mod provider;
mod streaming;
mod tool_schema;
pub mod token_counter;
mod validator;

pub use error::{AnthropicResult, LlmError, LlmResult as Result};

use crate::{
    config::Config,
    context::{CORRELATION_ID_HEADER, RequestContext},
    dispatcher::Dispatcher,
    messages::{
        anthropic::{self, AnthropicChatRequest},
        unified,
    },
    streaming::AnthropicStreamEncoder,
};

struct AppState {
    dispatcher: Dispatcher,
    cache: cache::StreamingCache,
    cache_enabled: bool,
}

/// Builds the axum router exposing the Anthropic-dialect surface.
pub async fn router(config: &Config) -> anyhow::Result<Router> {
    let dispatcher = Dispatcher::new(config)?;
    let cache = cache::StreamingCache::new(config.cache_max_entries, config.cache_max_size_bytes, config.cache_default_ttl);

    let state = Arc::new(AppState {
        dispatcher,
        cache,
        cache_enabled: config.cache_enabled,
    });

    Ok(Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/v1/cache/stats", get(cache_stats_handler))
        .route("/v1/cache/invalidate", post(cache_invalidate_handler))
        .with_state(state))
}

#[derive(Debug, Deserialize)]
struct BypassCacheQuery {
    #[serde(default)]
    bypass_cache: bool,
    #[serde(default)]
    cache_ttl: Option<u64>,
    #[serde(default)]
    cache_tags: Option<String>,
}

#[derive(Debug, Serialize)]
struct CacheStatsResponse {
    entry_count: usize,
    total_size_bytes: u64,
    max_entries: usize,
    max_size_bytes: u64,
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.cache.stats();
    Json(CacheStatsResponse {
        entry_count: stats.entry_count,
        total_size_bytes: stats.total_size_bytes,
        max_entries: stats.max_entries,
        max_size_bytes: stats.max_size_bytes,
    })
}

#[derive(Debug, Deserialize)]
struct CacheInvalidateRequest {
    fingerprint_pattern: Option<String>,
    tag: Option<String>,
    older_than_secs: Option<u64>,
}

async fn cache_invalidate_handler(
    State(state): State<Arc<AppState>>,
    Sonic(request): Sonic<CacheInvalidateRequest>,
) -> impl IntoResponse {
    let pattern = match request.fingerprint_pattern.as_deref().map(regex::Regex::new) {
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => {
            return (axum::http::StatusCode::BAD_REQUEST, format!("invalid fingerprint_pattern: {e}")).into_response();
        }
        None => None,
    };

    state.cache.invalidate(
        pattern.as_ref(),
        request.tag.as_deref(),
        request.older_than_secs.map(Duration::from_secs),
    );

    axum::http::StatusCode::NO_CONTENT.into_response()
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(cache_params): Query<BypassCacheQuery>,
    headers: HeaderMap,
    Sonic(request): Sonic<AnthropicChatRequest>,
) -> AnthropicResult<impl IntoResponse> {
    let context = RequestContext::from_headers(&headers);
    log::debug!("{}: messages request for model {}", context.correlation_id, request.model);

    let stream_requested = request.stream.unwrap_or(false);
    let unified_request = unified::UnifiedRequest::from(request);

    let report = validator::validate(&unified_request.messages);
    if !report.is_valid() {
        log::warn!("{}: request failed flow validation: {:?}", context.correlation_id, report.errors);
        return Err(LlmError::InvalidRequest(report.errors.join("; ")).into());
    }

    if stream_requested {
        Ok(stream_messages(state, unified_request, context, cache_params).await?.into_response())
    } else {
        let response = state
            .dispatcher
            .completions(unified_request, &context)
            .await
            .map_err(error::AnthropicErrorResponse::from)?;

        let anthropic_response = anthropic::AnthropicChatResponse::from(response);
        Ok(axum::Json(anthropic_response).into_response())
    }
}

async fn stream_messages(
    state: Arc<AppState>,
    request: unified::UnifiedRequest,
    context: RequestContext,
    cache_params: BypassCacheQuery,
) -> AnthropicResult<impl IntoResponse> {
    let key = cache::fingerprint(&request);
    let cache_active = state.cache_enabled && !cache_params.bypass_cache;

    if cache_active
        && let Some(cached) = state.cache.get(&key)
    {
        log::debug!("{}: cache hit for fingerprint {key}", context.correlation_id);
        return Ok(replay_cached(cached).into_response());
    }

    let upstream = state
        .dispatcher
        .completions_stream(request, &context)
        .await
        .map_err(error::AnthropicErrorResponse::from)?;

    let message_id = format!("msg_{}", context.correlation_id.replace('-', "").chars().take(24).collect::<String>());
    let can_write = cache_active && state.cache.try_acquire_writer(&key);
    let writeback_state = state.clone();
    let writeback_key = key.clone();
    let writeback_ttl = cache_params.cache_ttl.map(Duration::from_secs);
    let writeback_tags: std::collections::HashSet<String> = cache_params
        .cache_tags
        .map(|raw| raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    let encoder = AnthropicStreamEncoder::new();

    let event_stream = futures::stream::unfold(
        (Box::pin(upstream), encoder, Vec::<unified::UnifiedChunk>::new(), false),
        move |(mut stream, mut encoder, mut accumulated, closed)| {
            let message_id = message_id.clone();
            let writeback_state = writeback_state.clone();
            let writeback_key = writeback_key.clone();
            let writeback_tags = writeback_tags.clone();
            async move {
                if closed {
                    return None;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if can_write {
                            accumulated.push(chunk.clone());
                        }
                        let events = encoder.encode(&message_id, chunk);
                        let closed = encoder.is_closed();
                        if closed && can_write {
                            writeback_state.cache.release_writer(&writeback_key);
                            writeback_state.cache.insert_with_ttl(writeback_key, accumulated.clone(), writeback_tags, writeback_ttl);
                        }
                        Some((events, (stream, encoder, accumulated, closed)))
                    }
                    Some(Err(e)) => {
                        log::error!("stream error: {e}");
                        if can_write {
                            writeback_state.cache.release_writer(&writeback_key);
                        }
                        let events = encoder.encode_error(e.to_string());
                        Some((events, (stream, encoder, accumulated, true)))
                    }
                    None => {
                        if can_write {
                            writeback_state.cache.release_writer(&writeback_key);
                        }
                        None
                    }
                }
            }
        },
    )
    .flat_map(futures::stream::iter)
    .map(|event| {
        let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
            log::error!("failed to serialize stream event: {e}");
            r#"{"type":"error","error":{"type":"api_error","message":"serialization failed"}}"#.to_string()
        });
        Ok::<_, Infallible>(Event::default().data(json))
    });

    Ok(Sse::new(event_stream).into_response())
}

fn replay_cached(chunks: Vec<unified::UnifiedChunk>) -> impl IntoResponse {
    let message_id = "msg_cached".to_string();
    let mut encoder = AnthropicStreamEncoder::new();

    let event_stream = futures::stream::iter(chunks)
        .then(move |chunk| {
            let mut events = encoder.encode(&message_id, chunk);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                futures::stream::iter(std::mem::take(&mut events))
            }
        })
        .flatten()
        .map(|event| {
            let json = sonic_rs::to_string(&event).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().data(json))
        });

    Sse::new(event_stream)
}

async fn count_tokens_handler(
    Sonic(request): Sonic<AnthropicChatRequest>,
) -> AnthropicResult<impl IntoResponse> {
    let unified_request = unified::UnifiedRequest::from(request);
    let input_tokens = token_counter::count_input_tokens(unified_request.system.as_deref(), &unified_request.messages);

    Ok(axum::Json(anthropic::CountTokensResponse {
        input_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    }))
}

#[cfg(test)]
mod tests {
    #[test]
    fn correlation_header_name_is_lowercase() {
        assert_eq!(super::CORRELATION_ID_HEADER, "x-request-id");
    }
}
