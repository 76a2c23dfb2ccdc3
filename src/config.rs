//! Environment-variable-driven configuration.
//!
//! Deliberately small: no TOML, no file layering, no hot reload. The only
//! job here is to turn `std::env` into a typed [`Config`] once at startup.

use std::{env, time::Duration};

use secrecy::SecretString;

use crate::dispatcher::Backend;

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    pub bind_addr: String,

    pub openrouter_api_key: Option<SecretString>,
    pub openrouter_base_url: String,

    pub databricks_host: Option<String>,
    pub databricks_token: Option<SecretString>,
    pub databricks_endpoint: Option<String>,

    pub big_model: String,
    pub small_model: String,

    pub max_tokens_limit: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,

    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub cache_max_size_bytes: u64,
    pub cache_default_ttl: Duration,
    pub cache_cleanup_interval: Duration,

    pub openrouter_extensions: OpenRouterExtensions,
}

/// OpenRouter's non-standard request fields, validated once at load time so
/// the request converter never has to reject a request over them.
#[derive(Debug, Clone, Default)]
pub struct OpenRouterExtensions {
    pub fallback_models: Vec<String>,
    pub routing_strategy: Option<String>,
    pub provider_preferences: Option<serde_json::Value>,
    pub transforms: Vec<String>,
    pub min_p: Option<f32>,
    pub top_a: Option<f32>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = match env_var("PROXY_BACKEND").as_deref() {
            Some("AZURE_DATABRICKS") => Backend::AzureDatabricks,
            Some("LITELLM_OPENROUTER") => Backend::TranslationLibrary,
            Some("OPENROUTER") | None => Backend::DirectOpenAiCompatible,
            Some(other) => anyhow::bail!("unknown PROXY_BACKEND: {other}"),
        };

        let openrouter_api_key = env_var("OPENROUTER_API_KEY").map(SecretString::from);
        let databricks_token = env_var("DATABRICKS_TOKEN").map(SecretString::from);

        if matches!(backend, Backend::DirectOpenAiCompatible | Backend::TranslationLibrary)
            && openrouter_api_key.is_none()
        {
            anyhow::bail!("OPENROUTER_API_KEY is required for the selected backend");
        }

        if matches!(backend, Backend::AzureDatabricks)
            && (env_var("DATABRICKS_HOST").is_none() || databricks_token.is_none())
        {
            anyhow::bail!("DATABRICKS_HOST and DATABRICKS_TOKEN are required for AZURE_DATABRICKS");
        }

        Ok(Self {
            backend,
            bind_addr: env_var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8787".to_string()),

            openrouter_api_key,
            openrouter_base_url: env_var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),

            databricks_host: env_var("DATABRICKS_HOST"),
            databricks_token,
            databricks_endpoint: env_var("DATABRICKS_ENDPOINT_NAME"),

            big_model: env_var("BIG_MODEL").unwrap_or_else(|| "anthropic/claude-3-opus".to_string()),
            small_model: env_var("SMALL_MODEL").unwrap_or_else(|| "anthropic/claude-3-haiku".to_string()),

            max_tokens_limit: env_parse("MAX_TOKENS_LIMIT").unwrap_or(8192),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(300)),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(3),

            cache_enabled: env_parse("CACHE_ENABLED").unwrap_or(true),
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES").unwrap_or(1000),
            cache_max_size_bytes: env_parse::<u64>("CACHE_MAX_SIZE_MB").unwrap_or(500) * 1024 * 1024,
            cache_default_ttl: Duration::from_secs(env_parse("CACHE_DEFAULT_TTL_SECS").unwrap_or(3600)),
            cache_cleanup_interval: Duration::from_secs(env_parse("CACHE_CLEANUP_INTERVAL_SECS").unwrap_or(60)),

            openrouter_extensions: OpenRouterExtensions::from_env()?,
        })
    }
}

impl OpenRouterExtensions {
    fn from_env() -> anyhow::Result<Self> {
        let fallback_models = env_var("OPENROUTER_FALLBACK_MODELS")
            .map(|raw| split_csv(&raw))
            .unwrap_or_default();

        let routing_strategy = match env_var("OPENROUTER_ROUTING_STRATEGY") {
            Some(strategy) if strategy == "fallback" => Some(strategy),
            Some(other) => {
                log::warn!("ignoring OPENROUTER_ROUTING_STRATEGY={other}: only \"fallback\" is recognized");
                None
            }
            None => None,
        };

        let provider_preferences = match env_var("OPENROUTER_PROVIDER_PREFERENCES") {
            Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) if value.is_object() => {
                    const KNOWN_FIELDS: &[&str] = &["allow_fallbacks", "require_parameters", "data_collection"];
                    if let Some(object) = value.as_object() {
                        for key in object.keys() {
                            if !KNOWN_FIELDS.contains(&key.as_str()) {
                                log::warn!("OPENROUTER_PROVIDER_PREFERENCES has unrecognized field: {key}");
                            }
                        }
                    }
                    Some(value)
                }
                Ok(_) => {
                    log::warn!("ignoring OPENROUTER_PROVIDER_PREFERENCES: must be a JSON object");
                    None
                }
                Err(e) => {
                    log::warn!("ignoring OPENROUTER_PROVIDER_PREFERENCES: invalid JSON ({e})");
                    None
                }
            },
            None => None,
        };

        let transforms = env_var("OPENROUTER_TRANSFORMS")
            .map(|raw| split_csv(&raw))
            .unwrap_or_default();

        let min_p = parse_unit_interval("OPENROUTER_MIN_P");
        let top_a = parse_unit_interval("OPENROUTER_TOP_A");

        Ok(Self {
            fallback_models,
            routing_strategy,
            provider_preferences,
            transforms,
            min_p,
            top_a,
        })
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_unit_interval(key: &str) -> Option<f32> {
    let raw = env_var(key)?;
    match raw.parse::<f32>() {
        Ok(value) if (0.0..=1.0).contains(&value) => Some(value),
        Ok(value) => {
            log::warn!("ignoring {key}={value}: must be within [0.0, 1.0]");
            None
        }
        Err(e) => {
            log::warn!("ignoring {key}={raw}: {e}");
            None
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_min_p() {
        // SAFETY: tests run single-threaded within this module's env mutation.
        unsafe { env::set_var("OPENROUTER_MIN_P", "1.5") };
        assert_eq!(parse_unit_interval("OPENROUTER_MIN_P"), None);
        unsafe { env::remove_var("OPENROUTER_MIN_P") };
    }

    #[test]
    fn splits_fallback_models_on_comma() {
        assert_eq!(
            split_csv("gpt-4o, gpt-4o-mini ,claude-3-haiku"),
            vec!["gpt-4o", "gpt-4o-mini", "claude-3-haiku"]
        );
    }
}
