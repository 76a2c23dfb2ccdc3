//! Model aliasing (C1): normalizes caller-supplied model names to a
//! backend-specific identifier. Never fails — unknown names pass through.

use crate::dispatcher::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingKind {
    AliasResolved,
    Passthrough,
}

#[derive(Debug, Clone)]
pub(crate) struct ModelMapping {
    pub canonical_model: String,
    pub kind: MappingKind,
}

/// Resolve `alias` for `backend`, applying the `openrouter/` prefix exactly
/// once when targeting an OpenRouter-family backend.
pub(crate) fn resolve(alias: &str, backend: Backend, big_model: &str, small_model: &str) -> ModelMapping {
    let resolved = match alias {
        "big" => Some(big_model.to_string()),
        "small" => Some(small_model.to_string()),
        "sonnet" => Some("anthropic/claude-3.5-sonnet".to_string()),
        "haiku" => Some("anthropic/claude-3.5-haiku".to_string()),
        "opus" => Some("anthropic/claude-3-opus".to_string()),
        _ => None,
    };

    let Some(mut model) = resolved else {
        return ModelMapping {
            canonical_model: apply_prefix(alias.to_string(), backend),
            kind: MappingKind::Passthrough,
        };
    };

    model = apply_prefix(model, backend);

    ModelMapping {
        canonical_model: model,
        kind: MappingKind::AliasResolved,
    }
}

/// Applies the `openrouter/` prefix exactly once, for OpenRouter-family
/// backends only, based on the active backend rather than on string content.
fn apply_prefix(model: String, backend: Backend) -> String {
    match backend {
        Backend::DirectOpenAiCompatible | Backend::TranslationLibrary => {
            if model.starts_with("openrouter/") {
                model
            } else {
                format!("openrouter/{model}")
            }
        }
        Backend::AzureDatabricks => model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_big_alias_with_prefix() {
        let mapping = resolve("big", Backend::DirectOpenAiCompatible, "anthropic/claude-3-opus", "x");
        assert_eq!(mapping.canonical_model, "openrouter/anthropic/claude-3-opus");
        assert_eq!(mapping.kind, MappingKind::AliasResolved);
    }

    #[test]
    fn passthrough_keeps_unknown_models_but_still_prefixes() {
        let mapping = resolve("mistral/mixtral-8x7b", Backend::DirectOpenAiCompatible, "x", "y");
        assert_eq!(mapping.canonical_model, "openrouter/mistral/mixtral-8x7b");
        assert_eq!(mapping.kind, MappingKind::Passthrough);
    }

    #[test]
    fn prefix_applied_exactly_once() {
        let mapping = resolve("openrouter/anthropic/claude-3-opus", Backend::DirectOpenAiCompatible, "x", "y");
        assert_eq!(mapping.canonical_model, "openrouter/anthropic/claude-3-opus");
    }

    #[test]
    fn azure_backend_never_gets_openrouter_prefix() {
        let mapping = resolve("big", Backend::AzureDatabricks, "claude-3-opus", "y");
        assert_eq!(mapping.canonical_model, "claude-3-opus");
    }
}
