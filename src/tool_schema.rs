//! Tool-schema sanitization (C3): defensive pruning of JSON Schema
//! fragments so upstream providers that reject uncommon keywords still
//! accept the tool declaration.

use serde_json::Value;

const MAX_DESCRIPTION_LEN: usize = 200;
const KEPT_STRING_FORMATS: &[&str] = &["enum", "date-time"];

/// Deep-copies and sanitizes a single tool's `input_schema`. Never mutates
/// `schema` in place.
pub(crate) fn sanitize_schema(schema: &Value) -> Value {
    let mut cloned = schema.clone();
    prune(&mut cloned);
    cloned
}

fn prune(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };

    map.remove("additionalProperties");
    map.remove("default");
    map.remove("$schema");

    let is_string_type = matches!(map.get("type"), Some(Value::String(t)) if t == "string");
    if is_string_type {
        let keep = matches!(map.get("format"), Some(Value::String(f)) if KEPT_STRING_FORMATS.contains(&f.as_str()));
        if !keep {
            map.remove("format");
        }
    }

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        for property in properties.values_mut() {
            prune(property);
        }
    }

    if let Some(items) = map.get_mut("items") {
        prune(items);
    }
}

/// Trims a tool description, appends a period if missing, and truncates on
/// a word boundary near [`MAX_DESCRIPTION_LEN`].
pub(crate) fn normalize_description(description: &str) -> String {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut normalized = if trimmed.chars().count() > MAX_DESCRIPTION_LEN {
        let truncated: String = trimmed.chars().take(MAX_DESCRIPTION_LEN).collect();
        match truncated.rfind(' ') {
            Some(boundary) => truncated[..boundary].to_string(),
            None => truncated,
        }
    } else {
        trimmed.to_string()
    };

    if !normalized.ends_with('.') {
        normalized.push('.');
    }

    normalized
}

/// Caps the number of tools attached to a request, keeping declaration
/// order. Backends that mishandle many simultaneous tool declarations use
/// this instead of the full set.
pub(crate) fn cap_tool_count<T>(tools: Vec<T>, max_tools: usize) -> Vec<T> {
    if tools.len() <= max_tools {
        return tools;
    }

    log::warn!("capping {} tools down to {max_tools}", tools.len());
    tools.into_iter().take(max_tools).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_additional_properties_and_default_recursively() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "path": {"type": "string", "default": "/tmp", "format": "uri"},
                "nested": {
                    "type": "object",
                    "additionalProperties": true,
                    "properties": {"count": {"type": "integer", "default": 1}}
                }
            }
        });

        let sanitized = sanitize_schema(&schema);

        assert!(sanitized.get("additionalProperties").is_none());
        assert!(sanitized["properties"]["path"].get("default").is_none());
        assert!(sanitized["properties"]["path"].get("format").is_none());
        assert!(sanitized["properties"]["nested"].get("additionalProperties").is_none());
        assert!(sanitized["properties"]["nested"]["properties"]["count"].get("default").is_none());
    }

    #[test]
    fn keeps_enum_and_date_time_formats() {
        let schema = json!({"type": "string", "format": "enum"});
        let sanitized = sanitize_schema(&schema);
        assert_eq!(sanitized["format"], json!("enum"));
    }

    #[test]
    fn normalizes_description_with_period_and_truncation() {
        assert_eq!(normalize_description("  reads a file "), "reads a file.");

        let long = "word ".repeat(80);
        let normalized = normalize_description(&long);
        assert!(normalized.len() <= MAX_DESCRIPTION_LEN + 1);
        assert!(normalized.ends_with('.'));
    }

    #[test]
    fn caps_tool_count_preserving_order() {
        let tools = vec!["a", "b", "c", "d"];
        assert_eq!(cap_tool_count(tools, 2), vec!["a", "b"]);
    }
}
