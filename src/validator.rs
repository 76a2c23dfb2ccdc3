//! Conversation-flow validation (C6): checks role sequencing and
//! tool-use/tool-result pairing before a request is converted upstream.

use std::collections::{HashMap, HashSet};

use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRole};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub orphaned_tool_ids: Vec<String>,
    pub missing_tool_use_ids: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs every C6 check against the full message sequence.
pub(crate) fn validate(messages: &[UnifiedMessage]) -> ValidationReport {
    let mut report = ValidationReport::default();

    if messages.is_empty() {
        report.errors.push("message sequence must not be empty".to_string());
        return report;
    }

    if messages[0].role != UnifiedRole::User {
        report.errors.push("first message must have role \"user\"".to_string());
    }

    check_role_sequence(messages, &mut report);
    check_tool_pairing(messages, &mut report);

    report
}

fn check_role_sequence(messages: &[UnifiedMessage], report: &mut ValidationReport) {
    for window in messages.windows(2) {
        let [previous, current] = window else { continue };

        if previous.role != current.role {
            continue;
        }

        match current.role {
            UnifiedRole::User if contains_tool_result(current) => {}
            UnifiedRole::Assistant => {
                report.warnings.push("consecutive assistant turns without an intervening user message".to_string());
            }
            _ => {
                report.warnings.push(format!("consecutive {:?} messages without tool results between them", current.role));
            }
        }
    }
}

fn check_tool_pairing(messages: &[UnifiedMessage], report: &mut ValidationReport) {
    let mut declared: HashMap<String, usize> = HashMap::new();
    let mut satisfied: HashSet<String> = HashSet::new();

    for (index, message) in messages.iter().enumerate() {
        for block in content_blocks(message) {
            match block {
                UnifiedContent::ToolUse { id, .. } => {
                    declared.insert(id.clone(), index);
                }
                UnifiedContent::ToolResult { tool_use_id, .. } => {
                    if declared.contains_key(tool_use_id) {
                        satisfied.insert(tool_use_id.clone());
                    } else {
                        report.missing_tool_use_ids.push(tool_use_id.clone());
                    }
                }
                _ => {}
            }
        }
    }

    let last_assistant_index = messages.iter().rposition(|m| m.role == UnifiedRole::Assistant);

    for (id, declared_at) in &declared {
        if satisfied.contains(id) {
            continue;
        }

        if Some(*declared_at) == last_assistant_index {
            continue;
        }

        report.orphaned_tool_ids.push(id.clone());
    }

    if !report.orphaned_tool_ids.is_empty() {
        report.orphaned_tool_ids.sort();
        report
            .errors
            .push(format!("orphaned tool_use ids: {}", report.orphaned_tool_ids.join(", ")));

        for id in &report.orphaned_tool_ids {
            if let Some(name) = find_tool_name_for_id(messages, id) {
                report
                    .suggestions
                    .push(format!("tool_use \"{name}\" (id {id}) has no matching tool_result; add one before sending another request"));
            }
        }
    }

    if !report.missing_tool_use_ids.is_empty() {
        report.missing_tool_use_ids.sort();
        report
            .errors
            .push(format!("tool_result references unknown tool_use ids: {}", report.missing_tool_use_ids.join(", ")));
    }
}

/// Looks backward through the sequence for the `tool_use` block that
/// declared `id`, to give a more useful diagnostic than the bare id.
fn find_tool_name_for_id<'a>(messages: &'a [UnifiedMessage], id: &str) -> Option<&'a str> {
    messages.iter().rev().find_map(|message| {
        content_blocks(message).find_map(|block| match block {
            UnifiedContent::ToolUse { id: block_id, name, .. } if block_id == id => Some(name.as_str()),
            _ => None,
        })
    })
}

fn contains_tool_result(message: &UnifiedMessage) -> bool {
    content_blocks(message).any(|block| matches!(block, UnifiedContent::ToolResult { .. }))
}

fn content_blocks(message: &UnifiedMessage) -> Box<dyn Iterator<Item = &UnifiedContent> + '_> {
    match &message.content {
        UnifiedContentContainer::Text(_) => Box::new(std::iter::empty()),
        UnifiedContentContainer::Blocks(blocks) => Box::new(blocks.iter()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::unified::UnifiedContentContainer;

    fn text_message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn rejects_empty_sequence() {
        let report = validate(&[]);
        assert!(!report.is_valid());
    }

    #[test]
    fn rejects_non_user_first_message() {
        let report = validate(&[text_message(UnifiedRole::Assistant, "hi")]);
        assert!(!report.is_valid());
    }

    #[test]
    fn flags_orphaned_tool_use() {
        let messages = vec![
            text_message(UnifiedRole::User, "call a tool"),
            UnifiedMessage {
                role: UnifiedRole::Assistant,
                content: UnifiedContentContainer::Blocks(vec![
                    UnifiedContent::Text { text: "ok".to_string() },
                    UnifiedContent::ToolUse {
                        id: "t1".to_string(),
                        name: "get_weather".to_string(),
                        input: json!({}),
                    },
                ]),
                tool_calls: None,
                tool_call_id: None,
            },
            text_message(UnifiedRole::User, "unrelated follow-up"),
            text_message(UnifiedRole::Assistant, "more text"),
        ];

        let report = validate(&messages);
        assert_eq!(report.orphaned_tool_ids, vec!["t1".to_string()]);
        assert!(!report.is_valid());
        assert!(report.suggestions.iter().any(|s| s.contains("get_weather")));
    }

    #[test]
    fn pending_tool_use_in_latest_assistant_turn_is_not_orphaned() {
        let messages = vec![
            text_message(UnifiedRole::User, "call a tool"),
            UnifiedMessage {
                role: UnifiedRole::Assistant,
                content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolUse {
                    id: "t1".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({}),
                }]),
                tool_calls: None,
                tool_call_id: None,
            },
        ];

        let report = validate(&messages);
        assert!(report.is_valid());
    }

    #[test]
    fn flags_dangling_tool_result() {
        let messages = vec![
            text_message(UnifiedRole::User, "hi"),
            UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolResult {
                    tool_use_id: "unknown".to_string(),
                    content: crate::messages::unified::UnifiedToolResultContent::Text("sunny".to_string()),
                    is_error: None,
                }]),
                tool_calls: None,
                tool_call_id: None,
            },
        ];

        let report = validate(&messages);
        assert_eq!(report.missing_tool_use_ids, vec!["unknown".to_string()]);
        assert!(!report.is_valid());
    }
}
