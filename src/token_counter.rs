//! Best-effort token counting for `/v1/messages/count_tokens`.
//!
//! This never calls upstream: it estimates locally using a `cl100k_base`
//! encoding, which is close enough for client-side budget checks without
//! needing a live round trip for every keystroke.

use tiktoken_rs::CoreBPE;

use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage};

fn encoder() -> CoreBPE {
    tiktoken_rs::cl100k_base().expect("cl100k_base encoding tables are statically bundled")
}

/// Estimates the input token count for a system prompt plus message
/// sequence, the same shape the dispatcher sends upstream.
pub fn count_input_tokens(system: Option<&str>, messages: &[UnifiedMessage]) -> i32 {
    let bpe = encoder();
    let mut total = 0usize;

    if let Some(system) = system {
        total += bpe.encode_with_special_tokens(system).len();
    }

    for message in messages {
        total += message_text(message).map(|text| bpe.encode_with_special_tokens(&text).len()).unwrap_or(0);
    }

    total as i32
}

fn message_text(message: &UnifiedMessage) -> Option<String> {
    match &message.content {
        UnifiedContentContainer::Text(text) => Some(text.clone()),
        UnifiedContentContainer::Blocks(blocks) => {
            let joined: Vec<&str> = blocks
                .iter()
                .filter_map(|block| match block {
                    UnifiedContent::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if joined.is_empty() { None } else { Some(joined.join("\n")) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::UnifiedRole;

    #[test]
    fn counts_system_plus_message_tokens() {
        let messages = vec![UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Text("Hello there".to_string()),
            tool_calls: None,
            tool_call_id: None,
        }];

        let count = count_input_tokens(Some("You are a helpful assistant."), &messages);
        assert!(count > 0);
    }
}
