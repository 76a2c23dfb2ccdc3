//! Streaming engine (C8): turns a stream of [`UnifiedChunk`]s into the
//! Anthropic-dialect event sequence the caller expects, synthesizing any
//! framing events the upstream dialect doesn't carry.

use std::collections::HashSet;

use crate::messages::{
    anthropic::{
        AnthropicContent, AnthropicContentDelta, AnthropicMessageDelta, AnthropicStopReason, AnthropicStreamEvent,
        AnthropicStreamMessageStart, AnthropicUsage,
    },
    unified::{UnifiedChunk, UnifiedFinishReason, UnifiedStreamingToolCall},
};

/// Per-request state carried across the chunk sequence. `content_block_stop`
/// events and the initial `message_start`/final `message_stop` framing are
/// not present on the wire, so this encoder synthesizes them.
pub(crate) struct AnthropicStreamEncoder {
    started: bool,
    open_index: Option<u32>,
    tool_blocks_started: HashSet<u32>,
    closed: bool,
    input_tokens: i32,
}

impl AnthropicStreamEncoder {
    pub(crate) fn new() -> Self {
        Self {
            started: false,
            open_index: None,
            tool_blocks_started: HashSet::new(),
            closed: false,
            input_tokens: 0,
        }
    }

    /// Translates one upstream chunk into zero or more Anthropic SSE events,
    /// in wire order.
    pub(crate) fn encode(&mut self, message_id: &str, chunk: UnifiedChunk) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(AnthropicStreamEvent::MessageStart {
                message: AnthropicStreamMessageStart {
                    id: message_id.to_string(),
                    message_type: "message".to_string(),
                    role: crate::messages::anthropic::AnthropicRole::Assistant,
                    content: Vec::new(),
                    model: chunk.model.to_string(),
                    usage: AnthropicUsage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                },
            });
        }

        if let Some(usage) = &chunk.usage {
            self.input_tokens = usage.prompt_tokens as i32;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(text) = choice.delta.content {
            self.ensure_text_block_open(&mut events, choice.index);
            events.push(AnthropicStreamEvent::ContentBlockDelta {
                index: choice.index,
                delta: AnthropicContentDelta::TextDelta { text },
            });
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tool_call in tool_calls {
                self.encode_tool_call(&mut events, tool_call);
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            self.close_open_block(&mut events);
            events.push(AnthropicStreamEvent::MessageDelta {
                delta: AnthropicMessageDelta {
                    stop_reason: Some(map_finish_reason(finish_reason)),
                    stop_sequence: None,
                },
                usage: AnthropicUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            });
            events.push(AnthropicStreamEvent::MessageStop);
            self.closed = true;
        }

        events
    }

    /// Whether the stream has already emitted `message_stop`.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Called when the upstream connection drops without a terminal chunk.
    /// Closes out any open block and emits a terminal error event.
    pub(crate) fn encode_error(&mut self, message: String) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        self.close_open_block(&mut events);
        events.push(AnthropicStreamEvent::Error {
            error: crate::messages::anthropic::AnthropicErrorDetails {
                error_type: "api_error".to_string(),
                message,
            },
        });
        self.closed = true;
        events
    }

    fn ensure_text_block_open(&mut self, events: &mut Vec<AnthropicStreamEvent>, index: u32) {
        if self.open_index == Some(index) {
            return;
        }

        self.close_open_block(events);
        events.push(AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block: AnthropicContent::Text { text: String::new() },
        });
        self.open_index = Some(index);
    }

    fn encode_tool_call(&mut self, events: &mut Vec<AnthropicStreamEvent>, tool_call: UnifiedStreamingToolCall) {
        match tool_call {
            UnifiedStreamingToolCall::Start { index, .. } => {
                let index = index as u32;
                self.close_open_block(events);
                self.tool_blocks_started.insert(index);
                self.open_index = Some(index);
                events.push(AnthropicStreamEvent::from(tool_call));
            }
            UnifiedStreamingToolCall::Delta { index, .. } => {
                let index = index as u32;
                // Fixed source bug: a delta with no prior start for its index
                // synthesizes an empty tool_use block first.
                if !self.tool_blocks_started.contains(&index) {
                    self.close_open_block(events);
                    self.tool_blocks_started.insert(index);
                    self.open_index = Some(index);
                    events.push(AnthropicStreamEvent::ContentBlockStart {
                        index,
                        content_block: AnthropicContent::ToolUse {
                            id: format!("synthesized_{index}"),
                            name: String::new(),
                            input: serde_json::Value::Object(serde_json::Map::new()),
                        },
                    });
                }
                events.push(AnthropicStreamEvent::from(tool_call));
            }
        }
    }

    fn close_open_block(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        if let Some(index) = self.open_index.take() {
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }
}

fn map_finish_reason(reason: UnifiedFinishReason) -> AnthropicStopReason {
    match reason {
        UnifiedFinishReason::Stop => AnthropicStopReason::EndTurn,
        UnifiedFinishReason::Length => AnthropicStopReason::MaxTokens,
        UnifiedFinishReason::ToolCalls => AnthropicStopReason::ToolUse,
        UnifiedFinishReason::ContentFilter => AnthropicStopReason::StopSequence,
    }
}

#[cfg(test)]
mod tests {
    use crate::messages::unified::{UnifiedChoiceDelta, UnifiedMessageDelta, UnifiedRole};

    use super::*;

    fn content_chunk(text: &str) -> UnifiedChunk {
        UnifiedChunk {
            id: "chatcmpl-1".into(),
            model: "big".into(),
            created: 0,
            usage: None,
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: Some(UnifiedRole::Assistant),
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
        }
    }

    fn finish_chunk(reason: UnifiedFinishReason) -> UnifiedChunk {
        UnifiedChunk {
            id: "chatcmpl-1".into(),
            model: "big".into(),
            created: 0,
            usage: None,
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some(reason),
            }],
        }
    }

    #[test]
    fn concatenates_text_deltas_in_order() {
        let mut encoder = AnthropicStreamEncoder::new();

        let mut texts = Vec::new();
        for piece in ["Hel", "lo ", "world"] {
            for event in encoder.encode("msg_1", content_chunk(piece)) {
                if let AnthropicStreamEvent::ContentBlockDelta {
                    delta: AnthropicContentDelta::TextDelta { text },
                    ..
                } = event
                {
                    texts.push(text);
                }
            }
        }

        for event in encoder.encode("msg_1", finish_chunk(UnifiedFinishReason::Stop)) {
            if let AnthropicStreamEvent::MessageStop = event {
                assert!(encoder.is_closed());
            }
        }

        assert_eq!(texts.concat(), "Hello world");
    }

    #[test]
    fn first_chunk_emits_message_start_then_content_block_start() {
        let mut encoder = AnthropicStreamEncoder::new();
        let events = encoder.encode("msg_1", content_chunk("hi"));

        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], AnthropicStreamEvent::ContentBlockStart { .. }));
        assert!(matches!(events[2], AnthropicStreamEvent::ContentBlockDelta { .. }));
    }

    #[test]
    fn tool_call_delta_without_prior_start_synthesizes_one() {
        let mut encoder = AnthropicStreamEncoder::new();

        let chunk = UnifiedChunk {
            id: "chatcmpl-1".into(),
            model: "big".into(),
            created: 0,
            usage: None,
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![UnifiedStreamingToolCall::Delta {
                        index: 0,
                        function: crate::messages::unified::UnifiedFunctionDelta {
                            arguments: "{\"city\":".to_string(),
                        },
                    }]),
                },
                finish_reason: None,
            }],
        };

        let events = encoder.encode("msg_1", chunk);
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStart { .. })));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockDelta { .. })));
    }
}
