use crate::protocol::canonical::{DetectedToolCall, TokenUsage};

use super::{
    OpenAiChatResponse, OpenAiChoice, OpenAiDelta, OpenAiMessage, OpenAiStreamChoice,
    OpenAiStreamChunk, OpenAiStreamToolCall, OpenAiToolCall, OpenAiToolCallFunction, OpenAiUsage,
};

pub const FINISH_STOP: &str = "stop";
pub const FINISH_TOOL_CALLS: &str = "tool_calls";

/// Identity shared by every event of one completion.
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub id: String,
    pub model: String,
    pub created: u64,
}

impl From<TokenUsage> for OpenAiUsage {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

fn chunk(meta: &CompletionMeta, delta: OpenAiDelta, finish_reason: Option<&str>) -> OpenAiStreamChunk {
    OpenAiStreamChunk {
        id: meta.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![OpenAiStreamChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage: None,
    }
}

/// One incremental content delta.
#[must_use]
pub fn encode_content_chunk(meta: &CompletionMeta, text: &str) -> OpenAiStreamChunk {
    chunk(
        meta,
        OpenAiDelta {
            content: Some(text.to_string()),
            ..OpenAiDelta::default()
        },
        None,
    )
}

/// Terminal chunk carrying the finish reason and usage.
#[must_use]
pub fn encode_finish_chunk(
    meta: &CompletionMeta,
    finish_reason: &str,
    usage: TokenUsage,
) -> OpenAiStreamChunk {
    let mut out = chunk(meta, OpenAiDelta::default(), Some(finish_reason));
    out.usage = Some(usage.into());
    out
}

/// All detected tool calls in a single delta.
#[must_use]
pub fn encode_tool_calls_chunk(meta: &CompletionMeta, calls: &[DetectedToolCall]) -> OpenAiStreamChunk {
    let tool_calls = calls
        .iter()
        .zip(0u32..)
        .map(|(call, index)| OpenAiStreamToolCall {
            index,
            id: call.id.clone(),
            type_: "function".to_string(),
            function: OpenAiToolCallFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        })
        .collect();
    chunk(
        meta,
        OpenAiDelta {
            role: Some("assistant".to_string()),
            tool_calls: Some(tool_calls),
            ..OpenAiDelta::default()
        },
        None,
    )
}

/// Buffered `chat.completion` body.
#[must_use]
pub fn encode_chat_response(
    meta: &CompletionMeta,
    content: Option<&str>,
    tool_calls: &[DetectedToolCall],
    usage: TokenUsage,
) -> OpenAiChatResponse {
    let tool_calls_field = if tool_calls.is_empty() {
        None
    } else {
        Some(
            tool_calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.id.clone(),
                    type_: "function".to_string(),
                    function: OpenAiToolCallFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
        )
    };
    let finish_reason = if tool_calls_field.is_some() {
        FINISH_TOOL_CALLS
    } else {
        FINISH_STOP
    };

    OpenAiChatResponse {
        id: meta.id.clone(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiMessage {
                role: "assistant".to_string(),
                content: content.map(|text| serde_json::Value::String(text.to_string())),
                tool_calls: tool_calls_field,
                ..OpenAiMessage::default()
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: Some(usage.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CompletionMeta {
        CompletionMeta {
            id: "chatcmpl-1".to_string(),
            model: "m".to_string(),
            created: 42,
        }
    }

    #[test]
    fn content_chunk_shape() {
        let json = serde_json::to_value(encode_content_chunk(&meta(), "Hi")).expect("json");
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["created"], 42);
        assert_eq!(json["choices"][0]["delta"]["content"], "Hi");
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn finish_chunk_carries_usage() {
        let json = serde_json::to_value(encode_finish_chunk(
            &meta(),
            FINISH_STOP,
            TokenUsage::new(10, 5),
        ))
        .expect("json");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 15);
    }

    #[test]
    fn tool_call_response_uses_tool_calls_finish_reason() {
        let calls = vec![DetectedToolCall {
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
            arguments: r#"{"city":"LA"}"#.to_string(),
        }];
        let wire = encode_chat_response(&meta(), None, &calls, TokenUsage::default());
        assert_eq!(wire.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let tool_calls = wire.choices[0].message.tool_calls.as_ref().expect("calls");
        assert_eq!(tool_calls[0].function.arguments, r#"{"city":"LA"}"#);
        assert!(wire.choices[0].message.content.is_none());
    }

    #[test]
    fn text_response_uses_stop() {
        let wire = encode_chat_response(&meta(), Some("hello"), &[], TokenUsage::new(1, 2));
        assert_eq!(wire.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(
            wire.choices[0].message.content,
            Some(serde_json::Value::String("hello".to_string()))
        );
        assert_eq!(wire.usage.map(|usage| usage.total_tokens), Some(3));
    }
}
