use std::collections::HashMap;

use serde_json::Value;

use crate::error::RelayError;
use crate::fc::prompt::format_history_tool_calls;
use crate::protocol::canonical::{ChatRequest, ConversationTurn, ToolChoice, ToolSpec, TurnRole};

use super::{OpenAiChatRequest, OpenAiMessage, OpenAiTool, OpenAiToolChoice};

/// Decode an `OpenAI` Chat Completions wire request into conversation turns.
///
/// Assistant tool calls are rendered into the assistant text in the same
/// directive format the model is asked to produce, and tool results are
/// named after the call they answer.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for an empty model or message list,
/// an unknown `tool_choice` mode, or a `tool_choice` naming an undeclared tool.
pub fn decode_openai_chat_request(request: OpenAiChatRequest) -> Result<ChatRequest, RelayError> {
    let OpenAiChatRequest {
        model,
        messages,
        tools,
        tool_choice,
        stream,
        extra: _,
    } = request;

    if model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }
    if messages.is_empty() {
        return Err(RelayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let tools = decode_tools(tools);
    let tool_choice = decode_tool_choice(tool_choice, &tools)?;
    let call_names = build_tool_call_index(&messages);
    let turns = messages
        .into_iter()
        .map(|msg| decode_message(msg, &call_names))
        .collect();

    Ok(ChatRequest {
        model,
        stream: stream.unwrap_or(false),
        turns,
        tools,
        tool_choice,
    })
}

fn build_tool_call_index(messages: &[OpenAiMessage]) -> HashMap<String, String> {
    messages
        .iter()
        .filter(|msg| msg.role == "assistant")
        .flat_map(|msg| msg.tool_calls.iter().flatten())
        .map(|call| (call.id.clone(), call.function.name.clone()))
        .collect()
}

fn decode_message(msg: OpenAiMessage, call_names: &HashMap<String, String>) -> ConversationTurn {
    let OpenAiMessage {
        role,
        content,
        name,
        tool_calls,
        tool_call_id,
    } = msg;
    let role = TurnRole::from_wire(&role);
    let mut text = extract_text_content(content);

    if let Some(calls) = tool_calls.filter(|calls| !calls.is_empty()) {
        let rendered: Vec<(&str, &str)> = calls
            .iter()
            .map(|call| (call.function.name.as_str(), call.function.arguments.as_str()))
            .collect();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format_history_tool_calls(&rendered));
    }

    let name = match role {
        TurnRole::Tool => name
            .or_else(|| tool_call_id.and_then(|id| call_names.get(&id).cloned()))
            .or_else(|| Some("unknown".to_string())),
        _ => name,
    };

    ConversationTurn {
        role,
        content: text,
        name,
    }
}

/// Extract plain text from an `OpenAI` message content field.
fn extract_text_content(content: Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s,
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            for part in &parts {
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                if let Some(content) = part.get("text").and_then(Value::as_str) {
                    text.push_str(content);
                }
            }
            text
        }
        None | Some(_) => String::new(),
    }
}

fn decode_tools(tools: Option<Vec<OpenAiTool>>) -> Vec<ToolSpec> {
    tools
        .unwrap_or_default()
        .into_iter()
        .filter(|tool| tool.type_ == "function")
        .map(|tool| ToolSpec {
            name: tool.function.name,
            description: tool.function.description,
            parameters: tool
                .function
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect()
}

fn decode_tool_choice(
    choice: Option<OpenAiToolChoice>,
    tools: &[ToolSpec],
) -> Result<ToolChoice, RelayError> {
    match choice {
        None => Ok(ToolChoice::Auto),
        Some(OpenAiToolChoice::Mode(mode)) => match mode.as_str() {
            "auto" => Ok(ToolChoice::Auto),
            "none" => Ok(ToolChoice::None),
            "required" => Ok(ToolChoice::Required),
            other => Err(RelayError::InvalidRequest(format!(
                "unsupported tool_choice '{other}'"
            ))),
        },
        Some(OpenAiToolChoice::Function(call)) => {
            let name = call.function.name;
            if !tools.iter().any(|tool| tool.name == name) {
                return Err(RelayError::InvalidRequest(format!(
                    "tool_choice names undeclared tool '{name}'"
                )));
            }
            Ok(ToolChoice::Specific(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: serde_json::Value) -> Result<ChatRequest, RelayError> {
        let wire: OpenAiChatRequest = serde_json::from_value(body).expect("wire request");
        decode_openai_chat_request(wire)
    }

    #[test]
    fn decodes_roles_and_text_parts() {
        let request = parse(json!({
            "model": "m",
            "stream": true,
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "hello "},
                    {"type": "image_url", "image_url": {"url": "x"}},
                    {"type": "text", "text": "there"}
                ]}
            ]
        }))
        .expect("decode");

        assert!(request.stream);
        assert_eq!(
            request.turns,
            vec![
                ConversationTurn::new(TurnRole::System, "be brief"),
                ConversationTurn::new(TurnRole::User, "hello there"),
            ]
        );
        assert_eq!(request.tool_choice, ToolChoice::Auto);
    }

    #[test]
    fn tool_results_are_named_after_their_call() {
        let request = parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ]
        }))
        .expect("decode");

        assert!(request.ends_with_tool_result());
        let tool_turn = &request.turns[2];
        assert_eq!(tool_turn.name.as_deref(), Some("get_weather"));
        assert!(request.turns[1].content.contains("<tool>get_weather</tool>"));
    }

    #[test]
    fn tool_choice_is_validated() {
        let tools = json!([{"type": "function", "function": {"name": "lookup"}}]);
        let request = parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": tools,
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        }))
        .expect("decode");
        assert_eq!(request.tool_choice, ToolChoice::Specific("lookup".to_string()));
        assert_eq!(request.tools[0].parameters["type"], "object");

        let err = parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": tools,
            "tool_choice": {"type": "function", "function": {"name": "missing"}}
        }))
        .expect_err("undeclared tool");
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let err = parse(json!({"model": "m", "messages": []})).expect_err("empty");
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }
}
