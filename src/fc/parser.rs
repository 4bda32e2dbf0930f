//! Tool directive parsing.
//!
//! Expected shape after the trigger signal:
//!
//! ```xml
//! <function_calls>
//!   <function_call>
//!     <tool>tool_name</tool>
//!     <args_json><![CDATA[{"key": "value"}]]></args_json>
//!   </function_call>
//! </function_calls>
//! ```
use memchr::memmem;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

use super::detector::{scan_for_trigger, FC_CLOSE, FC_OPEN};
use crate::error::RelayError;
use crate::protocol::canonical::ToolSpec;

/// A tool call extracted from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

fn parse_err(message: impl Into<String>) -> RelayError {
    RelayError::ToolCall(message.into())
}

/// Parse the tool calls following the last trigger signal outside reasoning
/// blocks.
///
/// Every call must name a declared tool and carry object arguments.
///
/// # Errors
///
/// Returns [`RelayError::ToolCall`] when no trigger or complete
/// `<function_calls>` block is present, the XML is malformed, or a call is
/// invalid.
pub fn parse_tool_calls(
    text: &str,
    trigger_signal: &str,
    tools: &[ToolSpec],
) -> Result<Vec<ParsedToolCall>, RelayError> {
    let start = scan_for_trigger(text, trigger_signal)
        .last_trigger
        .ok_or_else(|| parse_err("trigger signal not found"))?;
    let block = find_function_calls_block(&text[start + trigger_signal.len()..])
        .ok_or_else(|| parse_err("trigger signal not followed by a complete <function_calls> block"))?;

    let calls = parse_block(block)?;
    if calls.is_empty() {
        return Err(parse_err("no tool calls in <function_calls> block"));
    }
    for call in &calls {
        if call.name.is_empty() {
            return Err(parse_err("tool call has empty name"));
        }
        if !tools.iter().any(|tool| tool.name == call.name) {
            return Err(parse_err(format!("tool '{}' was not declared", call.name)));
        }
    }
    Ok(calls)
}

fn find_function_calls_block(text: &str) -> Option<&str> {
    let open = memmem::find(text.as_bytes(), FC_OPEN.as_bytes())?;
    let close = open + memmem::find(&text.as_bytes()[open..], FC_CLOSE.as_bytes())?;
    Some(&text[open..close + FC_CLOSE.len()])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Tool,
    Args,
}

#[derive(Default)]
struct PendingCall {
    name: String,
    args: String,
}

fn parse_block(xml: &str) -> Result<Vec<ParsedToolCall>, RelayError> {
    let mut reader = Reader::from_str(xml);
    let mut calls = Vec::with_capacity(1);
    let mut current: Option<PendingCall> = None;
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"function_call" => current = Some(PendingCall::default()),
                b"tool" if current.is_some() => field = Field::Tool,
                b"args_json" | b"arguments" if current.is_some() => field = Field::Args,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"tool" | b"args_json" | b"arguments" => field = Field::None,
                b"function_call" => {
                    if let Some(call) = current.take() {
                        calls.push(finish_call(call)?);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| parse_err(format!("invalid XML text: {err}")))?;
                push_field(current.as_mut(), field, &text);
            }
            Ok(Event::CData(e)) => {
                push_field(current.as_mut(), field, &String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(parse_err(format!("XML parse error: {err}"))),
            Ok(_) => {}
        }
    }
    Ok(calls)
}

fn push_field(current: Option<&mut PendingCall>, field: Field, text: &str) {
    let Some(call) = current else {
        return;
    };
    match field {
        Field::Tool => call.name.push_str(text),
        Field::Args => call.args.push_str(text),
        Field::None => {}
    }
}

fn finish_call(call: PendingCall) -> Result<ParsedToolCall, RelayError> {
    let name = call.name.trim().to_string();
    let args = call.args.trim();
    let arguments = if args.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(args) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(parse_err(format!(
                    "tool call '{name}' arguments must be a JSON object"
                )));
            }
            Err(err) => {
                return Err(parse_err(format!(
                    "tool call '{name}' arguments are not valid JSON: {err}"
                )));
            }
        }
    };
    Ok(ParsedToolCall { name, arguments })
}
