use std::sync::LazyLock;

use serde_json::Value;

use crate::error::RelayError;
use crate::history::CompactedHistory;
use crate::protocol::canonical::{ToolChoice, ToolSpec};

static TRIGGER_SIGNAL: LazyLock<String> = LazyLock::new(|| {
    const ALNUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let chars: String = (0..4)
        .map(|_| char::from(ALNUM[fastrand::usize(..ALNUM.len())]))
        .collect();
    format!("<Function_{chars}_Start/>")
});

/// Return the per-process trigger signal (`<Function_XXXX_Start/>`).
#[must_use]
pub fn get_trigger_signal() -> &'static str {
    &TRIGGER_SIGNAL
}

const CONSTRAINT_KEYS: [&str; 9] = [
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "minItems",
    "maxItems",
    "uniqueItems",
];

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

fn format_param(name: &str, info: &Value, required: &[&str], out: &mut Vec<String>) {
    let ty = info.get("type").and_then(Value::as_str).unwrap_or("any");
    let is_required = if required.contains(&name) { "yes" } else { "no" };
    out.push(format!("- {name} ({ty}, required: {is_required})"));

    if let Some(desc) = info.get("description").and_then(Value::as_str) {
        out.push(format!("  description: {desc}"));
    }
    if let Some(values) = info.get("enum") {
        out.push(format!("  enum: {}", compact_json(values)));
    }
    if let Some(default) = info.get("default") {
        out.push(format!("  default: {}", compact_json(default)));
    }
    let mut constraints = serde_json::Map::new();
    for key in CONSTRAINT_KEYS {
        if let Some(value) = info.get(key) {
            constraints.insert(key.to_string(), value.clone());
        }
    }
    if let Some(item_type) = info.pointer("/items/type") {
        constraints.insert("items.type".to_string(), item_type.clone());
    }
    if !constraints.is_empty() {
        let constraints = Value::Object(constraints);
        out.push(format!("  constraints: {}", compact_json(&constraints)));
    }
}

/// Render the declared tools as the numbered list embedded in the prompt.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when a schema's `properties` is not
/// an object, `required` is not a list of strings, or a required key is not
/// declared in `properties`.
pub fn format_tools_list(tools: &[ToolSpec]) -> Result<String, RelayError> {
    let mut blocks = Vec::with_capacity(tools.len());

    for (index, tool) in tools.iter().enumerate() {
        let name = &tool.name;
        let properties = match tool.parameters.get("properties") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(RelayError::InvalidRequest(format!(
                    "tool '{name}': 'properties' must be an object"
                )));
            }
        };
        let required: Vec<&str> = match tool.parameters.get("required") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().ok_or_else(|| {
                        RelayError::InvalidRequest(format!(
                            "tool '{name}': 'required' entries must be strings"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(RelayError::InvalidRequest(format!(
                    "tool '{name}': 'required' must be a list"
                )));
            }
        };
        if let Some(missing) = required
            .iter()
            .find(|key| properties.is_none_or(|props| !props.contains_key(**key)))
        {
            return Err(RelayError::InvalidRequest(format!(
                "tool '{name}': required parameter '{missing}' is not defined in properties"
            )));
        }

        let mut lines = vec![format!("{}. <tool name=\"{name}\">", index + 1)];
        if let Some(desc) = tool.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("   Description: {desc}"));
        }
        lines.push("   Parameters:".to_string());
        match properties.filter(|props| !props.is_empty()) {
            Some(props) => {
                for (param, info) in props {
                    format_param(param, info, &required, &mut lines);
                }
            }
            None => lines.push("   (none)".to_string()),
        }
        blocks.push(lines.join("\n"));
    }

    Ok(blocks.join("\n\n"))
}

fn default_prompt_template() -> &'static str {
    r#"You can call the following tools:

{tools_list}

To call tools, start a new line with exactly this signal and nothing else on that line:
{trigger_signal}
Right after it, write one <function_calls> block containing one <function_call> per call:
<function_calls>
    <function_call>
        <tool>TOOL_NAME</tool>
        <args_json><![CDATA[{"param": "value"}]]></args_json>
    </function_call>
</function_calls>

Rules:
- Emit the signal once, even for several calls.
- <tool> must be the exact name of a listed tool.
- <args_json> holds one JSON object with every required parameter, keys spelled exactly as declared.
- Write nothing after </function_calls>.
- If no tool is needed, answer normally without the signal."#
}

/// Build the tool instructions for one request.
///
/// A custom template replaces the default one; both must contain
/// `{tools_list}` and `{trigger_signal}`.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when a tool schema is malformed.
pub fn build_tool_prompt(
    tools: &[ToolSpec],
    tool_choice: &ToolChoice,
    custom_template: Option<&str>,
) -> Result<String, RelayError> {
    let tools_list = format_tools_list(tools)?;
    let template = custom_template.unwrap_or(default_prompt_template());
    let prompt = template
        .replace("{trigger_signal}", get_trigger_signal())
        .replace("{tools_list}", &tools_list);

    Ok(match tool_choice {
        ToolChoice::Auto | ToolChoice::None => prompt,
        ToolChoice::Required => format!("{prompt}\n\nYou MUST call at least one tool."),
        ToolChoice::Specific(name) => format!("{prompt}\n\nYou MUST call the tool: {name}"),
    })
}

/// Single-turn prompt for the side round-trip: tool instructions, the
/// conversation so far, then the pending request.
#[must_use]
pub fn build_lead_in(tool_prompt: &str, history: &CompactedHistory) -> String {
    let transcript = history.transcript();
    let mut out = String::with_capacity(
        tool_prompt.len() + transcript.len() + history.trailing_prompt.len() + 64,
    );
    out.push_str(tool_prompt);
    if !transcript.is_empty() {
        out.push_str("\n\nConversation so far:\n");
        out.push_str(&transcript);
    }
    out.push_str("\n\nRequest:\n");
    out.push_str(&history.trailing_prompt);
    out
}

fn wrap_cdata(text: &str) -> String {
    let safe = text.replace("]]>", "]]]]><![CDATA[>");
    format!("<![CDATA[{safe}]]>")
}

/// Render earlier assistant tool calls (name, JSON arguments) in directive form.
#[must_use]
pub fn format_history_tool_calls(calls: &[(&str, &str)]) -> String {
    let mut out = String::new();
    out.push_str(get_trigger_signal());
    out.push_str("\n<function_calls>\n");
    for (name, arguments) in calls {
        out.push_str("    <function_call>\n        <tool>");
        out.push_str(name);
        out.push_str("</tool>\n        <args_json>");
        out.push_str(&wrap_cdata(arguments));
        out.push_str("</args_json>\n    </function_call>\n");
    }
    out.push_str("</function_calls>");
    out
}
