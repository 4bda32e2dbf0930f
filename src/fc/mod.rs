//! Tool calling on top of plain-text backends: prompt injection, directive
//! detection and parsing, and the side round-trip that ties them together.

pub mod detector;
pub mod orchestrator;
pub mod parser;
pub mod prompt;

pub use orchestrator::{maybe_handle_tool, no_backend_for, ToolCallReporter};
pub use parser::{parse_tool_calls, ParsedToolCall};
