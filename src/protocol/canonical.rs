use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Role of one incoming conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
    /// Explicit end-of-history marker some clients insert between sessions.
    End,
}

impl TurnRole {
    /// Map a wire role string. Unknown roles are treated as user input.
    #[must_use]
    pub fn from_wire(role: &str) -> Self {
        match role {
            "system" | "developer" => TurnRole::System,
            "assistant" => TurnRole::Assistant,
            "tool" | "function" => TurnRole::Tool,
            "end" => TurnRole::End,
            _ => TurnRole::User,
        }
    }
}

/// A single immutable turn of the client conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub name: Option<String>,
}

impl ConversationTurn {
    #[must_use]
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Coarse classification used when merging adjacent turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleBucket {
    Assistant,
    End,
    User,
}

impl RoleBucket {
    #[must_use]
    pub fn of(role: TurnRole) -> Self {
        match role {
            TurnRole::Assistant => RoleBucket::Assistant,
            TurnRole::End => RoleBucket::End,
            TurnRole::System | TurnRole::User | TurnRole::Tool => RoleBucket::User,
        }
    }
}

/// Role of a reduced message sent to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalRole {
    User,
    Assistant,
}

/// One merged message of the reduced conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMessage {
    pub bucket: RoleBucket,
    pub content: String,
}

impl CanonicalMessage {
    #[must_use]
    pub fn role(&self) -> CanonicalRole {
        match self.bucket {
            RoleBucket::Assistant => CanonicalRole::Assistant,
            RoleBucket::End | RoleBucket::User => CanonicalRole::User,
        }
    }
}

impl Serialize for CanonicalMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("CanonicalMessage", 2)?;
        state.serialize_field("role", &self.role())?;
        state.serialize_field("content", &self.content)?;
        state.end()
    }
}

/// Canonical decoded unit consumed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUnit {
    Content(String),
    /// Upstream error; either a JSON error envelope or plain text.
    ErrorNotice(String),
    /// Rate/limit notice without content.
    LimitNotice(String),
    End,
}

/// A tool the client declared in its request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Tool choice requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

/// Client request after wire decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub stream: bool,
    pub turns: Vec<ConversationTurn>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
}

impl ChatRequest {
    /// Whether the conversation ends with a tool result the model has not seen yet.
    #[must_use]
    pub fn ends_with_tool_result(&self) -> bool {
        self.turns.last().is_some_and(|turn| turn.role == TurnRole::Tool)
    }
}

/// Tool call recognised in model output, ready to report to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON object string.
    pub arguments: String,
}

/// Token usage reported with a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Why a relay invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Eof,
    Cancelled,
    Errored,
}

impl Termination {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Eof => "eof",
            Termination::Cancelled => "cancelled",
            Termination::Errored => "errored",
        }
    }
}

/// Terminal artifact of one relay invocation.
#[derive(Debug, Clone)]
pub struct RelayResult {
    pub content: String,
    pub usage: TokenUsage,
    pub terminated_by: Termination,
    /// The error that ended the relay when `terminated_by` is `Errored`.
    pub error: Option<RelayError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_bucket_mapping_is_total() {
        assert_eq!(RoleBucket::of(TurnRole::Assistant), RoleBucket::Assistant);
        assert_eq!(RoleBucket::of(TurnRole::End), RoleBucket::End);
        assert_eq!(RoleBucket::of(TurnRole::System), RoleBucket::User);
        assert_eq!(RoleBucket::of(TurnRole::Tool), RoleBucket::User);
        assert_eq!(RoleBucket::of(TurnRole::User), RoleBucket::User);
    }

    #[test]
    fn wire_roles_collapse_to_user() {
        assert_eq!(TurnRole::from_wire("function"), TurnRole::Tool);
        assert_eq!(TurnRole::from_wire("developer"), TurnRole::System);
        assert_eq!(TurnRole::from_wire("narrator"), TurnRole::User);
    }

    #[test]
    fn canonical_message_serializes_role() {
        let message = CanonicalMessage {
            bucket: RoleBucket::End,
            content: "x".to_string(),
        };
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json, serde_json::json!({"role": "user", "content": "x"}));
    }
}
