//! Conversation compaction for backends that take a reduced history.
//!
//! Adjacent turns of the same [`RoleBucket`] are merged into one message, so
//! the result alternates between buckets. Short conversations that end with
//! user input hand that input back separately as the standalone prompt.

use crate::observability::token_counter::estimate_tokens;
use crate::protocol::canonical::{CanonicalMessage, ConversationTurn, RoleBucket, TurnRole};

/// Marker put in front of every merged user-bucket message.
pub const USER_PREFIX: &str = "Human： ";
/// Prompt sent when no standalone user prompt could be extracted.
pub const CONTINUE_PROMPT: &str = "continue";
/// Below this many estimated tokens a trailing user message is sent standalone.
pub const STANDALONE_TOKEN_THRESHOLD: u64 = 32_000;

/// Reduced conversation ready for a backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedHistory {
    pub messages: Vec<CanonicalMessage>,
    pub trailing_prompt: String,
    /// Sum of per-turn estimates over the original turns.
    pub prompt_tokens: u64,
    /// Whether the conversation stayed under [`STANDALONE_TOKEN_THRESHOLD`].
    pub standalone: bool,
}

/// One question/answer pair of the reduced history.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Merge adjacent same-bucket turns and extract the trailing prompt.
#[must_use]
pub fn compact(turns: &[ConversationTurn]) -> CompactedHistory {
    let mut messages: Vec<CanonicalMessage> = Vec::new();
    let mut prompt_tokens = 0u64;

    for turn in turns {
        prompt_tokens += estimate_tokens(&turn.content);
        let bucket = RoleBucket::of(turn.role);

        let starts_new = messages.last().is_none_or(|last| last.bucket != bucket);
        if starts_new {
            let content = if bucket == RoleBucket::User {
                USER_PREFIX.to_string()
            } else {
                String::new()
            };
            messages.push(CanonicalMessage { bucket, content });
        }
        if let Some(current) = messages.last_mut() {
            append_turn(&mut current.content, turn);
        }
    }

    let standalone = prompt_tokens < STANDALONE_TOKEN_THRESHOLD;
    let mut trailing_prompt = CONTINUE_PROMPT.to_string();
    if standalone && messages.last().is_some_and(|last| last.bucket == RoleBucket::User) {
        if let Some(last) = messages.pop() {
            let text = last.content.trim();
            trailing_prompt = text
                .strip_prefix(USER_PREFIX.trim_end())
                .unwrap_or(text)
                .trim_start()
                .to_string();
        }
    }

    CompactedHistory {
        messages,
        trailing_prompt,
        prompt_tokens,
        standalone,
    }
}

fn append_turn(buffer: &mut String, turn: &ConversationTurn) {
    if turn.role == TurnRole::Tool {
        let name = turn.name.as_deref().unwrap_or("unknown");
        buffer.push_str("这是内置工具的返回结果 / This is the result of the built-in tool: (");
        buffer.push_str(name);
        buffer.push_str(")\n\n##\n");
        buffer.push_str(&turn.content);
        buffer.push_str("\n##");
    } else {
        buffer.push_str(&turn.content);
    }
}

impl CompactedHistory {
    /// Pair the reduced messages into question/answer exchanges.
    ///
    /// Every message is placed: a user message without a following
    /// assistant reply gets an empty answer, and an assistant message
    /// without a preceding question gets an empty question.
    #[must_use]
    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut out = Vec::with_capacity(self.messages.len().div_ceil(2));
        let mut pending: Option<Exchange> = None;

        for message in &self.messages {
            match message.bucket {
                RoleBucket::Assistant => {
                    let mut exchange = pending.take().unwrap_or_default();
                    exchange.answer = message.content.clone();
                    out.push(exchange);
                }
                RoleBucket::User | RoleBucket::End => {
                    if let Some(open) = pending.take() {
                        out.push(open);
                    }
                    pending = Some(Exchange {
                        question: message.content.clone(),
                        answer: String::new(),
                    });
                }
            }
        }
        out.extend(pending);
        out
    }

    /// Plain-text transcript of the reduced messages, one block per message.
    #[must_use]
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            match message.bucket {
                RoleBucket::Assistant => {
                    out.push_str("Assistant： ");
                    out.push_str(&message.content);
                }
                RoleBucket::User | RoleBucket::End => out.push_str(&message.content),
            }
        }
        out
    }
}
