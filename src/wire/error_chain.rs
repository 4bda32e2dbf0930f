use serde::Deserialize;

use crate::error::RelayError;

/// Upper bound on cause links followed before giving up on a malformed chain.
pub const MAX_CHAIN_DEPTH: usize = 64;
const UNKNOWN_CODE: &str = "unknown";

/// Nested error envelope carried by error frames.
///
/// The useful text usually sits at the bottom of the `cause.wrapper` chain,
/// the outer `message` being a generic summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: Option<ErrorCause>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorCause {
    #[serde(default)]
    pub wrapper: Option<Box<ErrorEnvelope>>,
    #[serde(default)]
    pub leaf: ErrorLeaf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorLeaf {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    debug: ErrorDebug,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct ErrorDebug {
    #[serde(default)]
    wrapper: Option<Box<ErrorEnvelope>>,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            cause: None,
            details: Vec::new(),
        }
    }

    /// Attach `wrapper` as the next link of the cause chain.
    #[must_use]
    pub fn wrapping(mut self, wrapper: ErrorEnvelope) -> Self {
        self.cause.get_or_insert_with(ErrorCause::default).wrapper = Some(Box::new(wrapper));
        self
    }

    /// Set the leaf message of this envelope's cause.
    #[must_use]
    pub fn with_leaf(mut self, message: impl Into<String>) -> Self {
        self.cause.get_or_insert_with(ErrorCause::default).leaf = ErrorLeaf {
            message: message.into(),
        };
        self
    }

    /// Parse an error payload.
    ///
    /// Accepts the bare envelope as well as the backend's outer
    /// `{"error": {..., "details": [{"debug": {"wrapper": ...}}]}}` form, in
    /// which the first detail's wrapper starts the cause chain.
    #[must_use]
    pub fn from_json(payload: &str) -> Option<Self> {
        let mut value: serde_json::Value = serde_json::from_str(payload).ok()?;
        if value.get("error").is_some_and(serde_json::Value::is_object) {
            value = value["error"].take();
        }
        if !value.is_object() {
            return None;
        }

        let mut envelope: ErrorEnvelope = serde_json::from_value(value).ok()?;
        if envelope.cause.is_none() {
            let wrapper = envelope
                .details
                .first_mut()
                .and_then(|detail| detail.debug.wrapper.take());
            if wrapper.is_some() {
                envelope.cause = Some(ErrorCause {
                    wrapper,
                    leaf: ErrorLeaf::default(),
                });
            }
        }
        envelope.details.clear();
        Some(envelope)
    }

    /// Most specific human-readable message in the chain.
    ///
    /// Follows `cause.wrapper` links down to the innermost wrapper and
    /// returns its `cause.leaf.message`. Without any cause the envelope's own
    /// message is returned. The walk stops after [`MAX_CHAIN_DEPTH`] links and
    /// falls back to the last message seen.
    #[must_use]
    pub fn innermost_message(&self) -> &str {
        let mut node = self;
        let mut last_seen = self.message.as_str();

        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(cause) = node.cause.as_ref() else {
                return non_empty_or(&node.message, last_seen);
            };
            match cause.wrapper.as_deref() {
                Some(next) => {
                    last_seen = non_empty_or(&cause.leaf.message, last_seen);
                    last_seen = non_empty_or(&next.message, last_seen);
                    node = next;
                }
                None => {
                    let own = non_empty_or(&node.message, last_seen);
                    return non_empty_or(&cause.leaf.message, own);
                }
            }
        }

        tracing::warn!(
            depth = MAX_CHAIN_DEPTH,
            "error cause chain exceeds depth limit; using last seen message"
        );
        last_seen
    }

    #[must_use]
    pub fn code(&self) -> &str {
        non_empty_or(&self.code, UNKNOWN_CODE)
    }

    /// Presentation form: `[<code>] <message>`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("[{}] {}", self.code(), self.innermost_message())
    }

    #[must_use]
    pub fn into_relay_error(self) -> RelayError {
        RelayError::Upstream {
            code: self.code().to_string(),
            message: self.innermost_message().to_string(),
        }
    }
}

#[inline]
fn non_empty_or<'a>(candidate: &'a str, fallback: &'a str) -> &'a str {
    if candidate.is_empty() {
        fallback
    } else {
        candidate
    }
}

/// Turn the text of an error notice into an upstream error.
///
/// Structured envelopes are unwrapped; anything else is kept verbatim.
#[must_use]
pub fn describe_error_payload(payload: &str) -> RelayError {
    match ErrorEnvelope::from_json(payload) {
        Some(envelope) => envelope.into_relay_error(),
        None => RelayError::Upstream {
            code: UNKNOWN_CODE.to_string(),
            message: payload.trim().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_level_chain_resolves_to_innermost_leaf() {
        let innermost = ErrorEnvelope::new("", "wrapper three").with_leaf("model overloaded");
        let middle = ErrorEnvelope::new("", "wrapper two").wrapping(innermost);
        let outer = ErrorEnvelope::new("", "wrapper one").wrapping(middle);
        let envelope = ErrorEnvelope::new("unavailable", "request failed").wrapping(outer);

        assert_eq!(envelope.innermost_message(), "model overloaded");
        assert_eq!(envelope.describe(), "[unavailable] model overloaded");
    }

    #[test]
    fn envelope_without_cause_uses_own_message() {
        let envelope = ErrorEnvelope::new("CODE", "message");
        assert_eq!(envelope.describe(), "[CODE] message");
    }

    #[test]
    fn deep_chain_is_bounded() {
        let mut envelope = ErrorEnvelope::new("", "level 200").with_leaf("never reached");
        for level in (0..200).rev() {
            envelope = ErrorEnvelope::new("", format!("level {level}")).wrapping(envelope);
        }
        let envelope = ErrorEnvelope::new("deep", "top").wrapping(envelope);

        assert_eq!(envelope.innermost_message(), "level 63");
    }

    #[test]
    fn parses_backend_outer_error_shape() {
        let payload = r#"{
            "error": {
                "code": "resource_exhausted",
                "message": "generic failure",
                "details": [{
                    "type": "aiserver.v1.ErrorDetails",
                    "value": "",
                    "debug": {
                        "wrapper": {
                            "message": "outer wrapper",
                            "cause": {
                                "wrapper": {
                                    "message": "inner wrapper",
                                    "cause": {"leaf": {"message": "usage limit reached"}}
                                }
                            }
                        }
                    }
                }]
            }
        }"#;
        let envelope = ErrorEnvelope::from_json(payload).expect("envelope");
        assert_eq!(envelope.describe(), "[resource_exhausted] usage limit reached");
    }

    #[test]
    fn plain_text_notice_is_kept_verbatim() {
        let err = describe_error_payload("backend exploded ");
        assert_eq!(err.to_string(), "[unknown] backend exploded");
    }

    #[test]
    fn empty_code_is_presented_as_unknown() {
        let err = describe_error_payload(r#"{"message":"bad"}"#);
        assert_eq!(err.to_string(), "[unknown] bad");
    }
}
