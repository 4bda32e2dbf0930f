//! Tool side round-trip.
//!
//! Before the normal relay, the model is asked once, with tool instructions,
//! whether it wants to call a tool. A complete directive in that answer is
//! reported to the client instead of the normal response.

use tracing::{debug, info, warn};

use super::detector::directive_settled;
use super::parser::parse_tool_calls;
use super::prompt::{build_lead_in, build_tool_prompt, get_trigger_signal};
use crate::config::{BackendConfig, FeaturesConfig};
use crate::error::RelayError;
use crate::history::CompactedHistory;
use crate::observability::token_counter::estimate_tokens;
use crate::protocol::canonical::{
    CanonicalMessage, ChatRequest, DetectedToolCall, RoleBucket, TokenUsage, ToolChoice,
};
use crate::stream::{MatcherPipeline, RelaySink, SinkClosed, StreamRelay};
use crate::transport::{BackendRequest, BackendTransport};
use crate::util::next_call_id;

/// Receives the outcome of a handled side round-trip.
pub trait ToolCallReporter: Send {
    fn report_tool_calls(&mut self, calls: Vec<DetectedToolCall>, usage: TokenUsage);

    fn report_error(&mut self, err: &RelayError);
}

/// Ask the model whether it wants to call a declared tool.
///
/// Returns `true` when the request was answered through `reporter`, either
/// with detected tool calls or with an error, and the normal response must be
/// skipped.
pub async fn maybe_handle_tool<T, R>(
    request: &ChatRequest,
    history: &CompactedHistory,
    backend: Option<&BackendConfig>,
    features: &FeaturesConfig,
    transport: &T,
    reporter: &mut R,
) -> bool
where
    T: BackendTransport,
    R: ToolCallReporter,
{
    if !features.enable_tool_calls
        || request.tools.is_empty()
        || request.tool_choice == ToolChoice::None
        || request.ends_with_tool_result()
    {
        return false;
    }

    let tool_prompt = match build_tool_prompt(
        &request.tools,
        &request.tool_choice,
        features.tool_prompt_template.as_deref(),
    ) {
        Ok(prompt) => prompt,
        Err(err) => {
            reporter.report_error(&err);
            return true;
        }
    };
    let lead_in = build_lead_in(&tool_prompt, history);

    if features.echo {
        info!(model = %request.model, lead_in = %lead_in, "echo mode, skipping tool round-trip");
        return false;
    }
    let Some(backend) = backend else {
        reporter.report_error(&no_backend_for(&request.model));
        return true;
    };

    let side_request = BackendRequest {
        model: request.model.clone(),
        messages: vec![CanonicalMessage {
            bucket: RoleBucket::User,
            content: lead_in.clone(),
        }],
        prompt: lead_in,
        stream: false,
    };
    let prompt_tokens = estimate_tokens(&side_request.prompt);
    let mut units = match transport.open(backend, side_request).await {
        Ok(units) => units,
        Err(err) => {
            warn!(model = %request.model, error = %err, "tool round-trip failed to open");
            reporter.report_error(&err);
            return true;
        }
    };

    let trigger = get_trigger_signal();
    let relay = StreamRelay::new(request.model.as_str(), false, prompt_tokens)
        .with_early_stop(Box::new(move |text: &str| directive_settled(text, trigger)));
    let mut sink = SideTripSink { reporter };
    let result = relay
        .run(&mut units, None, &mut MatcherPipeline::new(), &mut sink)
        .await;
    if result.error.is_some() {
        return true;
    }

    match parse_tool_calls(&result.content, trigger, &request.tools) {
        Ok(calls) => {
            let detected: Vec<DetectedToolCall> = calls
                .into_iter()
                .map(|call| DetectedToolCall {
                    id: next_call_id(),
                    name: call.name,
                    arguments: serde_json::Value::Object(call.arguments).to_string(),
                })
                .collect();
            info!(
                model = %request.model,
                calls = detected.len(),
                termination = result.terminated_by.as_str(),
                "tool calls detected"
            );
            sink.reporter.report_tool_calls(detected, result.usage);
            true
        }
        Err(err) => {
            debug!(model = %request.model, reason = %err, "no tool call, relaying normally");
            false
        }
    }
}

/// Error for a model no configured backend serves.
#[must_use]
pub fn no_backend_for(model: &str) -> RelayError {
    RelayError::InvalidRequest(format!("no backend configured for model '{model}'"))
}

/// Sink for the buffered side round-trip: only errors reach the client.
struct SideTripSink<'a, R> {
    reporter: &'a mut R,
}

impl<R: ToolCallReporter> RelaySink for SideTripSink<'_, R> {
    fn is_committed(&self) -> bool {
        false
    }

    fn emit_delta(&mut self, _text: &str) -> Result<(), SinkClosed> {
        Ok(())
    }

    fn emit_finish(&mut self, _usage: TokenUsage) {}

    fn emit_body(&mut self, _content: &str, _usage: TokenUsage) {}

    fn emit_error(&mut self, err: &RelayError) {
        self.reporter.report_error(err);
    }
}
