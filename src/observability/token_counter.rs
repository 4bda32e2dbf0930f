use crate::protocol::canonical::RelayResult;
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Log token usage for a finished relay at INFO level.
pub fn log_relay_usage(model: &str, result: &RelayResult, duration: Duration) {
    info!(
        model = model,
        prompt_tokens = result.usage.prompt_tokens,
        completion_tokens = result.usage.completion_tokens,
        total_tokens = result.usage.total_tokens,
        termination = result.terminated_by.as_str(),
        duration_seconds = duration.as_secs_f64(),
        "relay completed"
    );
}
