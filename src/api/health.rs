use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(state: &AppState) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "chatwire-relay is running",
        "config": {
            "backends_count": config.backends.len(),
            "features": {
                "enable_tool_calls": config.features.enable_tool_calls,
                "echo": config.features.echo,
                "log_level": config.features.log_level,
                "rewrite_rules_count": config.features.rewrite_rules.len(),
                "strip_markers_count": config.features.strip_markers.len(),
            }
        }
    }))
}
