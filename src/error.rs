use crate::wire::DecodeError;

/// Error type shared by the relay core and the gateway around it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("[{code}] {message}")]
    Upstream { code: String, message: String },
    #[error("Backend error: status={status}, message={message}")]
    Backend { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Tool call error: {0}")]
    ToolCall(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    BadGateway,
    ServerError,
}

/// Map a backend HTTP status code to an error category.
#[must_use]
pub fn category_from_backend_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        _ => ErrorCategory::BadGateway,
    }
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::Decode(_) | RelayError::Transport(_) => ErrorCategory::BadGateway,
            RelayError::Backend { status, .. } => category_from_backend_status(*status),
            RelayError::Config(_)
            | RelayError::Upstream { .. }
            | RelayError::ToolCall(_)
            | RelayError::Internal(_) => ErrorCategory::ServerError,
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::BadGateway => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn openai_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::BadGateway => "upstream_error",
        ErrorCategory::ServerError => "server_error",
    }
}

/// Format an error as `(status_code, OpenAI-shaped JSON body)`.
#[must_use]
pub fn format_error(err: &RelayError) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let body = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": openai_error_type(cat),
            "code": http_status_for_category(cat).as_u16(),
        }
    });
    (http_status_for_category(cat), body)
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_displays_code_and_message() {
        let err = RelayError::Upstream {
            code: "resource_exhausted".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "[resource_exhausted] quota exceeded");
        assert_eq!(err.category(), ErrorCategory::ServerError);
    }

    #[test]
    fn decode_errors_are_bad_gateway() {
        let err = RelayError::from(DecodeError::Truncated {
            expected: 10,
            available: 3,
        });
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[test]
    fn backend_status_maps_to_category() {
        assert_eq!(category_from_backend_status(429), ErrorCategory::RateLimit);
        assert_eq!(category_from_backend_status(401), ErrorCategory::Authentication);
        assert_eq!(category_from_backend_status(503), ErrorCategory::BadGateway);
    }
}
