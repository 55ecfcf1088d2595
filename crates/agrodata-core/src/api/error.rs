use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy for every call that goes through the gateway.
///
/// Clone is required because a single refresh result is shared by every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Transport failure before any response arrived.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// 2xx response that was not JSON (or not the JSON we expected).
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{message} (status {status})")]
    Http {
        status: u16,
        message: String,
        details: Option<Value>,
    },

    /// A refresh was attempted and failed; local credentials are gone.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Protected call attempted with no access token at all.
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Statuses worth another attempt: rate limiting and transient server faults.
const RETRYABLE_STATUSES: [u16; 4] = [429, 500, 502, 503];

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build an `Http` error from a non-2xx response.
    ///
    /// A server-supplied `message` field wins; otherwise the static table
    /// provides one. `details` carries the parsed JSON body when there is
    /// one, or the (truncated) raw text.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let server_message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string);

        let details = match parsed {
            Some(json) => Some(json),
            None if body.trim().is_empty() => None,
            None => Some(Value::String(Self::truncate_body(body))),
        };

        ApiError::Http {
            status,
            message: server_message.unwrap_or_else(|| default_message(status).to_string()),
            details,
        }
    }

    /// HTTP status associated with this failure, if any.
    /// Session expiry reports as 401.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::SessionExpired(_) | ApiError::NotAuthenticated => Some(401),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }

    /// Transient failures: network, timeout, and the retryable statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }

    /// Whether the presentation layer must send the user back to login.
    pub fn should_redirect_to_login(&self) -> bool {
        matches!(self, ApiError::SessionExpired(_) | ApiError::NotAuthenticated)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            ApiError::InvalidRequest(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Fallback message for a status the server did not describe.
pub fn default_message(status: u16) -> &'static str {
    match status {
        400 => "Invalid input data",
        401 => "Invalid credentials",
        403 => "Access denied",
        404 => "Resource not found",
        409 => "Conflict with the current state",
        422 => "Unprocessable data",
        429 => "Too many attempts, try again later",
        500 => "Internal server error",
        502 => "Bad gateway",
        503 => "Service unavailable",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_preferred() {
        let err = ApiError::from_status(400, r#"{"message":"Email already registered","code":7}"#);
        match err {
            ApiError::Http { status, message, details } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Email already registered");
                assert_eq!(details.unwrap()["code"], 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_table_fallback() {
        let err = ApiError::from_status(503, "<html>upstream down</html>");
        assert_eq!(err.to_string(), "Service unavailable (status 503)");
        let err = ApiError::from_status(418, "");
        assert!(matches!(err, ApiError::Http { ref message, details: None, .. } if message == "Unknown error"));
        // blank server message falls through to the table
        let err = ApiError::from_status(404, r#"{"message":"  "}"#);
        assert!(matches!(err, ApiError::Http { ref message, .. } if message == "Resource not found"));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated, 520 total bytes"));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }

    #[test]
    fn test_retryable_classification() {
        for status in [429, 500, 502, 503] {
            assert!(ApiError::from_status(status, "").is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 422, 504] {
            assert!(!ApiError::from_status(status, "").is_retryable(), "{status}");
        }
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(!ApiError::InvalidResponse("html".into()).is_retryable());
        assert!(!ApiError::SessionExpired("gone".into()).is_retryable());
    }

    #[test]
    fn test_redirect_flag() {
        assert!(ApiError::SessionExpired("refresh rejected".into()).should_redirect_to_login());
        assert!(ApiError::NotAuthenticated.should_redirect_to_login());
        assert!(!ApiError::from_status(401, "").should_redirect_to_login());
        assert_eq!(ApiError::SessionExpired(String::new()).status(), Some(401));
        assert_eq!(ApiError::Network("x".into()).status(), None);
    }
}
