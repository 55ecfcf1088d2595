use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiError;

/// Minimum password length accepted by registration.
const MIN_PASSWORD_LENGTH: usize = 6;

/// The authenticated session as persisted by the token store.
///
/// `user` is the last profile snapshot the server sent; it is advisory and
/// never re-validated on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Option<Value>,
}

/// Position in the session lifecycle.
///
/// ```text
/// Anonymous ──login──→ Authenticating ──→ Authenticated ──expiry──→ Refreshing
///     ▲                      │                 │                      │
///     └──────── failure ─────┘                 │                ok ───┘ (Authenticated)
///     └──────────────────── logout ────────────┘              failure → Anonymous
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Outcome of a successful `ensure_valid_token` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// No access token is stored; the caller decides what that means.
    Missing,
    /// The stored token is usable as-is (or cannot be renewed).
    Valid,
    /// The token was near expiry and has been exchanged for a new one.
    Refreshed,
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmailRequest<'a> {
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResetPasswordRequest<'a> {
    pub token: &'a str,
    pub password: &'a str,
}

/// Body of a successful login or refresh-token exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `token` in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub user: Option<Value>,
}

/// Registration acknowledgement. Registration never logs the user in, so
/// a token here is informational only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Sign-up payload, validated before it ever reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    #[serde(rename = "nombre")]
    pub name: String,
    pub email: String,
    pub password: String,
}

impl Registration {
    pub fn new(
        name: &str,
        email: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<Self, ApiError> {
        let name = name.trim();
        let email = email.trim();

        if name.is_empty() {
            return Err(ApiError::InvalidRequest("Name is required".to_string()));
        }
        if email.is_empty() {
            return Err(ApiError::InvalidRequest("Email is required".to_string()));
        }
        if password.is_empty() {
            return Err(ApiError::InvalidRequest("Password is required".to_string()));
        }
        if password != confirm_password {
            return Err(ApiError::InvalidRequest("Passwords do not match".to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ApiError::InvalidRequest(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }

        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        })
    }
}
