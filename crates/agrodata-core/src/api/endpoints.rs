//! Endpoint paths, relative to the configured base URL.

pub const LOGIN: &str = "/Auth/login";
pub const LOGOUT: &str = "/Auth/logout";
pub const REGISTER: &str = "/Auth/register";
pub const REFRESH_TOKEN: &str = "/Auth/refresh-token";
pub const FORGOT_PASSWORD: &str = "/Auth/forgot-password";
pub const RESET_PASSWORD: &str = "/Auth/reset-password";

pub const USER_PROFILE: &str = "/User/profile";
pub const CHANGE_PASSWORD: &str = "/User/change-password";

/// Endpoints that must never trigger the pre-flight credential check or the
/// 401 refresh-and-replay path, or a refresh would recurse into itself.
pub const AUTH_ENDPOINTS: [&str; 6] = [
    LOGIN,
    LOGOUT,
    REGISTER,
    REFRESH_TOKEN,
    FORGOT_PASSWORD,
    RESET_PASSWORD,
];

/// Whether `endpoint` (optionally carrying a query string) is an auth endpoint.
pub fn is_auth_endpoint(endpoint: &str) -> bool {
    let path = endpoint.split(['?', '#']).next().unwrap_or(endpoint);
    let path = path.trim_end_matches('/');
    AUTH_ENDPOINTS
        .iter()
        .any(|auth| path.eq_ignore_ascii_case(auth))
}
