//! Client-side session and token-lifecycle management for the AgroData API.
//!
//! Layers, leaf first:
//! - [`auth::TokenStore`]: persisted credentials and expiry arithmetic
//! - [`api::HttpGateway`]: timeouts, retry with backoff, error classification
//! - [`auth::SessionManager`]: login/logout and the refresh lifecycle
//! - [`client::SessionClient`]: background re-validation and the
//!   `{is_authenticated, user}` view consumed by the presentation layer

pub mod api;
pub mod auth;
pub mod client;
pub mod config;

pub use api::{ApiError, HttpGateway, UserApi};
pub use auth::{SessionManager, TokenStore};
pub use client::{Access, AuthSnapshot, Navigator, SessionClient};
pub use config::{ApiConfig, Config};
