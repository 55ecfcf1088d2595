//! Authentication module for managing the session and its credentials.
//!
//! This module provides:
//! - `TokenStore`: keyed persistence for the access token, refresh token,
//!   absolute expiry and user profile, over a pluggable backend
//! - `KeyringStore`: OS-keychain backend for the token store
//! - `SessionManager`: login/logout/registration and the token refresh
//!   lifecycle, including the single-flight refresh guard
//!
//! Tokens are considered expired five minutes before their real expiry.

pub mod credentials;
pub mod manager;
pub mod session;
pub mod store;

pub use credentials::KeyringStore;
pub use manager::SessionManager;
pub use session::{
    RegisterResponse, Registration, Session, SessionState, TokenResponse, TokenStatus,
};
pub use store::{
    Clock, FileStore, KeyValueStore, ManualClock, MemoryStore, SystemClock, TokenStore,
    EXPIRY_SKEW_MS,
};
