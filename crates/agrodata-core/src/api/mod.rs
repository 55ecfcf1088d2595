//! HTTP gateway module for the AgroData REST API.
//!
//! This module provides the `HttpGateway` through which every request is
//! sent, the `ApiError` taxonomy it produces, the retry policy, endpoint
//! paths, and the protected user-profile endpoints.
//!
//! Protected calls carry a JWT bearer token obtained from `/Auth/login` and
//! kept fresh through the session manager.

pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod user;

pub use error::ApiError;
pub use gateway::{CredentialProvider, HttpGateway, RequestSpec};
pub use retry::RetryPolicy;
pub use user::UserApi;
