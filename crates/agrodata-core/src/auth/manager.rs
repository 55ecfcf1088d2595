//! The session manager: owns the token lifecycle.
//!
//! It is the only writer of the [`TokenStore`] and is responsible for:
//! - Logging in and persisting the issued credentials
//! - Logging out (best-effort server notification, unconditional local clear)
//! - Exchanging the refresh token for a new access token
//! - Deciding whether the stored credential is still usable
//!
//! # Single-flight refresh
//!
//! Any number of tasks may discover an expired token at the same moment.
//! The first one stores a shared handle to the pending exchange; every other
//! caller clones that handle instead of starting its own, so exactly one
//! refresh request reaches the server and all callers observe its result.
//! The handle is stored under the same lock that checked for it, so there is
//! no window in which a second exchange can start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::api::{endpoints, ApiError, CredentialProvider, HttpGateway};

use super::session::{EmailRequest, LoginRequest, RefreshRequest, ResetPasswordRequest};
use super::{RegisterResponse, Session, SessionState, TokenResponse, TokenStatus, TokenStore};

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, ApiError>>>;

struct InFlightRefresh {
    id: u64,
    future: RefreshFuture,
}

/// Session manager.
/// Clone is cheap; clones share the store, the gateway's connection pool
/// and the in-flight refresh.
#[derive(Clone)]
pub struct SessionManager {
    gateway: HttpGateway,
    store: TokenStore,
    state: Arc<Mutex<SessionState>>,
    in_flight: Arc<Mutex<Option<InFlightRefresh>>>,
    next_refresh_id: Arc<AtomicU64>,
}

impl SessionManager {
    /// `gateway` should be a plain gateway (no credential provider); auth
    /// calls never go through the refresh machinery.
    pub fn new(gateway: HttpGateway) -> Self {
        let store = gateway.store().clone();
        let initial = if store.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };

        Self {
            gateway,
            store,
            state: Arc::new(Mutex::new(initial)),
            in_flight: Arc::new(Mutex::new(None)),
            next_refresh_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A gateway for protected calls, sharing this manager's connection pool
    /// and refreshing through it.
    pub fn protected_gateway(&self) -> HttpGateway {
        self.gateway.with_credentials(Arc::new(self.clone()))
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Session state change");
            *current = state;
        }
    }

    // ===== Introspection =====

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn current_user(&self) -> Option<Value> {
        self.store.user()
    }

    pub fn token(&self) -> Option<String> {
        self.store.access_token()
    }

    pub fn refresh_token_value(&self) -> Option<String> {
        self.store.refresh_token()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.store.has_refresh_token()
    }

    pub fn session(&self) -> Option<Session> {
        self.store.session()
    }

    /// Drop every stored credential without talking to the server.
    pub fn clear_auth_data(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        self.set_state(SessionState::Anonymous);
    }

    // ===== Operations =====

    /// Authenticate and persist the issued credentials.
    ///
    /// Bad credentials come back as `ApiError::Http` with the server's status
    /// and message; nothing is stored in that case.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let previous = self.state();
        self.set_state(SessionState::Authenticating);

        let request = LoginRequest {
            email: email.trim(),
            password,
        };
        let response = match self
            .gateway
            .post::<TokenResponse, _>(endpoints::LOGIN, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                info!(status = ?e.status(), error = %e, "Login failed");
                self.set_state(previous);
                return Err(e);
            }
        };

        let session = match self.persist(&response, true) {
            Ok(session) => session,
            Err(e) => {
                self.clear_auth_data();
                return Err(e);
            }
        };
        self.set_state(SessionState::Authenticated);
        info!(email = %request.email, "Logged in");
        Ok(session)
    }

    /// Notify the server, then clear local credentials no matter what.
    pub async fn logout(&self) -> Result<(), ApiError> {
        if let Err(e) = self
            .gateway
            .post::<Value, _>(endpoints::LOGOUT, &serde_json::json!({}))
            .await
        {
            warn!(error = %e, "Logout request failed, clearing local session anyway");
        }
        self.clear_auth_data();
        info!("Logged out");
        Ok(())
    }

    /// Create an account. Registration does not log the user in.
    pub async fn register<B: Serialize + ?Sized>(
        &self,
        user_data: &B,
    ) -> Result<RegisterResponse, ApiError> {
        self.gateway.post(endpoints::REGISTER, user_data).await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<Value, ApiError> {
        let request = EmailRequest {
            email: email.trim(),
        };
        self.gateway.post(endpoints::FORGOT_PASSWORD, &request).await
    }

    pub async fn reset_password(&self, token: &str, password: &str) -> Result<Value, ApiError> {
        let request = ResetPasswordRequest { token, password };
        self.gateway.post(endpoints::RESET_PASSWORD, &request).await
    }

    /// Exchange the refresh token for new credentials.
    ///
    /// Concurrent callers share one exchange. On any failure the local
    /// session is cleared and `ApiError::SessionExpired` is returned, so a
    /// bad refresh token is never retried.
    pub async fn refresh_token(&self) -> Result<Session, ApiError> {
        self.refresh_replacing(None).await
    }

    /// Single-flight refresh on behalf of a caller that judged `stale_token`
    /// unusable. If no exchange is in flight and the stored token is no
    /// longer `stale_token`, another caller's exchange already finished and
    /// its session is returned without a new one.
    async fn refresh_replacing(&self, stale_token: Option<&str>) -> Result<Session, ApiError> {
        let (id, future) = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(pending) => {
                    debug!(refresh_id = pending.id, "Joining in-flight token refresh");
                    (pending.id, pending.future.clone())
                }
                None => {
                    if let Some(stale) = stale_token {
                        let current = self.store.access_token();
                        if current.is_some() && current.as_deref() != Some(stale) {
                            if let Some(session) = self.store.session() {
                                debug!("Credential already replaced by another refresh");
                                return Ok(session);
                            }
                        }
                    }

                    let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let manager = self.clone();
                    let future = async move { manager.exchange_refresh_token().await }
                        .boxed()
                        .shared();
                    *slot = Some(InFlightRefresh {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|pending| pending.id == id) {
            *slot = None;
        }
        result
    }

    /// Refresh only when the token is near expiry and can be renewed.
    ///
    /// Makes no network call when there is no token, the token is not
    /// within the skew margin, or there is no refresh token.
    pub async fn ensure_valid_token(&self) -> Result<TokenStatus, ApiError> {
        let token = match self.store.access_token() {
            Some(token) => token,
            None => return Ok(TokenStatus::Missing),
        };

        if self.store.is_expired() && self.store.has_refresh_token() {
            debug!("Token expired or about to expire, refreshing");
            self.refresh_replacing(Some(&token)).await?;
            return Ok(TokenStatus::Refreshed);
        }

        Ok(TokenStatus::Valid)
    }

    async fn exchange_refresh_token(&self) -> Result<Session, ApiError> {
        self.set_state(SessionState::Refreshing);

        let result = match self.store.refresh_token() {
            Some(refresh_token) => {
                let request = RefreshRequest {
                    refresh_token: &refresh_token,
                };
                match self
                    .gateway
                    .post::<TokenResponse, _>(endpoints::REFRESH_TOKEN, &request)
                    .await
                {
                    Ok(response) => self.persist(&response, false),
                    Err(e) => Err(e),
                }
            }
            None => Err(ApiError::SessionExpired(
                "No refresh token available".to_string(),
            )),
        };

        match result {
            Ok(session) => {
                self.set_state(SessionState::Authenticated);
                info!("Access token refreshed");
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Token refresh failed, ending session");
                self.clear_auth_data();
                Err(match e {
                    ApiError::SessionExpired(reason) => ApiError::SessionExpired(reason),
                    other => ApiError::SessionExpired(other.to_string()),
                })
            }
        }
    }

    /// Write the credentials from a login or refresh response.
    ///
    /// Order is token, user, refresh token, expiry. A login replaces all
    /// four fields; a refresh keeps the stored user and refresh token unless
    /// the server sent new ones.
    fn persist(&self, response: &TokenResponse, replace_all: bool) -> Result<Session, ApiError> {
        let storage = |e: anyhow::Error| ApiError::Storage(format!("{:#}", e));
        // A zero or negative lifetime means the server set no expiry.
        let expires_at = response
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| self.store.expiry_from_now(secs));

        self.store.set_access_token(&response.token).map_err(storage)?;

        if replace_all {
            let user = response.user.clone().unwrap_or_else(|| Value::Object(Default::default()));
            self.store.set_user(Some(&user)).map_err(storage)?;
            self.store
                .set_refresh_token(response.refresh_token.as_deref())
                .map_err(storage)?;
            self.store.set_expires_at(expires_at).map_err(storage)?;
        } else {
            if let Some(ref user) = response.user {
                self.store.set_user(Some(user)).map_err(storage)?;
            }
            if let Some(ref refresh_token) = response.refresh_token {
                self.store
                    .set_refresh_token(Some(refresh_token))
                    .map_err(storage)?;
            }
            // The old expiry belongs to the old token.
            self.store.set_expires_at(expires_at).map_err(storage)?;
        }

        self.store
            .session()
            .ok_or_else(|| ApiError::Storage("access token was not persisted".to_string()))
    }
}

#[async_trait]
impl CredentialProvider for SessionManager {
    async fn ensure_valid_token(&self) -> Result<bool, ApiError> {
        match SessionManager::ensure_valid_token(self).await? {
            TokenStatus::Missing => Err(ApiError::NotAuthenticated),
            TokenStatus::Valid => Ok(false),
            TokenStatus::Refreshed => Ok(true),
        }
    }

    async fn refresh_after_unauthorized(
        &self,
        rejected_token: Option<&str>,
    ) -> Result<(), ApiError> {
        self.refresh_replacing(rejected_token).await.map(|_| ())
    }

    async fn expire_session(&self) {
        self.clear_auth_data();
    }
}
