//! Consumer-facing session view.
//!
//! `SessionClient` is what the presentation layer holds. It publishes an
//! [`AuthSnapshot`] (`is_loading`, `is_authenticated`, `user`) through a
//! watch channel, re-validates the session in the background, and sends the
//! user to the login surface when the session cannot be recovered.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::auth::{RegisterResponse, Session, SessionManager, TokenStatus};

/// Navigation side effect used when the session ends.
pub trait Navigator: Send + Sync {
    /// Show the login surface, replacing the current history entry rather
    /// than pushing a new one.
    fn replace_with_login(&self);
}

impl<F> Navigator for F
where
    F: Fn() + Send + Sync,
{
    fn replace_with_login(&self) {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthSnapshot {
    /// While true nothing conclusive should be rendered.
    pub is_loading: bool,
    pub is_authenticated: bool,
    pub user: Option<Value>,
}

impl AuthSnapshot {
    fn loading() -> Self {
        Self {
            is_loading: true,
            is_authenticated: false,
            user: None,
        }
    }

    fn anonymous() -> Self {
        Self {
            is_loading: false,
            is_authenticated: false,
            user: None,
        }
    }

    fn authenticated(user: Option<Value>) -> Self {
        Self {
            is_loading: false,
            is_authenticated: true,
            user,
        }
    }
}

/// Outcome of guarding a protected surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Initial check still running.
    Pending,
    /// Not authenticated; the caller should redirect to login.
    Denied,
    Granted,
}

struct Inner {
    manager: SessionManager,
    navigator: Arc<dyn Navigator>,
    state: watch::Sender<AuthSnapshot>,
}

impl Inner {
    fn publish(&self, snapshot: AuthSnapshot) {
        self.state.send_replace(snapshot);
    }

    /// Resolve `{is_authenticated, user}` from the stored session.
    async fn check_auth_status(&self) {
        if !self.manager.is_authenticated() {
            self.publish(AuthSnapshot::anonymous());
            return;
        }

        match self.manager.ensure_valid_token().await {
            Ok(TokenStatus::Valid | TokenStatus::Refreshed) => {
                self.publish(AuthSnapshot::authenticated(self.manager.current_user()));
            }
            Ok(TokenStatus::Missing) => self.publish(AuthSnapshot::anonymous()),
            Err(e) if e.should_redirect_to_login() => self.handle_token_expiration(),
            Err(e) => {
                warn!(error = %e, "Session check failed");
                self.publish(AuthSnapshot::anonymous());
            }
        }
    }

    /// Periodic check. Only a session that can no longer be used changes
    /// what the consumer sees.
    async fn revalidate(&self) {
        if !self.manager.is_authenticated() {
            if self.state.borrow().is_authenticated {
                debug!("Session was cleared elsewhere");
                self.handle_token_expiration();
            }
            return;
        }

        match self.manager.ensure_valid_token().await {
            Ok(TokenStatus::Refreshed) => {
                self.publish(AuthSnapshot::authenticated(self.manager.current_user()));
            }
            Ok(_) => {}
            Err(e) if e.should_redirect_to_login() => self.handle_token_expiration(),
            Err(e) => warn!(error = %e, "Token validity check failed"),
        }
    }

    fn handle_token_expiration(&self) {
        info!("Session expired, redirecting to login");
        self.publish(AuthSnapshot::anonymous());
        self.manager.clear_auth_data();
        self.navigator.replace_with_login();
    }
}

/// Session view plus background re-validation.
///
/// Dropping the client stops the background task.
pub struct SessionClient {
    inner: Arc<Inner>,
    revalidation: JoinHandle<()>,
}

impl SessionClient {
    /// Start the client: the initial check and the periodic re-validation
    /// run on a spawned task, so this must be called inside a Tokio runtime.
    /// The snapshot reads as loading until the initial check finishes.
    pub fn mount(
        manager: SessionManager,
        navigator: Arc<dyn Navigator>,
        revalidate_every: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::loading());
        let inner = Arc::new(Inner {
            manager,
            navigator,
            state,
        });

        let period = revalidate_every.max(Duration::from_millis(1));
        let task = Arc::clone(&inner);
        let revalidation = tokio::spawn(async move {
            task.check_auth_status().await;

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                task.revalidate().await;
            }
        });

        Self {
            inner,
            revalidation,
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.inner.manager
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<Value> {
        self.inner.state.borrow().user.clone()
    }

    /// Wait for the initial check to finish.
    pub async fn ready(&self) -> AuthSnapshot {
        let mut rx = self.inner.state.subscribe();
        let snapshot = match rx.wait_for(|s| !s.is_loading).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        snapshot
    }

    /// Access decision for a protected surface.
    pub fn guard(&self) -> Access {
        let state = self.inner.state.borrow();
        if state.is_loading {
            Access::Pending
        } else if state.is_authenticated {
            Access::Granted
        } else {
            Access::Denied
        }
    }

    /// Re-run the mount-time check on demand.
    pub async fn check_auth_status(&self) -> AuthSnapshot {
        self.inner.check_auth_status().await;
        self.snapshot()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let session = self.inner.manager.login(email, password).await?;
        self.inner
            .publish(AuthSnapshot::authenticated(session.user.clone()));
        Ok(session)
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.inner.manager.logout().await?;
        self.inner.publish(AuthSnapshot::anonymous());
        self.inner.navigator.replace_with_login();
        Ok(())
    }

    pub async fn register<B: Serialize + ?Sized>(
        &self,
        user_data: &B,
    ) -> Result<RegisterResponse, ApiError> {
        self.inner.manager.register(user_data).await
    }

    pub async fn refresh_token(&self) -> Result<Session, ApiError> {
        match self.inner.manager.refresh_token().await {
            Ok(session) => {
                self.inner
                    .publish(AuthSnapshot::authenticated(session.user.clone()));
                Ok(session)
            }
            Err(e) => {
                if e.should_redirect_to_login() {
                    self.inner.handle_token_expiration();
                }
                Err(e)
            }
        }
    }

    /// Tear down the session and redirect to login.
    pub fn handle_token_expiration(&self) {
        self.inner.handle_token_expiration();
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.revalidation.abort();
    }
}
