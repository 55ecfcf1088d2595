//! Fake AgroData API for integration tests, served by axum on an ephemeral port.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agrodata_core::auth::{ManualClock, MemoryStore, SessionManager, TokenStore};
use agrodata_core::{ApiConfig, HttpGateway};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

pub const EMAIL: &str = "farmer@agro.io";
pub const PASSWORD: &str = "correct-horse";
pub const GOOD_REFRESH: &str = "r-good";

#[derive(Default)]
pub struct Counters {
    pub login: AtomicUsize,
    pub logout: AtomicUsize,
    pub refresh: AtomicUsize,
    pub register: AtomicUsize,
    pub profile: AtomicUsize,
    pub flaky: AtomicUsize,
    pub html: AtomicUsize,
    pub revoked: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ServerState {
    pub counters: Counters,
    /// The only access token protected endpoints accept.
    pub current_token: Mutex<String>,
    pub issued: AtomicUsize,
    pub refresh_delay: Mutex<Duration>,
    pub logout_status: Mutex<StatusCode>,
    /// Statuses `/Flaky` answers with before it starts succeeding.
    pub flaky_script: Mutex<VecDeque<StatusCode>>,
}

impl ServerState {
    fn mint_token(&self) -> String {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("t-{}", n);
        *self.current_token.lock().unwrap() = token.clone();
        token
    }

    fn bearer_ok(&self, headers: &HeaderMap) -> Option<String> {
        let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let token = auth.strip_prefix("Bearer ")?;
        (token == *self.current_token.lock().unwrap()).then(|| token.to_string())
    }
}

pub struct FakeApi {
    pub base_url: String,
    pub state: Arc<ServerState>,
}

impl FakeApi {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState {
            counters: Counters::default(),
            current_token: Mutex::new(String::from("never-issued")),
            issued: AtomicUsize::new(0),
            refresh_delay: Mutex::new(Duration::ZERO),
            logout_status: Mutex::new(StatusCode::OK),
            flaky_script: Mutex::new(VecDeque::new()),
        });

        let app = Router::new()
            .route("/api/Auth/login", post(login))
            .route("/api/Auth/logout", post(logout))
            .route("/api/Auth/refresh-token", post(refresh))
            .route("/api/Auth/register", post(register))
            .route("/api/Auth/forgot-password", post(forgot_password))
            .route("/api/Auth/reset-password", post(reset_password))
            .route("/api/User/profile", get(profile).put(update_profile))
            .route("/api/User/change-password", post(change_password))
            .route("/api/Flaky", get(flaky))
            .route("/api/Html", get(html))
            .route("/api/Slow", get(slow))
            .route("/api/Echo", get(echo))
            .route("/api/Revoked", get(revoked))
            .route("/api/Fields/7", delete(delete_field))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake api server");
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
        }
    }

    pub fn config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(2),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(10),
            revalidate_interval: Duration::from_millis(50),
        }
    }

    pub fn count(&self, pick: impl Fn(&Counters) -> &AtomicUsize) -> usize {
        Counters::get(pick(&self.state.counters))
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    pub fn set_logout_status(&self, status: StatusCode) {
        *self.state.logout_status.lock().unwrap() = status;
    }

    pub fn script_flaky(&self, statuses: &[StatusCode]) {
        self.state
            .flaky_script
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    /// Server-side revocation: the current token stops being accepted.
    pub fn revoke_current_token(&self) {
        *self.state.current_token.lock().unwrap() = String::from("rotated-server-side");
    }
}

pub fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

/// A manager wired to the fake API with a manual clock at `t0()`.
pub fn manager_for(api: &FakeApi) -> (SessionManager, Arc<ManualClock>) {
    manager_with_config(api.config())
}

pub fn manager_with_config(config: ApiConfig) -> (SessionManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = TokenStore::with_clock(Arc::new(MemoryStore::new()), clock.clone());
    let gateway = HttpGateway::new(config, store).expect("gateway");
    (SessionManager::new(gateway), clock)
}

// ===== Handlers =====

async fn login(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.counters.login.fetch_add(1, Ordering::SeqCst);
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        let token = state.mint_token();
        Json(json!({
            "token": token,
            "refreshToken": GOOD_REFRESH,
            "expiresIn": 3600,
            "user": {"id": 1, "email": EMAIL, "nombre": "Rosa"}
        }))
        .into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid email or password"})),
        )
            .into_response()
    }
}

async fn logout(State(state): State<Arc<ServerState>>) -> Response {
    state.counters.logout.fetch_add(1, Ordering::SeqCst);
    let status = *state.logout_status.lock().unwrap();
    (status, Json(json!({}))).into_response()
}

async fn refresh(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.counters.refresh.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    if body["refreshToken"] == GOOD_REFRESH {
        let token = state.mint_token();
        Json(json!({"token": token, "refreshToken": GOOD_REFRESH, "expiresIn": 3600})).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Refresh token revoked"})),
        )
            .into_response()
    }
}

async fn register(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.counters.register.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Registered",
            "token": "registration-token",
            "user": {"email": body["email"], "nombre": body["nombre"]}
        })),
    )
        .into_response()
}

async fn forgot_password(Json(body): Json<Value>) -> Response {
    Json(json!({"sentTo": body["email"]})).into_response()
}

async fn reset_password(Json(body): Json<Value>) -> Response {
    if body["token"] == "reset-ok" {
        Json(json!({"reset": true})).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Reset link expired"})),
        )
            .into_response()
    }
}

async fn profile(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.counters.profile.fetch_add(1, Ordering::SeqCst);
    match state.bearer_ok(&headers) {
        Some(token) => Json(json!({"id": 1, "tokenSeen": token})).into_response(),
        None => (StatusCode::UNAUTHORIZED, Json(json!({"message": "Token expired"}))).into_response(),
    }
}

async fn update_profile(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    match state.bearer_ok(&headers) {
        Some(_) => Json(body).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn change_password(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if state.bearer_ok(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body["currentPassword"] == PASSWORD && body["newPassword"].is_string() {
        Json(json!({"changed": true})).into_response()
    } else {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "Current password is wrong"})),
        )
            .into_response()
    }
}

async fn flaky(State(state): State<Arc<ServerState>>) -> Response {
    state.counters.flaky.fetch_add(1, Ordering::SeqCst);
    let next = state.flaky_script.lock().unwrap().pop_front();
    match next {
        Some(status) => (status, Json(json!({"attempt": "failed"}))).into_response(),
        None => Json(json!({"ok": true})).into_response(),
    }
}

async fn html(State(state): State<Arc<ServerState>>) -> Response {
    state.counters.html.fetch_add(1, Ordering::SeqCst);
    Html("<html><body>maintenance</body></html>").into_response()
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({"late": true})).into_response()
}

async fn echo(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Json(json!({"query": params, "authorization": auth, "accept": accept})).into_response()
}

async fn revoked(State(state): State<Arc<ServerState>>) -> Response {
    state.counters.revoked.fetch_add(1, Ordering::SeqCst);
    (StatusCode::UNAUTHORIZED, Json(json!({"message": "Revoked"}))).into_response()
}

async fn delete_field() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
