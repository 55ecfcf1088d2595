//! Durable key/value persistence for the session's credentials.
//!
//! Four string-valued keys are kept: the access token, the refresh token,
//! the absolute expiry (epoch milliseconds) and the user profile (JSON).
//! Writes are not transactional across keys, so every reader tolerates a
//! missing or garbled expiry by treating the token as not expired.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::Session;

pub const ACCESS_TOKEN_KEY: &str = "authToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const EXPIRES_AT_KEY: &str = "tokenExpiration";
pub const USER_KEY: &str = "user";

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// A token is treated as expired this long before its real expiry, so a
/// request built now does not reach the server carrying a dead token.
pub const EXPIRY_SKEW_MS: i64 = 300_000;

/// String key/value backend behind the token store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Source of "now", injectable so expiry logic can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process backend; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// JSON-file backend: a flat string map rewritten on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the session file inside `dir`.
    ///
    /// An unreadable or corrupt file starts the store empty rather than
    /// failing; the user simply has to log in again.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        let path = dir.join(SESSION_FILE);

        let values = if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
            match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(values) => values,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Discarding corrupt session file");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        if values.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove session file")?;
            }
            return Ok(());
        }
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Typed access to the four session keys.
///
/// Clone is cheap; clones share the same backend. Only `SessionManager`
/// writes through it, everything else reads.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Store backed by process memory, mostly for tests and one-shot tools.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ===== Access token =====

    pub fn access_token(&self) -> Option<String> {
        self.backend.get(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn set_access_token(&self, token: &str) -> Result<()> {
        self.backend.set(ACCESS_TOKEN_KEY, token)
    }

    /// Presence of an access token is what "authenticated" means at rest.
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    // ===== Refresh token =====

    pub fn refresh_token(&self) -> Option<String> {
        self.backend.get(REFRESH_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn set_refresh_token(&self, token: Option<&str>) -> Result<()> {
        match token {
            Some(token) => self.backend.set(REFRESH_TOKEN_KEY, token),
            None => self.backend.remove(REFRESH_TOKEN_KEY),
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token().is_some()
    }

    // ===== Expiry =====

    /// Absolute expiry, or `None` when absent or unparseable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.backend.get(EXPIRES_AT_KEY)?;
        let millis = match raw.trim().parse::<i64>() {
            Ok(millis) => millis,
            Err(_) => {
                debug!(value = %raw, "Ignoring unparseable token expiry");
                return None;
            }
        };
        Utc.timestamp_millis_opt(millis).single()
    }

    pub fn set_expires_at(&self, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        match expires_at {
            Some(at) => self
                .backend
                .set(EXPIRES_AT_KEY, &at.timestamp_millis().to_string()),
            None => self.backend.remove(EXPIRES_AT_KEY),
        }
    }

    /// Convert a relative lifetime (seconds) into an absolute expiry.
    /// Out-of-range lifetimes saturate.
    pub fn expiry_from_now(&self, expires_in_secs: i64) -> DateTime<Utc> {
        let now = self.now();
        Duration::try_seconds(expires_in_secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(if expires_in_secs < 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
    }

    /// True only if an expiry exists and `now >= expires_at - skew`.
    /// An expiry too close to the start of time to subtract the skew from
    /// is long past.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(at) => match at.checked_sub_signed(Duration::milliseconds(EXPIRY_SKEW_MS)) {
                Some(deadline) => self.now() >= deadline,
                None => true,
            },
            None => false,
        }
    }

    // ===== User =====

    /// Last known profile. A blob that fails to parse reads as "no user".
    pub fn user(&self) -> Option<Value> {
        let raw = self.backend.get(USER_KEY)?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => None,
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Stored user profile is not valid JSON");
                None
            }
        }
    }

    pub fn set_user(&self, user: Option<&Value>) -> Result<()> {
        match user {
            Some(user) => self.backend.set(USER_KEY, &serde_json::to_string(user)?),
            None => self.backend.remove(USER_KEY),
        }
    }

    // ===== Whole session =====

    pub fn session(&self) -> Option<Session> {
        Some(Session {
            access_token: self.access_token()?,
            refresh_token: self.refresh_token(),
            expires_at: self.expires_at(),
            user: self.user(),
        })
    }

    /// Remove all four keys. Every removal is attempted even if an earlier
    /// one fails; the first failure is returned.
    pub fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, USER_KEY] {
            if let Err(e) = self.backend.remove(key) {
                warn!(key = key, error = %e, "Failed to clear stored credential");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
